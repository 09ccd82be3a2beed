//! herald-core: transport-agnostic core for Herald.
//!
//! Holds the pieces every other Herald crate speaks in:
//! - the handler failure taxonomy ([`HandlerError`], [`Critic`])
//! - the per-invocation [`TransactionContext`] and its [`Principal`]
//! - authorization requirements resolved once at registration
//! - a small key/value configuration store

pub mod auth;
pub mod config;
pub mod context;
pub mod errors;

pub use auth::{
    AuthRequirement, AuthorizationPolicy, ClaimPolicy, PolicySet, ResolvedAuth, UnknownPolicy,
};
pub use config::{HeraldConfig, HeraldConfigSnapshot};
pub use context::{Principal, TransactionContext};
pub use errors::{Critic, FailureKind, HandlerError, HandlerResult, Severity};
