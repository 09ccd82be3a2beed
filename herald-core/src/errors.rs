//! # Handler failures
//!
//! Handlers never throw at the dispatcher. They return a [`HandlerResult`],
//! and the failure side is a tagged [`HandlerError`] so the dead-letter
//! classifier is a plain `match` instead of a catch-all.
//!
//! Code that already works in `anyhow` can keep doing so:
//! - wrap a `HandlerError` into `anyhow::Error` with `?` or `.into()`
//! - recover it with [`HandlerError::normalize`], which keeps a tagged error
//!   lossless and turns anything else into [`HandlerError::Unhandled`]

use std::fmt;

use anyhow::Error as AnyError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type returned by message and job handlers.
pub type HandlerResult<T = ()> = std::result::Result<T, HandlerError>;

/// Severity attached to a [`Critic`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Default for Severity {
    fn default() -> Self {
        Self::Error
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// A structured business or validation finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Critic {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl Critic {
    pub fn new(code: impl Into<String>, message: impl Into<String>, severity: Severity) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            severity,
            field: None,
        }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(code, message, Severity::Error)
    }

    pub fn critical(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(code, message, Severity::Critical)
    }

    /// Attach the offending field (dotted path, e.g. `order.lines[2].qty`).
    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }
}

/// Discriminant of a [`HandlerError`], handy for metrics labels and matching
/// without borrowing the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    OptimisticConflict,
    InvalidInput,
    BusinessValidation,
    Authorization,
    Unhandled,
}

impl FailureKind {
    pub fn name(&self) -> &'static str {
        match self {
            FailureKind::OptimisticConflict => "OptimisticConflict",
            FailureKind::InvalidInput => "InvalidInput",
            FailureKind::BusinessValidation => "BusinessValidation",
            FailureKind::Authorization => "Authorization",
            FailureKind::Unhandled => "Unhandled",
        }
    }

    /// Failures that can never succeed on redelivery.
    pub fn is_permanent(&self) -> bool {
        !matches!(self, FailureKind::Unhandled | FailureKind::OptimisticConflict)
    }
}

/// Classified failure of a handler invocation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Another writer won; carries the single conflicting-field critic.
    #[error("Optimistic concurrency conflict: {}", .0.message)]
    OptimisticConflict(Critic),

    /// Field-level input errors (including undecodable payloads).
    #[error("Invalid input: {} error(s)", .0.len())]
    InvalidInput(Vec<Critic>),

    /// The input was well-formed but violated business rules.
    #[error("Business validation failed: {} critic(s)", .0.len())]
    BusinessValidation(Vec<Critic>),

    /// Missing principal or failed role/policy check.
    #[error("Not authorized: {0}")]
    Authorization(String),

    /// Anything else, with the full error text.
    #[error("{0}")]
    Unhandled(String),
}

impl HandlerError {
    pub fn kind(&self) -> FailureKind {
        match self {
            HandlerError::OptimisticConflict(_) => FailureKind::OptimisticConflict,
            HandlerError::InvalidInput(_) => FailureKind::InvalidInput,
            HandlerError::BusinessValidation(_) => FailureKind::BusinessValidation,
            HandlerError::Authorization(_) => FailureKind::Authorization,
            HandlerError::Unhandled(_) => FailureKind::Unhandled,
        }
    }

    pub fn optimistic_conflict(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::OptimisticConflict(Critic::error("OptimisticConflict", message).with_field(field))
    }

    pub fn invalid_input(critics: Vec<Critic>) -> Self {
        Self::InvalidInput(critics)
    }

    pub fn business(critics: Vec<Critic>) -> Self {
        Self::BusinessValidation(critics)
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Authorization(msg.into())
    }

    pub fn unhandled(msg: impl fmt::Display) -> Self {
        Self::Unhandled(msg.to_string())
    }

    /// A payload that could not be decoded into the handler's declared type.
    pub fn undecodable(err: &serde_json::Error) -> Self {
        let critic = Critic::error("InvalidPayload", err.to_string())
            .with_field(format!("line {} column {}", err.line(), err.column()));
        Self::InvalidInput(vec![critic])
    }

    /// Recover a tagged error out of `anyhow`, or wrap anything else as
    /// `Unhandled` with its full cause chain.
    pub fn normalize(err: AnyError) -> HandlerError {
        match err.downcast::<HandlerError>() {
            Ok(tagged) => tagged,
            Err(other) => HandlerError::Unhandled(format!("{other:#}")),
        }
    }
}

impl From<AnyError> for HandlerError {
    fn from(err: AnyError) -> Self {
        HandlerError::normalize(err)
    }
}
