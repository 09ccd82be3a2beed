use thiserror::Error;

use crate::types::{LockToken, SequenceNumber};

/// Result type for bus operations
pub type BusResult<T> = Result<T, BusError>;

/// Infrastructure errors raised by transports, the host and the sender.
///
/// Handler failures never show up here; they are [`herald_core::HandlerError`]s
/// and end in a dead-letter, not in a `BusError`.
#[derive(Error, Debug, Clone)]
pub enum BusError {
    #[error("Messaging entity not found: {0}")]
    EntityNotFound(String),

    #[error("Operation not supported on entity '{entity}': {reason}")]
    InvalidEntity { entity: String, reason: String },

    #[error("Message lock lost or expired: {0}")]
    LockLost(LockToken),

    #[error("Scheduled message not found: {0}")]
    ScheduledMessageNotFound(SequenceNumber),

    #[error("Property '{name}' too long: {len} chars (max: {max})")]
    PropertyTooLong {
        name: &'static str,
        len: usize,
        max: usize,
    },

    #[error("No transport registered for connection key '{0}'")]
    UnknownConnection(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BusError {
    /// Errors the sender answers with create-then-retry.
    pub fn is_entity_not_found(&self) -> bool {
        matches!(self, Self::EntityNotFound(_))
    }
}

impl From<serde_json::Error> for BusError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Malformed handler declarations. Any of these stops startup.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Handler for '{entity}' declares no connection key")]
    MissingConnectionKey { entity: String },

    #[error("Duplicate handler for '{entity}'")]
    DuplicateHandler { entity: String },

    #[error("Duplicate job '{0}'")]
    DuplicateJob(String),

    #[error("Handler '{handler}' references unknown policy '{policy}'")]
    UnknownPolicy { handler: String, policy: String },

    #[error("Handler for '{entity}' declares max_concurrent_calls = 0")]
    InvalidConcurrency { entity: String },

    #[error("Job '{job}' has an invalid schedule: {reason}")]
    InvalidSchedule { job: String, reason: String },
}
