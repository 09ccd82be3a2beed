use herald_bus::BusError;
use thiserror::Error;

/// Result type for scheduler operations
pub type SchedulerResult<T> = Result<T, SchedulerError>;

#[derive(Error, Debug, Clone)]
pub enum SchedulerError {
    #[error("Job '{job}' of subscriber '{subscriber}' is aborted")]
    JobAborted { subscriber: String, job: String },

    #[error("Partition {partition} is out of range for job '{job}' ({count} partition(s))")]
    InvalidPartition {
        job: String,
        partition: u32,
        count: u32,
    },

    #[error("Could not publish {what} to '{entity}'")]
    PublishFailed { entity: String, what: &'static str },

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
