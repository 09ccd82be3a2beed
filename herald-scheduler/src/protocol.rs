//! Wire messages between job schedulers and the central scheduler.
//!
//! Instances send [`SchedulerCommand`]s to the command queue. The central
//! scheduler publishes [`JobDispatch`] events on the dispatch topic, labeled
//! with the owning subscriber id so each instance only sees its own jobs.

use herald_bus::{Frequency, JobSchedule, JobStatus, Payload};
use herald_core::{Critic, HandlerError, TransactionContext};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandType {
    Register,
    Abort,
    Acknowledge,
    NotFound,
}

/// Instance to central.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerCommand {
    pub command_type: CommandType,
    pub subscriber_id: String,
    pub job_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency: Option<Frequency>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day_of_month: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day_of_week: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hour: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minute: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
    /// The fire being answered (Acknowledge/NotFound).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispatch_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_context: Option<TransactionContext>,
}

impl SchedulerCommand {
    fn bare(command_type: CommandType, subscriber_id: &str, job_name: &str) -> Self {
        Self {
            command_type,
            subscriber_id: subscriber_id.to_string(),
            job_name: job_name.to_string(),
            frequency: None,
            partition_count: None,
            day_of_month: None,
            day_of_week: None,
            hour: None,
            minute: None,
            status: None,
            dispatch_id: None,
            partition: None,
            transaction_context: None,
        }
    }

    pub fn register(
        subscriber_id: &str,
        job_name: &str,
        schedule: &JobSchedule,
        status: JobStatus,
    ) -> Self {
        Self {
            frequency: Some(schedule.frequency),
            partition_count: Some(schedule.partition_count),
            day_of_month: schedule.day_of_month,
            day_of_week: schedule.day_of_week,
            hour: schedule.hour,
            minute: schedule.minute,
            status: Some(status),
            ..Self::bare(CommandType::Register, subscriber_id, job_name)
        }
    }

    pub fn abort(subscriber_id: &str, job_name: &str) -> Self {
        Self::bare(CommandType::Abort, subscriber_id, job_name)
    }

    pub fn acknowledge(dispatch: &JobDispatch) -> Self {
        Self::reply(CommandType::Acknowledge, dispatch)
    }

    pub fn not_found(dispatch: &JobDispatch) -> Self {
        Self::reply(CommandType::NotFound, dispatch)
    }

    fn reply(command_type: CommandType, dispatch: &JobDispatch) -> Self {
        Self {
            dispatch_id: Some(dispatch.dispatch_id.clone()),
            partition: Some(dispatch.partition),
            transaction_context: dispatch.transaction_context.clone(),
            ..Self::bare(command_type, &dispatch.subscriber_id, &dispatch.job_name)
        }
    }

    /// The schedule a Register carries.
    pub fn schedule(&self) -> Option<JobSchedule> {
        Some(JobSchedule {
            frequency: self.frequency?,
            partition_count: self.partition_count?,
            day_of_month: self.day_of_month,
            day_of_week: self.day_of_week,
            hour: self.hour,
            minute: self.minute,
        })
    }

    /// Check the fields the command type requires. Failures are input
    /// errors, so a bad command is dead-lettered rather than retried.
    pub fn validate(&self) -> Result<(), HandlerError> {
        let mut critics = Vec::new();

        if self.subscriber_id.trim().is_empty() {
            critics.push(
                Critic::error("Required", "subscriberId is required").with_field("subscriberId"),
            );
        }
        if self.job_name.trim().is_empty() {
            critics.push(Critic::error("Required", "jobName is required").with_field("jobName"));
        }

        match self.command_type {
            CommandType::Register => match self.schedule() {
                None => critics.push(
                    Critic::error("Required", "Register requires frequency and partitionCount")
                        .with_field("frequency"),
                ),
                Some(schedule) => {
                    if let Err(reason) = schedule.validate() {
                        critics.push(Critic::error("InvalidSchedule", reason));
                    }
                }
            },
            CommandType::Acknowledge | CommandType::NotFound => {
                if self.dispatch_id.as_deref().map_or(true, str::is_empty) {
                    critics.push(
                        Critic::error("Required", "replies must reference a dispatchId")
                            .with_field("dispatchId"),
                    );
                }
            }
            CommandType::Abort => {}
        }

        if critics.is_empty() {
            Ok(())
        } else {
            Err(HandlerError::invalid_input(critics))
        }
    }
}

impl Payload for SchedulerCommand {
    fn transaction_context(&self) -> Option<&TransactionContext> {
        self.transaction_context.as_ref()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DispatchType {
    Fire,
    Abort,
}

/// Central to instance. Sent with label = `subscriber_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDispatch {
    pub command_type: DispatchType,
    pub dispatch_id: String,
    pub job_name: String,
    pub subscriber_id: String,
    #[serde(default)]
    pub partition: u32,
    #[serde(default)]
    pub activation_payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_context: Option<TransactionContext>,
}

impl JobDispatch {
    pub fn fire(
        subscriber_id: &str,
        job_name: &str,
        partition: u32,
        activation_payload: Value,
    ) -> Self {
        Self {
            command_type: DispatchType::Fire,
            dispatch_id: Uuid::new_v4().to_string(),
            job_name: job_name.to_string(),
            subscriber_id: subscriber_id.to_string(),
            partition,
            activation_payload,
            transaction_context: None,
        }
    }

    pub fn abort(subscriber_id: &str, job_name: &str) -> Self {
        Self {
            command_type: DispatchType::Abort,
            activation_payload: Value::Null,
            ..Self::fire(subscriber_id, job_name, 0, Value::Null)
        }
    }

    pub fn with_context(mut self, ctx: TransactionContext) -> Self {
        self.transaction_context = Some(ctx);
        self
    }
}

impl Payload for JobDispatch {
    fn transaction_context(&self) -> Option<&TransactionContext> {
        self.transaction_context.as_ref()
    }
}
