pub mod registry;

use std::any::type_name;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use herald_core::{AuthRequirement, HandlerResult, ResolvedAuth, TransactionContext};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use registry::{JobRegistry, JobRegistryBuilder, JobStatusTable};

/// How often a job fires. Computing the actual fire times is done upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Frequency {
    Minutely,
    Hourly,
    Daily,
    Weekly,
    Monthly,
    /// Fired only on explicit request.
    OnDemand,
}

/// Job status shared between the local table and the central catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum JobStatus {
    #[default]
    Running,
    Aborted,
}

/// Declared schedule of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSchedule {
    pub frequency: Frequency,
    pub partition_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day_of_month: Option<u8>,
    /// 0 = Sunday
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day_of_week: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hour: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minute: Option<u8>,
}

impl JobSchedule {
    pub fn new(frequency: Frequency) -> Self {
        Self {
            frequency,
            partition_count: 1,
            day_of_month: None,
            day_of_week: None,
            hour: None,
            minute: None,
        }
    }

    pub fn daily() -> Self {
        Self::new(Frequency::Daily)
    }

    pub fn hourly() -> Self {
        Self::new(Frequency::Hourly)
    }

    pub fn with_partitions(mut self, partition_count: u32) -> Self {
        self.partition_count = partition_count;
        self
    }

    pub fn at(mut self, hour: u8, minute: u8) -> Self {
        self.hour = Some(hour);
        self.minute = Some(minute);
        self
    }

    pub fn on_day_of_month(mut self, day: u8) -> Self {
        self.day_of_month = Some(day);
        self
    }

    pub fn on_day_of_week(mut self, day: u8) -> Self {
        self.day_of_week = Some(day);
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.partition_count == 0 {
            return Err("partition_count must be at least 1".to_string());
        }
        check_range("day_of_month", self.day_of_month, 1, 31)?;
        check_range("day_of_week", self.day_of_week, 0, 6)?;
        check_range("hour", self.hour, 0, 23)?;
        check_range("minute", self.minute, 0, 59)?;
        Ok(())
    }
}

fn check_range(field: &str, value: Option<u8>, min: u8, max: u8) -> Result<(), String> {
    match value {
        Some(v) if v < min || v > max => Err(format!("{field} = {v} is outside {min}..={max}")),
        _ => Ok(()),
    }
}

/// Everything a job invocation gets from its fire event.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_name: String,
    pub partition: u32,
    pub activation_payload: Value,
    pub transaction: TransactionContext,
}

/// A scheduled job. A fresh instance is built for every fire.
#[async_trait]
pub trait JobHandler: Send + 'static {
    async fn run(&mut self, ctx: JobContext) -> HandlerResult;
}

type JobFactory = Arc<dyn Fn() -> Box<dyn JobHandler> + Send + Sync>;

/// Declaration of one job.
pub struct JobBinding {
    pub name: String,
    pub schedule: JobSchedule,
    pub auth: AuthRequirement,
    handler_type: &'static str,
    factory: JobFactory,
}

impl JobBinding {
    pub fn new<J, F>(name: impl Into<String>, schedule: JobSchedule, factory: F) -> Self
    where
        J: JobHandler,
        F: Fn() -> J + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            schedule,
            auth: AuthRequirement::none(),
            handler_type: type_name::<J>(),
            factory: Arc::new(move || Box::new(factory()) as Box<dyn JobHandler>),
        }
    }

    pub fn with_auth(mut self, auth: AuthRequirement) -> Self {
        self.auth = auth;
        self
    }
}

/// A registered job, read-only for the process lifetime.
pub struct JobDescriptor {
    pub name: String,
    pub schedule: JobSchedule,
    pub auth: ResolvedAuth,
    pub handler_type: &'static str,
    factory: JobFactory,
}

impl JobDescriptor {
    /// Build a fresh handler instance for one fire.
    pub fn instantiate(&self) -> Box<dyn JobHandler> {
        (self.factory)()
    }
}

impl fmt::Debug for JobDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobDescriptor")
            .field("name", &self.name)
            .field("schedule", &self.schedule)
            .field("auth", &self.auth)
            .field("handler_type", &self.handler_type)
            .finish()
    }
}
