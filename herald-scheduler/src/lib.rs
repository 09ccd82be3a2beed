//! # herald-scheduler: two-tier job scheduling over herald-bus
//!
//! Every service instance runs a [`JobScheduler`] next to its jobs. At
//! start it sends one `Register` per job to the command queue, then serves
//! fire events from a dispatch-topic subscription filtered on its subscriber
//! id. A single [`CentralScheduler`] consumes the command queue, keeps the
//! [`JobCatalog`] and publishes fires, each of which resolves to
//! `Acknowledged`, `NotFound` or `TimedOut`.
//!
//! ```rust,ignore
//! // instance side
//! let sender = host.sender("primary")?;
//! let local = JobScheduler::new("notifications-svc", jobs, sender, config.clone());
//! let registry = Registry::builder().topic(local.binding()).build()?;
//!
//! // central side
//! let central = CentralScheduler::new(Arc::new(MemoryJobCatalog::new()), sender, config);
//! let registry = Registry::builder().queue(central.binding()).build()?;
//!
//! let pending = central.fire("notifications-svc", "SendDigest", 0, json!({}), None).await?;
//! let outcome = pending.outcome().await;
//! ```

pub mod catalog;
pub mod central;
pub mod config;
pub mod error;
pub mod local;
pub mod protocol;

pub use catalog::{CatalogEntry, FireOutcome, JobCatalog, MemoryJobCatalog};
pub use central::{CentralScheduler, PendingDispatch};
pub use config::SchedulerConfig;
pub use error::{SchedulerError, SchedulerResult};
pub use local::{JobScheduler, SchedulerState};
pub use protocol::{CommandType, DispatchType, JobDispatch, SchedulerCommand};
