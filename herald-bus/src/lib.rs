//! # herald-bus: message dispatch for Herald services
//!
//! Handlers are declared once, in code, and bound to queues, topic
//! subscriptions or scheduled jobs. The host runs one consumer loop per
//! binding and every delivered message ends in exactly one of two places:
//! completed, or dead-lettered with a classified reason.
//!
//! - **Explicit registry**: bindings are listed at startup and validated
//!   before anything runs (duplicates, missing connection keys, unknown
//!   policies)
//! - **Hard concurrency cap**: `max_concurrent_calls` slots per entity, taken
//!   before a message is received and released after it is settled
//! - **Classified failures**: handler outcomes are an explicit
//!   [`HandlerError`](herald_core::HandlerError), mapped to fixed dead-letter
//!   reasons with bounded descriptions
//! - **Reference transport**: [`MemoryTransport`] implements peek-lock,
//!   label-filtered subscriptions, TTL, scheduled delivery and lock expiry
//!
//! ```rust,ignore
//! use herald_bus::prelude::*;
//!
//! struct OrderPlaced;
//!
//! #[async_trait]
//! impl MessageHandler for OrderPlaced {
//!     type Payload = Envelope<Order>;
//!
//!     async fn handle(&self, order: Self::Payload, ctx: HandlerContext) -> HandlerResult {
//!         // ...
//!         Ok(())
//!     }
//! }
//!
//! let registry = Registry::builder()
//!     .queue(QueueBinding::new("orders", "primary", OrderPlaced).with_max_concurrent_calls(8))
//!     .build()?;
//!
//! let transport: Arc<dyn Transport> = Arc::new(MemoryTransport::new());
//! let host = BusHost::new(Arc::new(registry), Connections::new().with("primary", transport));
//! let handle = host.start().await?;
//! ```

pub mod classifier;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod health;
pub mod host;
pub mod job;
pub mod observability;
pub mod registry;
pub mod sanitize;
pub mod sender;
pub mod transport;
pub mod types;

pub use classifier::{Classification, DeadLetterClassifier};
pub use config::BusConfig;
pub use dispatcher::{DispatchOutcome, DrainReport, MessageDispatcher};
pub use error::{BusError, BusResult, RegistryError};
pub use handler::{
    Envelope, ErasedMessageHandler, HandlerContext, MessageHandler, Payload, PreparedInvocation,
};
pub use health::{EntityHealth, HealthCheck, HealthReport};
pub use host::{BusHost, Connections, HostHandle, ShutdownReport};
pub use job::{
    Frequency, JobBinding, JobContext, JobDescriptor, JobHandler, JobRegistry, JobSchedule,
    JobStatus,
};
pub use observability::{
    BusMetrics, DispatchMetrics, RecordingTelemetry, Telemetry, TracingTelemetry,
};
pub use registry::{HandlerDescriptor, QueueBinding, Registry, TopicBinding};
pub use sender::{MessageSender, SendOutcome};
pub use transport::{LockReaper, MemoryTransport, Transport};
pub use types::{
    BusEvent, DeadLetterRecord, DeliveryMode, EntityPath, InboundMessage, LockToken, MessageId,
    OutboundMessage, SequenceNumber, SubscriptionFilter,
};

#[cfg(feature = "tracing-basic")]
pub use observability::init_tracing;

pub mod prelude {
    pub use crate::{
        BusConfig, BusError, BusHost, BusResult, Connections, DeliveryMode, EntityPath, Envelope,
        HandlerContext, JobBinding, JobContext, JobHandler, JobRegistry, JobSchedule,
        MemoryTransport, MessageHandler, MessageSender, OutboundMessage, QueueBinding, Registry,
        SubscriptionFilter, TopicBinding, Transport,
    };

    pub use herald_core::{
        AuthRequirement, Critic, HandlerError, HandlerResult, Principal, TransactionContext,
    };

    pub use async_trait::async_trait;
}
