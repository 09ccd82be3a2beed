pub mod metrics;
pub mod telemetry;

#[cfg(feature = "tracing-basic")]
pub mod subscriber;

pub use metrics::{BusMetrics, DispatchMetrics, DispatchSnapshot, InFlightGuard};
pub use telemetry::{
    DispatchFailure, MissedMessage, RecordingTelemetry, ReplyTimeout, Telemetry, TelemetryEvent,
    TracingTelemetry,
};

#[cfg(feature = "tracing-basic")]
pub use subscriber::init_tracing;
