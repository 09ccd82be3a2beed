use std::collections::VecDeque;
use std::time::Duration;

use herald_core::FailureKind;
use parking_lot::Mutex;
use tracing::{error, warn};

use crate::types::MessageId;

/// A handler failure, after classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchFailure {
    pub entity: String,
    pub message_id: Option<MessageId>,
    pub operation_id: Option<String>,
    pub kind: FailureKind,
    pub reason: &'static str,
    pub description: String,
    /// False when the message could not be parked (receive-and-delete, lost lock).
    pub dead_lettered: bool,
}

/// A message that could not be sent, with sensitive fields already removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissedMessage {
    pub entity: String,
    pub message_id: MessageId,
    pub label: Option<String>,
    pub error: String,
    pub sanitized_body: String,
}

/// No reply arrived for a job fire within the reply timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyTimeout {
    pub dispatch_id: String,
    pub job_name: String,
    pub subscriber_id: String,
    pub partition: u32,
    pub waited: Duration,
}

/// Telemetry collaborator. Every dispatch failure ends up here, whether or
/// not it could be dead-lettered.
pub trait Telemetry: Send + Sync {
    fn track_dispatch_failure(&self, failure: &DispatchFailure);

    fn track_missed_message(&self, missed: &MissedMessage);

    fn track_reply_timeout(&self, timeout: &ReplyTimeout);
}

/// Reports through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

impl Telemetry for TracingTelemetry {
    fn track_dispatch_failure(&self, failure: &DispatchFailure) {
        error!(
            entity = %failure.entity,
            message_id = ?failure.message_id.as_ref().map(|m| m.as_str()),
            operation_id = ?failure.operation_id,
            kind = failure.kind.name(),
            dead_lettered = failure.dead_lettered,
            "{}: {}",
            failure.reason,
            failure.description
        );
    }

    fn track_missed_message(&self, missed: &MissedMessage) {
        warn!(
            entity = %missed.entity,
            message_id = %missed.message_id,
            label = ?missed.label,
            body = %missed.sanitized_body,
            "Missed message: {}",
            missed.error
        );
    }

    fn track_reply_timeout(&self, timeout: &ReplyTimeout) {
        warn!(
            dispatch_id = %timeout.dispatch_id,
            job = %timeout.job_name,
            subscriber = %timeout.subscriber_id,
            partition = timeout.partition,
            "No reply within {:?}",
            timeout.waited
        );
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TelemetryEvent {
    DispatchFailure(DispatchFailure),
    MissedMessage(MissedMessage),
    ReplyTimeout(ReplyTimeout),
}

/// Events kept by [`RecordingTelemetry::new`].
pub const DEFAULT_RECORDING_CAPACITY: usize = 1024;

/// Keeps the most recent events in memory, for tests and diagnostics
/// endpoints. Once `capacity` is reached the oldest event is dropped.
#[derive(Debug)]
pub struct RecordingTelemetry {
    events: Mutex<VecDeque<TelemetryEvent>>,
    capacity: usize,
}

impl Default for RecordingTelemetry {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_RECORDING_CAPACITY)
    }
}

impl RecordingTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_RECORDING_CAPACITY))),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Oldest first.
    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().iter().cloned().collect()
    }

    fn record(&self, event: TelemetryEvent) {
        let mut events = self.events.lock();
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    pub fn dispatch_failures(&self) -> Vec<DispatchFailure> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                TelemetryEvent::DispatchFailure(f) => Some(f.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn missed_messages(&self) -> Vec<MissedMessage> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                TelemetryEvent::MissedMessage(m) => Some(m.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn reply_timeouts(&self) -> Vec<ReplyTimeout> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                TelemetryEvent::ReplyTimeout(t) => Some(t.clone()),
                _ => None,
            })
            .collect()
    }
}

impl Telemetry for RecordingTelemetry {
    fn track_dispatch_failure(&self, failure: &DispatchFailure) {
        self.record(TelemetryEvent::DispatchFailure(failure.clone()));
    }

    fn track_missed_message(&self, missed: &MissedMessage) {
        self.record(TelemetryEvent::MissedMessage(missed.clone()));
    }

    fn track_reply_timeout(&self, timeout: &ReplyTimeout) {
        self.record(TelemetryEvent::ReplyTimeout(timeout.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn failure() -> DispatchFailure {
        DispatchFailure {
            entity: "orders".into(),
            message_id: Some(MessageId::from("m-1")),
            operation_id: Some("op-1".into()),
            kind: FailureKind::BusinessValidation,
            reason: "Critical business errors occurred",
            description: "[]".into(),
            dead_lettered: true,
        }
    }

    #[test]
    #[traced_test]
    fn tracing_telemetry_logs_failures() {
        TracingTelemetry.track_dispatch_failure(&failure());

        assert!(logs_contain("Critical business errors occurred"));
        assert!(logs_contain("BusinessValidation"));
    }

    #[test]
    fn recording_telemetry_sorts_events_by_kind() {
        let telemetry = RecordingTelemetry::new();
        telemetry.track_dispatch_failure(&failure());
        telemetry.track_reply_timeout(&ReplyTimeout {
            dispatch_id: "d-1".into(),
            job_name: "SendDigest".into(),
            subscriber_id: "notifications-svc".into(),
            partition: 0,
            waited: Duration::from_secs(1),
        });

        assert_eq!(telemetry.events().len(), 2);
        assert_eq!(telemetry.dispatch_failures().len(), 1);
        assert_eq!(telemetry.reply_timeouts()[0].job_name, "SendDigest");
        assert!(telemetry.missed_messages().is_empty());
    }

    #[test]
    fn recording_telemetry_keeps_only_the_latest_events() {
        let telemetry = RecordingTelemetry::with_capacity(3);
        for n in 0..5 {
            telemetry.track_dispatch_failure(&DispatchFailure {
                description: format!("failure {n}"),
                ..failure()
            });
        }

        let kept: Vec<String> = telemetry
            .dispatch_failures()
            .into_iter()
            .map(|f| f.description)
            .collect();
        assert_eq!(kept, vec!["failure 2", "failure 3", "failure 4"]);
        assert_eq!(telemetry.capacity(), 3);
    }
}
