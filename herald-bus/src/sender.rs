use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::{
    observability::{BusMetrics, MissedMessage, Telemetry},
    sanitize::sanitized_body,
    transport::Transport,
    types::{EntityPath, OutboundMessage},
    BusResult,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// The entity was missing, got created, and the single retry went through.
    SentAfterCreate,
    /// Given up on; recorded as a missed message.
    Missed,
}

impl SendOutcome {
    pub fn is_sent(self) -> bool {
        !matches!(self, Self::Missed)
    }
}

/// Producer side of a connection.
///
/// A send never fails the caller: a missing entity is created and the send
/// retried exactly once, anything else becomes a missed-message trace.
#[derive(Clone)]
pub struct MessageSender {
    transport: Arc<dyn Transport>,
    telemetry: Arc<dyn Telemetry>,
    metrics: Arc<BusMetrics>,
}

impl MessageSender {
    pub fn new(
        transport: Arc<dyn Transport>,
        telemetry: Arc<dyn Telemetry>,
        metrics: Arc<BusMetrics>,
    ) -> Self {
        Self {
            transport,
            telemetry,
            metrics,
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    #[instrument(skip(self, message), fields(entity = %entity, message_id = %message.message_id))]
    pub async fn send(&self, entity: &EntityPath, message: OutboundMessage) -> SendOutcome {
        let first = match self.transport.send(entity, message.clone()).await {
            Ok(()) => {
                self.metrics.increment_sent();
                return SendOutcome::Sent;
            }
            Err(e) => e,
        };

        if !first.is_entity_not_found() {
            return self.missed(entity, &message, first.to_string());
        }

        debug!("Entity {} not found, creating it", entity);
        if let Err(e) = self.transport.create_entity(entity).await {
            return self.missed(entity, &message, format!("{first}; create failed: {e}"));
        }

        match self.transport.send(entity, message.clone()).await {
            Ok(()) => {
                self.metrics.increment_sent();
                SendOutcome::SentAfterCreate
            }
            Err(e) => self.missed(entity, &message, e.to_string()),
        }
    }

    /// Serialize `payload` as JSON and send it. Only serialization errors
    /// surface here.
    pub async fn send_json<T: Serialize>(
        &self,
        entity: &EntityPath,
        label: Option<&str>,
        payload: &T,
    ) -> BusResult<SendOutcome> {
        let mut message = OutboundMessage::json(payload)?;
        if let Some(label) = label {
            message = message.with_label(label);
        }
        Ok(self.send(entity, message).await)
    }

    fn missed(&self, entity: &EntityPath, message: &OutboundMessage, error: String) -> SendOutcome {
        warn!("Giving up on message {} to {}: {}", message.message_id, entity, error);
        self.metrics.increment_missed();
        self.telemetry.track_missed_message(&MissedMessage {
            entity: entity.to_string(),
            message_id: message.message_id.clone(),
            label: message.label.clone(),
            error,
            sanitized_body: sanitized_body(&message.body),
        });
        SendOutcome::Missed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::RecordingTelemetry;
    use crate::transport::MemoryTransport;
    use crate::types::DeliveryMode;
    use serde_json::json;
    use std::time::Duration;

    fn sender(
        transport: &MemoryTransport,
    ) -> (MessageSender, Arc<RecordingTelemetry>, Arc<BusMetrics>) {
        let telemetry = Arc::new(RecordingTelemetry::new());
        let metrics = Arc::new(BusMetrics::new());
        let sender = MessageSender::new(
            Arc::new(transport.clone()),
            telemetry.clone(),
            metrics.clone(),
        );
        (sender, telemetry, metrics)
    }

    #[tokio::test]
    async fn missing_queue_is_created_and_retried_once() {
        let transport = MemoryTransport::new();
        let (sender, telemetry, metrics) = sender(&transport);
        let orders = EntityPath::queue("orders");

        let outcome = sender.send_json(&orders, None, &json!({"id": 1})).await.unwrap();
        assert_eq!(outcome, SendOutcome::SentAfterCreate);

        let outcome = sender.send_json(&orders, None, &json!({"id": 2})).await.unwrap();
        assert_eq!(outcome, SendOutcome::Sent);

        assert_eq!(transport.active_message_count(&orders), 2);
        assert_eq!(metrics.messages_sent(), 2);
        assert!(telemetry.missed_messages().is_empty());

        let first = transport
            .receive(&orders, DeliveryMode::ReceiveAndDelete, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.body, br#"{"id":1}"#);
    }

    #[tokio::test]
    async fn other_failures_become_missed_messages_without_secrets() {
        let transport = MemoryTransport::new();
        let (sender, telemetry, metrics) = sender(&transport);

        // Subscriptions are not a send target; no create/retry applies.
        let target = EntityPath::subscription("events", "audit");
        let body = json!({"password": "p", "refreshToken": "r", "n": 1});
        let outcome = sender
            .send_json(&target, Some("audit"), &body)
            .await
            .unwrap();

        assert_eq!(outcome, SendOutcome::Missed);
        assert_eq!(metrics.messages_missed(), 1);

        let missed = telemetry.missed_messages();
        assert_eq!(missed.len(), 1);
        assert_eq!(missed[0].sanitized_body, r#"{"n":1}"#);
        assert_eq!(missed[0].label.as_deref(), Some("audit"));
    }
}
