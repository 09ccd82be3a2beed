//! Broker reachability check.
//!
//! A check schedules a message far in the future on an entity and cancels it
//! straight away. Both calls succeeding means the broker is reachable and the
//! entity exists; nothing is ever delivered.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::{
    transport::{after, Transport},
    types::{EntityPath, OutboundMessage},
};

pub const HEALTH_CHECK_LABEL: &str = "herald-health-check";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityHealth {
    pub entity: EntityPath,
    pub connection_key: String,
    /// `None` when healthy.
    pub error: Option<String>,
}

impl EntityHealth {
    pub fn is_healthy(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct HealthReport {
    pub checked_at: DateTime<Utc>,
    pub entities: Vec<EntityHealth>,
}

impl HealthReport {
    /// True when every checked entity answered. An empty report is healthy.
    pub fn is_healthy(&self) -> bool {
        self.entities.iter().all(EntityHealth::is_healthy)
    }

    pub fn unhealthy(&self) -> impl Iterator<Item = &EntityHealth> {
        self.entities.iter().filter(|e| !e.is_healthy())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HealthCheck {
    horizon: Duration,
}

impl HealthCheck {
    pub fn new(horizon: Duration) -> Self {
        Self { horizon }
    }

    /// Check one sendable entity (a queue or a topic).
    pub async fn check_entity(
        &self,
        transport: &dyn Transport,
        entity: &EntityPath,
        connection_key: &str,
    ) -> EntityHealth {
        let error = match self.schedule_and_cancel(transport, entity).await {
            Ok(()) => {
                debug!("Health check on {} succeeded", entity);
                None
            }
            Err(e) => {
                warn!("Health check on {} failed: {}", entity, e);
                Some(e)
            }
        };

        EntityHealth {
            entity: entity.clone(),
            connection_key: connection_key.to_string(),
            error,
        }
    }

    async fn schedule_and_cancel(
        &self,
        transport: &dyn Transport,
        entity: &EntityPath,
    ) -> Result<(), String> {
        let message = OutboundMessage::new(b"{}".to_vec()).with_label(HEALTH_CHECK_LABEL);
        let enqueue_at = after(Utc::now(), self.horizon);

        let sequence = transport
            .schedule(entity, message, enqueue_at)
            .await
            .map_err(|e| format!("schedule failed: {e}"))?;

        transport
            .cancel_scheduled(entity, sequence)
            .await
            .map_err(|e| format!("cancel of {sequence} failed: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;

    #[tokio::test]
    async fn check_leaves_nothing_scheduled() {
        let transport = MemoryTransport::new();
        let orders = EntityPath::queue("orders");
        transport.create_entity(&orders).await.unwrap();

        let check = HealthCheck::new(Duration::from_secs(3650 * 24 * 60 * 60));
        let health = check.check_entity(&transport, &orders, "primary").await;

        assert!(health.is_healthy());
        assert_eq!(transport.scheduled_message_count(), 0);
    }

    #[tokio::test]
    async fn missing_entity_is_reported() {
        let transport = MemoryTransport::new();
        let check = HealthCheck::new(Duration::from_secs(60));

        let health = check
            .check_entity(&transport, &EntityPath::topic("ghost"), "primary")
            .await;

        assert!(!health.is_healthy());
        assert!(health.error.as_ref().unwrap().starts_with("schedule failed"));

        let report = HealthReport {
            checked_at: Utc::now(),
            entities: vec![health],
        };
        assert!(!report.is_healthy());
        assert_eq!(report.unhealthy().count(), 1);
    }
}
