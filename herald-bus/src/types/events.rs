use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{EntityPath, MessageId, SequenceNumber};

/// Transport event protocol for observability and tests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BusEvent {
    EntityCreated {
        entity: EntityPath,
        at: DateTime<Utc>,
    },

    Sent {
        entity: EntityPath,
        message_id: MessageId,
        at: DateTime<Utc>,
    },

    Scheduled {
        entity: EntityPath,
        sequence: SequenceNumber,
        enqueue_at: DateTime<Utc>,
        at: DateTime<Utc>,
    },

    ScheduleCanceled {
        entity: EntityPath,
        sequence: SequenceNumber,
        at: DateTime<Utc>,
    },

    Received {
        entity: EntityPath,
        message_id: MessageId,
        delivery_count: u32,
        at: DateTime<Utc>,
    },

    Completed {
        entity: EntityPath,
        message_id: MessageId,
        at: DateTime<Utc>,
    },

    Abandoned {
        entity: EntityPath,
        message_id: MessageId,
        at: DateTime<Utc>,
    },

    /// Lock ran out before the holder settled the message.
    LockExpired {
        entity: EntityPath,
        message_id: MessageId,
        at: DateTime<Utc>,
    },

    DeadLettered {
        entity: EntityPath,
        message_id: MessageId,
        reason: String,
        at: DateTime<Utc>,
    },
}

impl BusEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::EntityCreated { .. } => "entity_created",
            Self::Sent { .. } => "sent",
            Self::Scheduled { .. } => "scheduled",
            Self::ScheduleCanceled { .. } => "schedule_canceled",
            Self::Received { .. } => "received",
            Self::Completed { .. } => "completed",
            Self::Abandoned { .. } => "abandoned",
            Self::LockExpired { .. } => "lock_expired",
            Self::DeadLettered { .. } => "dead_lettered",
        }
    }

    pub fn entity(&self) -> &EntityPath {
        match self {
            Self::EntityCreated { entity, .. }
            | Self::Sent { entity, .. }
            | Self::Scheduled { entity, .. }
            | Self::ScheduleCanceled { entity, .. }
            | Self::Received { entity, .. }
            | Self::Completed { entity, .. }
            | Self::Abandoned { entity, .. }
            | Self::LockExpired { entity, .. }
            | Self::DeadLettered { entity, .. } => entity,
        }
    }
}
