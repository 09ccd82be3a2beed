pub mod events;
pub mod ids;
pub mod message;

pub use events::BusEvent;
pub use ids::{LockToken, MessageId, SequenceNumber};
pub use message::{
    DeadLetterRecord, DeliveryMode, EntityPath, InboundMessage, OutboundMessage,
    SubscriptionFilter, JSON_CONTENT_TYPE,
};
