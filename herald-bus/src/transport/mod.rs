pub mod memory;
pub mod reaper;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_core::Stream;
use std::pin::Pin;
use std::time::Duration;

use crate::{
    types::{
        BusEvent, DeadLetterRecord, DeliveryMode, EntityPath, InboundMessage, LockToken,
        OutboundMessage, SequenceNumber, SubscriptionFilter,
    },
    BusResult,
};

pub use memory::MemoryTransport;
pub use reaper::LockReaper;

/// Type alias for boxed streams (stable Rust compatible)
pub type BoxStream<T> = Pin<Box<dyn Stream<Item = T> + Send + 'static>>;

/// `now + span`, saturating at the latest representable instant.
pub(crate) fn after(now: DateTime<Utc>, span: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(span)
        .ok()
        .and_then(|span| now.checked_add_signed(span))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Upper bound the broker enforces on dead-letter reason/description.
pub const MAX_DEAD_LETTER_PROPERTY_CHARS: usize = 4096;

/// Broker primitives the dispatcher relies on: at-least-once delivery with
/// peek-lock, complete/abandon/dead-letter, label-filtered topic
/// subscriptions, TTL and scheduled delivery.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send to a queue or topic. A missing entity fails with
    /// [`BusError::EntityNotFound`](crate::BusError::EntityNotFound).
    async fn send(&self, entity: &EntityPath, message: OutboundMessage) -> BusResult<()>;

    /// Enqueue `message` at `enqueue_at` instead of now.
    async fn schedule(
        &self,
        entity: &EntityPath,
        message: OutboundMessage,
        enqueue_at: DateTime<Utc>,
    ) -> BusResult<SequenceNumber>;

    async fn cancel_scheduled(&self, entity: &EntityPath, sequence: SequenceNumber)
        -> BusResult<()>;

    /// Wait up to `max_wait` for the next message of a queue or subscription.
    ///
    /// Must be cancel-safe: dropping the future never loses a message.
    async fn receive(
        &self,
        source: &EntityPath,
        mode: DeliveryMode,
        max_wait: Duration,
    ) -> BusResult<Option<InboundMessage>>;

    async fn complete(&self, source: &EntityPath, lock: &LockToken) -> BusResult<()>;

    /// Release the lock so the message becomes available again.
    async fn abandon(&self, source: &EntityPath, lock: &LockToken) -> BusResult<()>;

    /// Move a locked message to the dead-letter sub-queue of `source`.
    async fn dead_letter(
        &self,
        source: &EntityPath,
        lock: &LockToken,
        reason: &str,
        description: &str,
    ) -> BusResult<()>;

    /// Create a queue or topic. Creating an existing entity is a no-op.
    async fn create_entity(&self, entity: &EntityPath) -> BusResult<()>;

    /// Create the subscription, or bring its filter in line with `filter`.
    /// The topic is created when missing.
    async fn ensure_subscription(
        &self,
        topic: &str,
        name: &str,
        filter: SubscriptionFilter,
    ) -> BusResult<()>;

    async fn entity_exists(&self, entity: &EntityPath) -> BusResult<bool>;

    /// Read the dead-letter sub-queue without removing anything.
    async fn peek_dead_letters(&self, source: &EntityPath) -> BusResult<Vec<DeadLetterRecord>>;

    /// Return expired locks to their entity. Brokers that expire locks
    /// server-side keep the default.
    async fn reclaim_expired_locks(&self) -> BusResult<usize> {
        Ok(0)
    }

    fn event_stream(&self) -> BoxStream<BusEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn after_saturates_instead_of_overflowing() {
        let now = Utc::now();

        assert_eq!(after(now, Duration::from_secs(60)), now + chrono::Duration::seconds(60));
        assert_eq!(after(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
    }
}
