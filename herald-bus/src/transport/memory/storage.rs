use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, warn};

use crate::{
    config::BusConfig,
    transport::{after, BoxStream, Transport, MAX_DEAD_LETTER_PROPERTY_CHARS},
    types::{
        BusEvent, DeadLetterRecord, DeliveryMode, EntityPath, InboundMessage, LockToken,
        MessageId, OutboundMessage, SequenceNumber, SubscriptionFilter,
    },
    BusError, BusResult,
};

/// Reason the broker itself uses when a message keeps coming back.
pub const MAX_DELIVERY_REASON: &str = "MaxDeliveryCountExceeded";
/// Reason the broker itself uses when a message outlives its TTL.
pub const TTL_EXPIRED_REASON: &str = "TTLExpiredException";

/// Upper bound on a single wait inside `receive`, so due scheduled messages
/// are picked up without a dedicated timer task.
const POLL_INTERVAL: Duration = Duration::from_millis(25);

pub(crate) struct StoredMessage {
    pub(crate) message_id: MessageId,
    content_type: String,
    label: Option<String>,
    ttl: Option<Duration>,
    body: Vec<u8>,
    enqueued_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    pub(crate) delivery_count: u32,
}

impl StoredMessage {
    fn from_outbound(message: OutboundMessage, now: DateTime<Utc>) -> Self {
        Self {
            expires_at: message.ttl.map(|ttl| after(now, ttl)),
            message_id: message.message_id,
            content_type: message.content_type,
            label: message.label,
            ttl: message.ttl,
            body: message.body,
            enqueued_at: now,
            delivery_count: 0,
        }
    }

    fn copy(&self) -> Self {
        Self {
            message_id: self.message_id.clone(),
            content_type: self.content_type.clone(),
            label: self.label.clone(),
            ttl: self.ttl,
            body: self.body.clone(),
            enqueued_at: self.enqueued_at,
            expires_at: self.expires_at,
            delivery_count: self.delivery_count,
        }
    }
}

pub(crate) struct LockedMessage {
    pub(crate) message: StoredMessage,
    pub(crate) locked_until: DateTime<Utc>,
}

#[derive(Default)]
pub(crate) struct EntityState {
    pub(crate) ready: VecDeque<StoredMessage>,
    pub(crate) locked: HashMap<LockToken, LockedMessage>,
    pub(crate) dead_letters: Vec<DeadLetterRecord>,
    pub(crate) notify: Arc<Notify>,
}

struct ScheduledMessage {
    entity: EntityPath,
    message: OutboundMessage,
    enqueue_at: DateTime<Utc>,
}

/// Everything behind one lock: a send to a topic touches several
/// subscriptions at once.
#[derive(Default)]
pub(crate) struct BrokerState {
    /// Queues and subscriptions.
    pub(crate) receivables: HashMap<EntityPath, EntityState>,
    /// topic -> subscription name -> filter
    topics: HashMap<String, HashMap<String, SubscriptionFilter>>,
    scheduled: BTreeMap<SequenceNumber, ScheduledMessage>,
}

/// In-memory broker for tests, development and embedded use.
pub struct MemoryTransport {
    pub(crate) state: Arc<RwLock<BrokerState>>,
    next_sequence: Arc<AtomicU64>,
    lock_duration: Duration,
    max_delivery_count: u32,
    pub(crate) event_broadcaster: broadcast::Sender<BusEvent>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        let defaults = BusConfig::default();
        Self::with_settings(defaults.lock_duration, defaults.max_delivery_count)
    }

    pub fn with_settings(lock_duration: Duration, max_delivery_count: u32) -> Self {
        let (event_broadcaster, _) = broadcast::channel(1000);

        Self {
            state: Arc::new(RwLock::new(BrokerState::default())),
            next_sequence: Arc::new(AtomicU64::new(0)),
            lock_duration,
            max_delivery_count: max_delivery_count.max(1),
            event_broadcaster,
        }
    }

    pub fn from_config(config: &BusConfig) -> Self {
        Self::with_settings(config.lock_duration, config.max_delivery_count)
    }

    /// Messages waiting for a receiver (not locked, not dead-lettered).
    pub fn active_message_count(&self, source: &EntityPath) -> usize {
        self.state
            .read()
            .receivables
            .get(source)
            .map(|e| e.ready.len())
            .unwrap_or(0)
    }

    pub fn locked_message_count(&self, source: &EntityPath) -> usize {
        self.state
            .read()
            .receivables
            .get(source)
            .map(|e| e.locked.len())
            .unwrap_or(0)
    }

    pub fn scheduled_message_count(&self) -> usize {
        self.state.read().scheduled.len()
    }

    fn emit(&self, event: BusEvent) {
        let _ = self.event_broadcaster.send(event);
    }

    fn require_sendable(entity: &EntityPath) -> BusResult<()> {
        if entity.is_sendable() {
            Ok(())
        } else {
            Err(BusError::InvalidEntity {
                entity: entity.to_string(),
                reason: "subscriptions cannot be sent to; send to the topic".to_string(),
            })
        }
    }

    fn require_receivable(entity: &EntityPath) -> BusResult<()> {
        if entity.is_receivable() {
            Ok(())
        } else {
            Err(BusError::InvalidEntity {
                entity: entity.to_string(),
                reason: "topics cannot be received from; receive from a subscription".to_string(),
            })
        }
    }

    /// Put a message on a queue, or fan it out to the matching subscriptions
    /// of a topic. A topic without matching subscriptions drops it.
    fn deliver(
        &self,
        state: &mut BrokerState,
        entity: &EntityPath,
        message: OutboundMessage,
        now: DateTime<Utc>,
    ) -> BusResult<()> {
        let stored = StoredMessage::from_outbound(message, now);

        match entity {
            EntityPath::Queue(_) => {
                let queue = state
                    .receivables
                    .get_mut(entity)
                    .ok_or_else(|| BusError::EntityNotFound(entity.to_string()))?;
                queue.ready.push_back(stored);
                queue.notify.notify_one();
            }
            EntityPath::Topic(topic) => {
                let subscriptions = state
                    .topics
                    .get(topic)
                    .ok_or_else(|| BusError::EntityNotFound(entity.to_string()))?;

                let targets: Vec<EntityPath> = subscriptions
                    .iter()
                    .filter(|(_, filter)| filter.matches(stored.label.as_deref()))
                    .map(|(name, _)| EntityPath::subscription(topic.clone(), name.clone()))
                    .collect();

                if targets.is_empty() {
                    debug!(
                        "No subscription of topic {} matched message {}",
                        topic, stored.message_id
                    );
                }

                for target in targets {
                    if let Some(sub) = state.receivables.get_mut(&target) {
                        sub.ready.push_back(stored.copy());
                        sub.notify.notify_one();
                    }
                }
            }
            EntityPath::Subscription { .. } => Self::require_sendable(entity)?,
        }

        Ok(())
    }

    fn promote_due_scheduled(&self, state: &mut BrokerState, now: DateTime<Utc>) {
        let due: Vec<SequenceNumber> = state
            .scheduled
            .iter()
            .filter(|(_, s)| s.enqueue_at <= now)
            .map(|(seq, _)| *seq)
            .collect();

        for seq in due {
            if let Some(scheduled) = state.scheduled.remove(&seq) {
                let message_id = scheduled.message.message_id.clone();
                match self.deliver(state, &scheduled.entity, scheduled.message, now) {
                    Ok(()) => self.emit(BusEvent::Sent {
                        entity: scheduled.entity,
                        message_id,
                        at: now,
                    }),
                    Err(e) => warn!("Dropping scheduled message {}: {}", seq, e),
                }
            }
        }
    }

    fn take_next(
        &self,
        source: &EntityPath,
        entity: &mut EntityState,
        mode: DeliveryMode,
        now: DateTime<Utc>,
    ) -> Option<InboundMessage> {
        while let Some(mut message) = entity.ready.pop_front() {
            if message.expires_at.is_some_and(|t| t <= now) {
                let event = park(
                    entity,
                    source,
                    message,
                    TTL_EXPIRED_REASON,
                    "Message time to live expired before delivery",
                    now,
                );
                self.emit(event);
                continue;
            }

            message.delivery_count += 1;
            self.emit(BusEvent::Received {
                entity: source.clone(),
                message_id: message.message_id.clone(),
                delivery_count: message.delivery_count,
                at: now,
            });

            let mut inbound = InboundMessage {
                message_id: message.message_id.clone(),
                source: source.clone(),
                content_type: message.content_type.clone(),
                label: message.label.clone(),
                ttl: message.ttl,
                body: message.body.clone(),
                lock_token: None,
                locked_until: None,
                delivery_count: message.delivery_count,
                enqueued_at: message.enqueued_at,
            };

            if mode == DeliveryMode::PeekLock {
                let token = LockToken::new();
                let locked_until = after(now, self.lock_duration);
                inbound.lock_token = Some(token.clone());
                inbound.locked_until = Some(locked_until);
                entity.locked.insert(
                    token,
                    LockedMessage {
                        message,
                        locked_until,
                    },
                );
            }

            return Some(inbound);
        }

        None
    }

    /// Put an unlocked message back, or dead-letter it once it has used up
    /// its deliveries.
    fn release(
        &self,
        entity: &mut EntityState,
        source: &EntityPath,
        message: StoredMessage,
        now: DateTime<Utc>,
    ) {
        if message.delivery_count >= self.max_delivery_count {
            let description = format!(
                "Message was delivered {} times without being settled",
                message.delivery_count
            );
            let event = park(entity, source, message, MAX_DELIVERY_REASON, &description, now);
            self.emit(event);
        } else {
            entity.ready.push_front(message);
            entity.notify.notify_one();
        }
    }

    fn take_lock(
        entity: &mut EntityState,
        lock: &LockToken,
        now: DateTime<Utc>,
    ) -> BusResult<StoredMessage> {
        // Expired but not reaped yet counts as lost; the reaper returns it.
        let live = entity
            .locked
            .get(lock)
            .is_some_and(|held| held.locked_until > now);
        if !live {
            return Err(BusError::LockLost(lock.clone()));
        }

        entity
            .locked
            .remove(lock)
            .map(|held| held.message)
            .ok_or_else(|| BusError::LockLost(lock.clone()))
    }

    /// Return every expired lock to its entity.
    pub(crate) fn reclaim_locks(&self, now: DateTime<Utc>) -> usize {
        let mut state = self.state.write();
        let mut reclaimed = 0;

        let sources: Vec<EntityPath> = state.receivables.keys().cloned().collect();
        for source in sources {
            let Some(entity) = state.receivables.get_mut(&source) else {
                continue;
            };

            let expired: Vec<LockToken> = entity
                .locked
                .iter()
                .filter(|(_, held)| held.locked_until <= now)
                .map(|(token, _)| token.clone())
                .collect();

            for token in expired {
                if let Some(held) = entity.locked.remove(&token) {
                    debug!("Reclaiming expired lock for message {}", held.message.message_id);
                    self.emit(BusEvent::LockExpired {
                        entity: source.clone(),
                        message_id: held.message.message_id.clone(),
                        at: now,
                    });
                    self.release(entity, &source, held.message, now);
                    reclaimed += 1;
                }
            }
        }

        reclaimed
    }
}

fn park(
    entity: &mut EntityState,
    source: &EntityPath,
    message: StoredMessage,
    reason: &str,
    description: &str,
    now: DateTime<Utc>,
) -> BusEvent {
    let event = BusEvent::DeadLettered {
        entity: source.clone(),
        message_id: message.message_id.clone(),
        reason: reason.to_string(),
        at: now,
    };

    entity.dead_letters.push(DeadLetterRecord {
        message_id: message.message_id,
        source: source.clone(),
        reason: reason.to_string(),
        description: description.to_string(),
        label: message.label,
        body: message.body,
        delivery_count: message.delivery_count,
        dead_lettered_at: now,
    });

    event
}

fn check_property(name: &'static str, value: &str) -> BusResult<()> {
    let len = value.chars().count();
    if len > MAX_DEAD_LETTER_PROPERTY_CHARS {
        return Err(BusError::PropertyTooLong {
            name,
            len,
            max: MAX_DEAD_LETTER_PROPERTY_CHARS,
        });
    }
    Ok(())
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, entity: &EntityPath, message: OutboundMessage) -> BusResult<()> {
        Self::require_sendable(entity)?;
        let now = Utc::now();
        let message_id = message.message_id.clone();

        {
            let mut state = self.state.write();
            self.promote_due_scheduled(&mut state, now);
            self.deliver(&mut state, entity, message, now)?;
        }

        self.emit(BusEvent::Sent {
            entity: entity.clone(),
            message_id,
            at: now,
        });
        Ok(())
    }

    async fn schedule(
        &self,
        entity: &EntityPath,
        message: OutboundMessage,
        enqueue_at: DateTime<Utc>,
    ) -> BusResult<SequenceNumber> {
        Self::require_sendable(entity)?;
        if !self.entity_exists(entity).await? {
            return Err(BusError::EntityNotFound(entity.to_string()));
        }

        let sequence = SequenceNumber(self.next_sequence.fetch_add(1, Ordering::Relaxed) + 1);
        self.state.write().scheduled.insert(
            sequence,
            ScheduledMessage {
                entity: entity.clone(),
                message,
                enqueue_at,
            },
        );

        self.emit(BusEvent::Scheduled {
            entity: entity.clone(),
            sequence,
            enqueue_at,
            at: Utc::now(),
        });
        Ok(sequence)
    }

    async fn cancel_scheduled(
        &self,
        entity: &EntityPath,
        sequence: SequenceNumber,
    ) -> BusResult<()> {
        {
            let mut state = self.state.write();
            let owned = state
                .scheduled
                .get(&sequence)
                .is_some_and(|s| &s.entity == entity);
            if !owned {
                return Err(BusError::ScheduledMessageNotFound(sequence));
            }
            state.scheduled.remove(&sequence);
        }

        self.emit(BusEvent::ScheduleCanceled {
            entity: entity.clone(),
            sequence,
            at: Utc::now(),
        });
        Ok(())
    }

    async fn receive(
        &self,
        source: &EntityPath,
        mode: DeliveryMode,
        max_wait: Duration,
    ) -> BusResult<Option<InboundMessage>> {
        Self::require_receivable(source)?;
        let deadline = tokio::time::Instant::now() + max_wait;

        loop {
            let notify = {
                let mut state = self.state.write();
                let now = Utc::now();
                self.promote_due_scheduled(&mut state, now);

                let entity = state
                    .receivables
                    .get_mut(source)
                    .ok_or_else(|| BusError::EntityNotFound(source.to_string()))?;

                if let Some(message) = self.take_next(source, entity, mode, now) {
                    return Ok(Some(message));
                }
                entity.notify.clone()
            };

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wait = (deadline - now).min(POLL_INTERVAL);
            let _ = tokio::time::timeout(wait, notify.notified()).await;
        }
    }

    async fn complete(&self, source: &EntityPath, lock: &LockToken) -> BusResult<()> {
        let now = Utc::now();
        let message_id = {
            let mut state = self.state.write();
            let entity = state
                .receivables
                .get_mut(source)
                .ok_or_else(|| BusError::EntityNotFound(source.to_string()))?;
            Self::take_lock(entity, lock, now)?.message_id
        };

        self.emit(BusEvent::Completed {
            entity: source.clone(),
            message_id,
            at: now,
        });
        Ok(())
    }

    async fn abandon(&self, source: &EntityPath, lock: &LockToken) -> BusResult<()> {
        let now = Utc::now();
        let mut state = self.state.write();
        let entity = state
            .receivables
            .get_mut(source)
            .ok_or_else(|| BusError::EntityNotFound(source.to_string()))?;

        let message = Self::take_lock(entity, lock, now)?;
        self.emit(BusEvent::Abandoned {
            entity: source.clone(),
            message_id: message.message_id.clone(),
            at: now,
        });
        self.release(entity, source, message, now);
        Ok(())
    }

    async fn dead_letter(
        &self,
        source: &EntityPath,
        lock: &LockToken,
        reason: &str,
        description: &str,
    ) -> BusResult<()> {
        check_property("reason", reason)?;
        check_property("description", description)?;

        let now = Utc::now();
        let event = {
            let mut state = self.state.write();
            let entity = state
                .receivables
                .get_mut(source)
                .ok_or_else(|| BusError::EntityNotFound(source.to_string()))?;
            let message = Self::take_lock(entity, lock, now)?;
            park(entity, source, message, reason, description, now)
        };

        self.emit(event);
        Ok(())
    }

    async fn create_entity(&self, entity: &EntityPath) -> BusResult<()> {
        let created = {
            let mut state = self.state.write();
            match entity {
                EntityPath::Queue(_) => {
                    if state.receivables.contains_key(entity) {
                        false
                    } else {
                        state.receivables.insert(entity.clone(), EntityState::default());
                        true
                    }
                }
                EntityPath::Topic(topic) => {
                    if state.topics.contains_key(topic) {
                        false
                    } else {
                        state.topics.insert(topic.clone(), HashMap::new());
                        true
                    }
                }
                EntityPath::Subscription { .. } => {
                    return Err(BusError::InvalidEntity {
                        entity: entity.to_string(),
                        reason: "subscriptions are created with ensure_subscription".to_string(),
                    })
                }
            }
        };

        if created {
            debug!("Created messaging entity {}", entity);
            self.emit(BusEvent::EntityCreated {
                entity: entity.clone(),
                at: Utc::now(),
            });
        }
        Ok(())
    }

    async fn ensure_subscription(
        &self,
        topic: &str,
        name: &str,
        filter: SubscriptionFilter,
    ) -> BusResult<()> {
        self.create_entity(&EntityPath::topic(topic)).await?;

        let path = EntityPath::subscription(topic, name);
        let created = {
            let mut state = self.state.write();
            if let Some(subscriptions) = state.topics.get_mut(topic) {
                subscriptions.insert(name.to_string(), filter);
            }
            if state.receivables.contains_key(&path) {
                false
            } else {
                state.receivables.insert(path.clone(), EntityState::default());
                true
            }
        };

        if created {
            self.emit(BusEvent::EntityCreated {
                entity: path,
                at: Utc::now(),
            });
        }
        Ok(())
    }

    async fn entity_exists(&self, entity: &EntityPath) -> BusResult<bool> {
        let state = self.state.read();
        Ok(match entity {
            EntityPath::Topic(topic) => state.topics.contains_key(topic),
            other => state.receivables.contains_key(other),
        })
    }

    async fn peek_dead_letters(&self, source: &EntityPath) -> BusResult<Vec<DeadLetterRecord>> {
        let state = self.state.read();
        state
            .receivables
            .get(source)
            .map(|e| e.dead_letters.clone())
            .ok_or_else(|| BusError::EntityNotFound(source.to_string()))
    }

    async fn reclaim_expired_locks(&self) -> BusResult<usize> {
        Ok(self.reclaim_locks(Utc::now()))
    }

    fn event_stream(&self) -> BoxStream<BusEvent> {
        let receiver = self.event_broadcaster.subscribe();
        use tokio_stream::{wrappers::BroadcastStream, StreamExt};
        let stream = BroadcastStream::new(receiver).filter_map(|result| result.ok());

        Box::pin(stream)
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for MemoryTransport {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            next_sequence: self.next_sequence.clone(),
            lock_duration: self.lock_duration,
            max_delivery_count: self.max_delivery_count,
            event_broadcaster: self.event_broadcaster.clone(),
        }
    }
}
