//! # Handler registry
//!
//! Built once at process start from an explicit list of bindings and never
//! mutated afterwards. Lookups are O(1) by entity path and the registry is
//! safe to share behind an `Arc` without locking.
//!
//! ```rust,ignore
//! let registry = Registry::builder()
//!     .policies(policies)
//!     .queue(QueueBinding::new("orders", "primary", OrderPlaced).with_max_concurrent_calls(8))
//!     .topic(TopicBinding::new("events", "audit", "primary", AuditTrail))
//!     .jobs(jobs)
//!     .build()?;
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use herald_core::{AuthRequirement, PolicySet, ResolvedAuth};
use tracing::info;

use crate::{
    handler::{ErasedMessageHandler, MessageHandler, TypedHandler},
    job::JobRegistry,
    types::{DeliveryMode, EntityPath, SubscriptionFilter},
    RegistryError,
};

/// Declaration of a queue handler.
pub struct QueueBinding {
    pub queue: String,
    pub connection_key: String,
    pub max_concurrent_calls: Option<usize>,
    pub delivery_mode: DeliveryMode,
    pub auth: AuthRequirement,
    handler: Arc<dyn ErasedMessageHandler>,
}

impl QueueBinding {
    pub fn new<H: MessageHandler>(
        queue: impl Into<String>,
        connection_key: impl Into<String>,
        handler: H,
    ) -> Self {
        Self {
            queue: queue.into(),
            connection_key: connection_key.into(),
            max_concurrent_calls: None,
            delivery_mode: DeliveryMode::PeekLock,
            auth: AuthRequirement::none(),
            handler: Arc::new(TypedHandler::new(handler)),
        }
    }

    pub fn with_max_concurrent_calls(mut self, max: usize) -> Self {
        self.max_concurrent_calls = Some(max);
        self
    }

    pub fn with_delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = mode;
        self
    }

    pub fn with_auth(mut self, auth: AuthRequirement) -> Self {
        self.auth = auth;
        self
    }
}

/// Declaration of a topic subscription handler.
pub struct TopicBinding {
    pub topic: String,
    pub subscription: String,
    pub connection_key: String,
    pub filter: SubscriptionFilter,
    pub max_concurrent_calls: Option<usize>,
    pub delivery_mode: DeliveryMode,
    pub auth: AuthRequirement,
    handler: Arc<dyn ErasedMessageHandler>,
}

impl TopicBinding {
    pub fn new<H: MessageHandler>(
        topic: impl Into<String>,
        subscription: impl Into<String>,
        connection_key: impl Into<String>,
        handler: H,
    ) -> Self {
        Self {
            topic: topic.into(),
            subscription: subscription.into(),
            connection_key: connection_key.into(),
            filter: SubscriptionFilter::All,
            max_concurrent_calls: None,
            delivery_mode: DeliveryMode::PeekLock,
            auth: AuthRequirement::none(),
            handler: Arc::new(TypedHandler::new(handler)),
        }
    }

    pub fn with_filter(mut self, filter: SubscriptionFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_max_concurrent_calls(mut self, max: usize) -> Self {
        self.max_concurrent_calls = Some(max);
        self
    }

    pub fn with_delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = mode;
        self
    }

    pub fn with_auth(mut self, auth: AuthRequirement) -> Self {
        self.auth = auth;
        self
    }
}

/// A resolved binding. What the dispatcher runs against.
pub struct HandlerDescriptor {
    pub source: EntityPath,
    pub connection_key: String,
    pub max_concurrent_calls: usize,
    pub delivery_mode: DeliveryMode,
    /// Subscription filter; `All` for queues.
    pub filter: SubscriptionFilter,
    pub auth: ResolvedAuth,
    pub payload_type: &'static str,
    pub handler_type: &'static str,
    pub(crate) handler: Arc<dyn ErasedMessageHandler>,
}

impl HandlerDescriptor {
    pub fn handler(&self) -> &dyn ErasedMessageHandler {
        self.handler.as_ref()
    }
}

impl fmt::Debug for HandlerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerDescriptor")
            .field("source", &self.source)
            .field("connection_key", &self.connection_key)
            .field("max_concurrent_calls", &self.max_concurrent_calls)
            .field("delivery_mode", &self.delivery_mode)
            .field("filter", &self.filter)
            .field("auth", &self.auth)
            .field("payload_type", &self.payload_type)
            .field("handler_type", &self.handler_type)
            .finish()
    }
}

/// Read-only catalog of every handler this process serves.
#[derive(Debug, Default)]
pub struct Registry {
    handlers: HashMap<EntityPath, Arc<HandlerDescriptor>>,
    order: Vec<EntityPath>,
    jobs: Option<Arc<JobRegistry>>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn lookup(&self, source: &EntityPath) -> Option<Arc<HandlerDescriptor>> {
        self.handlers.get(source).cloned()
    }

    pub fn queue(&self, name: &str) -> Option<Arc<HandlerDescriptor>> {
        self.lookup(&EntityPath::queue(name))
    }

    pub fn subscription(&self, topic: &str, name: &str) -> Option<Arc<HandlerDescriptor>> {
        self.lookup(&EntityPath::subscription(topic, name))
    }

    /// Descriptors in declaration order.
    pub fn descriptors(&self) -> impl Iterator<Item = &Arc<HandlerDescriptor>> {
        self.order.iter().filter_map(|path| self.handlers.get(path))
    }

    pub fn jobs(&self) -> Option<&Arc<JobRegistry>> {
        self.jobs.as_ref()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

struct Pending {
    source: EntityPath,
    connection_key: String,
    max_concurrent_calls: Option<usize>,
    delivery_mode: DeliveryMode,
    filter: SubscriptionFilter,
    auth: AuthRequirement,
    handler: Arc<dyn ErasedMessageHandler>,
}

pub struct RegistryBuilder {
    pending: Vec<Pending>,
    policies: PolicySet,
    default_max_concurrent_calls: usize,
    jobs: Option<Arc<JobRegistry>>,
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self {
            pending: Vec::new(),
            policies: PolicySet::new(),
            default_max_concurrent_calls: crate::BusConfig::default().default_max_concurrent_calls,
            jobs: None,
        }
    }
}

impl RegistryBuilder {
    pub fn queue(mut self, binding: QueueBinding) -> Self {
        self.pending.push(Pending {
            source: EntityPath::queue(binding.queue),
            connection_key: binding.connection_key,
            max_concurrent_calls: binding.max_concurrent_calls,
            delivery_mode: binding.delivery_mode,
            filter: SubscriptionFilter::All,
            auth: binding.auth,
            handler: binding.handler,
        });
        self
    }

    pub fn topic(mut self, binding: TopicBinding) -> Self {
        self.pending.push(Pending {
            source: EntityPath::subscription(binding.topic, binding.subscription),
            connection_key: binding.connection_key,
            max_concurrent_calls: binding.max_concurrent_calls,
            delivery_mode: binding.delivery_mode,
            filter: binding.filter,
            auth: binding.auth,
            handler: binding.handler,
        });
        self
    }

    pub fn jobs(mut self, jobs: Arc<JobRegistry>) -> Self {
        self.jobs = Some(jobs);
        self
    }

    pub fn policies(mut self, policies: PolicySet) -> Self {
        self.policies = policies;
        self
    }

    /// Pool size for bindings without an explicit `max_concurrent_calls`.
    pub fn default_max_concurrent_calls(mut self, max: usize) -> Self {
        self.default_max_concurrent_calls = max;
        self
    }

    /// Validate every declaration. The first malformed one aborts the build.
    pub fn build(self) -> Result<Registry, RegistryError> {
        let mut registry = Registry {
            jobs: self.jobs,
            ..Registry::default()
        };

        for pending in self.pending {
            let entity = pending.source.to_string();

            if pending.connection_key.trim().is_empty() {
                return Err(RegistryError::MissingConnectionKey { entity });
            }

            if registry.handlers.contains_key(&pending.source) {
                return Err(RegistryError::DuplicateHandler { entity });
            }

            let max_concurrent_calls = pending
                .max_concurrent_calls
                .unwrap_or(self.default_max_concurrent_calls);
            if max_concurrent_calls == 0 {
                return Err(RegistryError::InvalidConcurrency { entity });
            }

            let auth = pending
                .auth
                .resolve(&self.policies)
                .map_err(|unknown| RegistryError::UnknownPolicy {
                    handler: entity.clone(),
                    policy: unknown.0,
                })?;

            let descriptor = HandlerDescriptor {
                source: pending.source.clone(),
                connection_key: pending.connection_key,
                max_concurrent_calls,
                delivery_mode: pending.delivery_mode,
                filter: pending.filter,
                auth,
                payload_type: pending.handler.payload_type(),
                handler_type: pending.handler.handler_type(),
                handler: pending.handler,
            };

            info!(
                "Registered {} for {} (max_concurrent_calls = {})",
                descriptor.handler_type, entity, max_concurrent_calls
            );
            registry.order.push(pending.source.clone());
            registry.handlers.insert(pending.source, Arc::new(descriptor));
        }

        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{Envelope, HandlerContext};
    use async_trait::async_trait;
    use herald_core::{ClaimPolicy, HandlerResult};
    use serde_json::Value;

    struct Sink;

    #[async_trait]
    impl MessageHandler for Sink {
        type Payload = Envelope<Value>;

        async fn handle(&self, _payload: Self::Payload, _ctx: HandlerContext) -> HandlerResult {
            Ok(())
        }
    }

    #[test]
    fn builds_and_looks_up_by_entity() {
        let registry = Registry::builder()
            .queue(QueueBinding::new("orders", "primary", Sink).with_max_concurrent_calls(4))
            .topic(TopicBinding::new("events", "audit", "primary", Sink))
            .build()
            .unwrap();

        let orders = registry.queue("orders").unwrap();
        assert_eq!(orders.max_concurrent_calls, 4);
        assert!(orders.handler_type.ends_with("Sink"));

        let audit = registry.subscription("events", "audit").unwrap();
        assert_eq!(audit.max_concurrent_calls, 16);
        assert!(registry.queue("events").is_none());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn duplicate_queue_is_rejected() {
        let err = Registry::builder()
            .queue(QueueBinding::new("orders", "primary", Sink))
            .queue(QueueBinding::new("orders", "secondary", Sink))
            .build()
            .unwrap_err();

        assert_eq!(
            err,
            RegistryError::DuplicateHandler {
                entity: "orders".into()
            }
        );
    }

    #[test]
    fn same_subscription_name_on_different_topics_is_fine() {
        let registry = Registry::builder()
            .topic(TopicBinding::new("a", "audit", "primary", Sink))
            .topic(TopicBinding::new("b", "audit", "primary", Sink))
            .build();
        assert!(registry.is_ok());

        let err = Registry::builder()
            .topic(TopicBinding::new("a", "audit", "primary", Sink))
            .topic(TopicBinding::new("a", "audit", "primary", Sink))
            .build()
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateHandler { .. }));
    }

    #[test]
    fn topic_without_connection_key_is_rejected() {
        let err = Registry::builder()
            .topic(TopicBinding::new("events", "audit", "  ", Sink))
            .build()
            .unwrap_err();

        assert_eq!(
            err,
            RegistryError::MissingConnectionKey {
                entity: "events/subscriptions/audit".into()
            }
        );
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let err = Registry::builder()
            .queue(QueueBinding::new("orders", "primary", Sink).with_max_concurrent_calls(0))
            .build()
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidConcurrency { .. }));
    }

    #[test]
    fn policies_resolve_at_build_time() {
        let policies = PolicySet::new().with(ClaimPolicy::new("acme", "tenant", ["acme"]));

        let ok = Registry::builder()
            .policies(policies.clone())
            .queue(
                QueueBinding::new("orders", "primary", Sink)
                    .with_auth(AuthRequirement::policy("acme")),
            )
            .build()
            .unwrap();
        assert!(ok.queue("orders").unwrap().auth.is_required());

        let err = Registry::builder()
            .policies(policies)
            .queue(
                QueueBinding::new("orders", "primary", Sink)
                    .with_auth(AuthRequirement::policy("other")),
            )
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            RegistryError::UnknownPolicy {
                handler: "orders".into(),
                policy: "other".into()
            }
        );
    }
}
