//! Runs every registered handler against its connection.
//!
//! ```rust,ignore
//! let host = BusHost::new(registry, Connections::new().with("primary", transport))
//!     .with_config(BusConfig::from_snapshot(&config.snapshot()));
//! let handle = host.start().await?;
//! // ...
//! let report = handle.shutdown().await;
//! ```

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument};

use crate::{
    config::BusConfig,
    dispatcher::{DrainReport, MessageDispatcher},
    health::{EntityHealth, HealthCheck, HealthReport},
    observability::{BusMetrics, Telemetry, TracingTelemetry},
    registry::Registry,
    sender::MessageSender,
    transport::{LockReaper, Transport},
    types::EntityPath,
    BusError, BusResult,
};

/// Transports by connection key.
#[derive(Clone, Default)]
pub struct Connections {
    transports: HashMap<String, Arc<dyn Transport>>,
}

impl Connections {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        self.insert(key, transport);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, transport: Arc<dyn Transport>) {
        self.transports.insert(key.into(), transport);
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn Transport>> {
        self.transports.get(key).cloned()
    }

    pub fn resolve(&self, key: &str) -> BusResult<Arc<dyn Transport>> {
        self.get(key)
            .ok_or_else(|| BusError::UnknownConnection(key.to_string()))
    }
}

impl fmt::Debug for Connections {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&String> = self.transports.keys().collect();
        keys.sort();
        f.debug_struct("Connections").field("keys", &keys).finish()
    }
}

pub struct BusHost {
    registry: Arc<Registry>,
    connections: Connections,
    config: BusConfig,
    telemetry: Arc<dyn Telemetry>,
    metrics: Arc<BusMetrics>,
}

impl BusHost {
    pub fn new(registry: Arc<Registry>, connections: Connections) -> Self {
        Self {
            registry,
            connections,
            config: BusConfig::default(),
            telemetry: Arc::new(TracingTelemetry),
            metrics: Arc::new(BusMetrics::new()),
        }
    }

    pub fn with_config(mut self, config: BusConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn Telemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<BusMetrics> {
        &self.metrics
    }

    pub fn telemetry(&self) -> &Arc<dyn Telemetry> {
        &self.telemetry
    }

    /// A sender on the named connection sharing this host's telemetry and
    /// metrics.
    pub fn sender(&self, connection_key: &str) -> BusResult<MessageSender> {
        Ok(MessageSender::new(
            self.connections.resolve(connection_key)?,
            self.telemetry.clone(),
            self.metrics.clone(),
        ))
    }

    /// Check every queue and topic the registry binds to. Subscriptions are
    /// checked through their topic, once per topic and connection.
    pub async fn health_check(&self) -> HealthReport {
        let check = HealthCheck::new(self.config.health_check_horizon);
        let targets: BTreeSet<(String, EntityPath)> = self
            .registry
            .descriptors()
            .map(|d| (d.connection_key.clone(), d.source.send_target()))
            .collect();

        let mut entities = Vec::with_capacity(targets.len());
        for (key, entity) in targets {
            let health = match self.connections.resolve(&key) {
                Ok(transport) => check.check_entity(transport.as_ref(), &entity, &key).await,
                Err(e) => EntityHealth {
                    entity,
                    connection_key: key,
                    error: Some(e.to_string()),
                },
            };
            entities.push(health);
        }

        HealthReport {
            checked_at: Utc::now(),
            entities,
        }
    }

    /// Provision every entity, then start one dispatcher per binding and one
    /// lock reaper per connection in use.
    ///
    /// All connection keys are resolved before anything is created, so an
    /// unknown key leaves the broker untouched.
    #[instrument(skip(self), fields(handlers = self.registry.len()))]
    pub async fn start(&self) -> BusResult<HostHandle> {
        let mut plans = Vec::with_capacity(self.registry.len());
        for descriptor in self.registry.descriptors() {
            let transport = self.connections.resolve(&descriptor.connection_key)?;
            plans.push((descriptor.clone(), transport));
        }

        for (descriptor, transport) in &plans {
            match &descriptor.source {
                EntityPath::Subscription { topic, name } => {
                    transport
                        .ensure_subscription(topic, name, descriptor.filter.clone())
                        .await?
                }
                entity => transport.create_entity(entity).await?,
            }
        }

        let mut dispatchers = Vec::with_capacity(plans.len());
        let mut reaped: BTreeSet<String> = BTreeSet::new();
        let mut reapers = Vec::new();

        for (descriptor, transport) in plans {
            if reaped.insert(descriptor.connection_key.clone()) {
                let (tx, rx) = oneshot::channel();
                let reaper =
                    LockReaper::with_interval(transport.clone(), self.config.reaper_interval);
                reapers.push(Stop {
                    signal: tx,
                    task: tokio::spawn(reaper.run(rx)),
                });
            }

            let metrics = self.metrics.for_entity(&descriptor.source.to_string());
            let dispatcher = MessageDispatcher::new(
                descriptor,
                transport,
                self.telemetry.clone(),
                metrics,
                self.config.clone(),
            );

            let (tx, rx) = oneshot::channel();
            dispatchers.push(Stop {
                signal: tx,
                task: tokio::spawn(dispatcher.run(rx)),
            });
        }

        info!(
            "Host started {} dispatcher(s) on {} connection(s)",
            dispatchers.len(),
            reapers.len()
        );
        Ok(HostHandle {
            dispatchers,
            reapers,
        })
    }
}

struct Stop<T> {
    signal: oneshot::Sender<()>,
    task: JoinHandle<T>,
}

/// Running host. Dropping it stops the loops as well, without waiting.
pub struct HostHandle {
    dispatchers: Vec<Stop<DrainReport>>,
    reapers: Vec<Stop<()>>,
}

#[derive(Debug, Clone, Default)]
pub struct ShutdownReport {
    pub drained: Vec<DrainReport>,
}

impl ShutdownReport {
    /// Invocations left running past the grace period, over all entities.
    pub fn abandoned(&self) -> usize {
        self.drained.iter().map(|d| d.abandoned).sum()
    }
}

impl HostHandle {
    pub fn dispatcher_count(&self) -> usize {
        self.dispatchers.len()
    }

    /// Stop receiving everywhere, wait for in-flight work (bounded by the
    /// grace period of each dispatcher) and stop the reapers.
    pub async fn shutdown(self) -> ShutdownReport {
        let mut tasks = Vec::with_capacity(self.dispatchers.len());
        for stop in self.dispatchers {
            let _ = stop.signal.send(());
            tasks.push(stop.task);
        }

        let mut report = ShutdownReport::default();
        for task in tasks {
            match task.await {
                Ok(drained) => report.drained.push(drained),
                Err(e) => error!("Dispatcher task failed: {}", e),
            }
        }

        for stop in self.reapers {
            let _ = stop.signal.send(());
            if let Err(e) = stop.task.await {
                error!("Lock reaper task failed: {}", e);
            }
        }

        info!("Host stopped, {} invocation(s) abandoned", report.abandoned());
        report
    }
}
