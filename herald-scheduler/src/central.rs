//! Central coordinator.
//!
//! Consumes the command queue, keeps the job catalog and one filtered
//! dispatch subscription per subscriber, and publishes fire/abort events.
//! A fire never blocks: the caller gets a [`PendingDispatch`] and a watchdog
//! task turns a missing reply into a `TimedOut` outcome reported to telemetry.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use herald_bus::observability::ReplyTimeout;
use herald_bus::{
    EntityPath, HandlerContext, JobStatus, MessageHandler, MessageSender, QueueBinding,
    SubscriptionFilter, Telemetry, TracingTelemetry,
};
use herald_core::{HandlerError, HandlerResult, TransactionContext};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, warn};

use crate::{
    catalog::{FireOutcome, JobCatalog},
    protocol::{CommandType, JobDispatch, SchedulerCommand},
    SchedulerConfig, SchedulerError, SchedulerResult,
};

struct PendingReply {
    subscriber_id: String,
    job_name: String,
    partition: u32,
    reply: oneshot::Sender<FireOutcome>,
    /// Wakes the watchdog once a reply settles the fire.
    settled: oneshot::Sender<()>,
}

impl PendingReply {
    fn matches(&self, command: &SchedulerCommand) -> bool {
        self.subscriber_id == command.subscriber_id && self.job_name == command.job_name
    }
}

struct Inner {
    catalog: Arc<dyn JobCatalog>,
    sender: MessageSender,
    telemetry: Arc<dyn Telemetry>,
    config: SchedulerConfig,
    pending: DashMap<String, PendingReply>,
}

#[derive(Clone)]
pub struct CentralScheduler {
    inner: Arc<Inner>,
}

/// A published fire waiting for its reply.
#[derive(Debug)]
pub struct PendingDispatch {
    pub dispatch_id: String,
    pub subscriber_id: String,
    pub job_name: String,
    pub partition: u32,
    reply: oneshot::Receiver<FireOutcome>,
}

impl PendingDispatch {
    /// Resolves once the reply arrives or the reply timeout passes.
    pub async fn outcome(self) -> FireOutcome {
        self.reply.await.unwrap_or(FireOutcome::TimedOut)
    }
}

impl CentralScheduler {
    pub fn new(
        catalog: Arc<dyn JobCatalog>,
        sender: MessageSender,
        config: SchedulerConfig,
    ) -> Self {
        Self::with_telemetry(catalog, sender, config, Arc::new(TracingTelemetry))
    }

    pub fn with_telemetry(
        catalog: Arc<dyn JobCatalog>,
        sender: MessageSender,
        config: SchedulerConfig,
        telemetry: Arc<dyn Telemetry>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                catalog,
                sender,
                telemetry,
                config,
                pending: DashMap::new(),
            }),
        }
    }

    pub fn catalog(&self) -> &Arc<dyn JobCatalog> {
        &self.inner.catalog
    }

    /// Fires still waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// The command-queue binding to register with the host.
    pub fn binding(&self) -> QueueBinding {
        let config = &self.inner.config;
        QueueBinding::new(
            config.command_queue.clone(),
            config.connection_key.clone(),
            self.clone(),
        )
        .with_max_concurrent_calls(config.max_concurrent_calls)
    }

    fn dispatch_topic(&self) -> EntityPath {
        EntityPath::topic(self.inner.config.dispatch_topic.clone())
    }

    /// Publish a fire for one partition of `job_name`.
    ///
    /// Jobs missing from the catalog are still published so the owning
    /// instance can answer `NotFound`.
    #[instrument(skip(self, activation_payload, transaction))]
    pub async fn fire(
        &self,
        subscriber_id: &str,
        job_name: &str,
        partition: u32,
        activation_payload: Value,
        transaction: Option<TransactionContext>,
    ) -> SchedulerResult<PendingDispatch> {
        if let Some(entry) = self.inner.catalog.get(subscriber_id, job_name).await? {
            if entry.status == JobStatus::Aborted {
                return Err(SchedulerError::JobAborted {
                    subscriber: subscriber_id.to_string(),
                    job: job_name.to_string(),
                });
            }
            if partition >= entry.schedule.partition_count {
                return Err(SchedulerError::InvalidPartition {
                    job: job_name.to_string(),
                    partition,
                    count: entry.schedule.partition_count,
                });
            }
        }

        let mut dispatch =
            JobDispatch::fire(subscriber_id, job_name, partition, activation_payload);
        if let Some(ctx) = transaction {
            dispatch = dispatch.with_context(ctx);
        }

        let (tx, rx) = oneshot::channel();
        let (settled_tx, settled_rx) = oneshot::channel();
        self.inner.pending.insert(
            dispatch.dispatch_id.clone(),
            PendingReply {
                subscriber_id: subscriber_id.to_string(),
                job_name: job_name.to_string(),
                partition,
                reply: tx,
                settled: settled_tx,
            },
        );

        let topic = self.dispatch_topic();
        let sent = match self
            .inner
            .sender
            .send_json(&topic, Some(subscriber_id), &dispatch)
            .await
        {
            Ok(outcome) => outcome.is_sent(),
            Err(e) => {
                self.inner.pending.remove(&dispatch.dispatch_id);
                return Err(e.into());
            }
        };
        if !sent {
            self.inner.pending.remove(&dispatch.dispatch_id);
            return Err(SchedulerError::PublishFailed {
                entity: topic.to_string(),
                what: "Fire",
            });
        }

        self.watch(dispatch.dispatch_id.clone(), settled_rx);
        debug!(
            "Fired {} partition {} as {}",
            job_name, partition, dispatch.dispatch_id
        );

        Ok(PendingDispatch {
            dispatch_id: dispatch.dispatch_id,
            subscriber_id: subscriber_id.to_string(),
            job_name: job_name.to_string(),
            partition,
            reply: rx,
        })
    }

    /// One fire per partition of a catalogued job, or a single partition 0
    /// fire for an unknown one.
    pub async fn fire_partitions(
        &self,
        subscriber_id: &str,
        job_name: &str,
        activation_payload: Value,
        transaction: Option<TransactionContext>,
    ) -> SchedulerResult<Vec<PendingDispatch>> {
        let count = self
            .inner
            .catalog
            .get(subscriber_id, job_name)
            .await?
            .map_or(1, |entry| entry.schedule.partition_count);

        let mut dispatches = Vec::with_capacity(count as usize);
        for partition in 0..count {
            dispatches.push(
                self.fire(
                    subscriber_id,
                    job_name,
                    partition,
                    activation_payload.clone(),
                    transaction.clone(),
                )
                .await?,
            );
        }
        Ok(dispatches)
    }

    /// Mark the job Aborted and tell the owning instance. Returns the
    /// previous catalog status, `None` when the job was never registered.
    #[instrument(skip(self))]
    pub async fn abort(
        &self,
        subscriber_id: &str,
        job_name: &str,
    ) -> SchedulerResult<Option<JobStatus>> {
        let previous = self
            .inner
            .catalog
            .set_status(subscriber_id, job_name, JobStatus::Aborted)
            .await?;

        let topic = self.dispatch_topic();
        let outcome = self
            .inner
            .sender
            .send_json(&topic, Some(subscriber_id), &JobDispatch::abort(subscriber_id, job_name))
            .await?;
        if !outcome.is_sent() {
            return Err(SchedulerError::PublishFailed {
                entity: topic.to_string(),
                what: "Abort",
            });
        }

        info!("Aborted {} of {}", job_name, subscriber_id);
        Ok(previous)
    }

    /// Time out the fire unless a reply settles it first.
    fn watch(&self, dispatch_id: String, settled: oneshot::Receiver<()>) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            if tokio::time::timeout(inner.config.reply_timeout, settled)
                .await
                .is_ok()
            {
                return;
            }

            let Some((_, pending)) = inner.pending.remove(&dispatch_id) else {
                return;
            };
            if let Err(e) = inner
                .catalog
                .record_outcome(
                    &pending.subscriber_id,
                    &pending.job_name,
                    FireOutcome::TimedOut,
                )
                .await
            {
                warn!("Could not record timeout of {}: {}", dispatch_id, e);
            }
            inner.telemetry.track_reply_timeout(&ReplyTimeout {
                dispatch_id,
                job_name: pending.job_name,
                subscriber_id: pending.subscriber_id,
                partition: pending.partition,
                waited: inner.config.reply_timeout,
            });
            let _ = pending.reply.send(FireOutcome::TimedOut);
        });
    }

    async fn register(&self, command: &SchedulerCommand) -> HandlerResult {
        let schedule = command.schedule().ok_or_else(|| {
            HandlerError::unhandled("Register passed validation without a schedule")
        })?;
        let status = command.status.unwrap_or_default();

        self.inner
            .catalog
            .upsert(&command.subscriber_id, &command.job_name, schedule, status)
            .await
            .map_err(HandlerError::unhandled)?;

        self.inner
            .sender
            .transport()
            .ensure_subscription(
                &self.inner.config.dispatch_topic,
                &command.subscriber_id,
                SubscriptionFilter::Label(command.subscriber_id.clone()),
            )
            .await
            .map_err(HandlerError::unhandled)?;

        info!("Registered {} for {}", command.job_name, command.subscriber_id);
        Ok(())
    }

    /// Settle the pending fire the reply names. The waiter gets the outcome
    /// before the catalog is updated, so a catalog failure only fails the
    /// reply message.
    async fn resolve(&self, command: &SchedulerCommand, outcome: FireOutcome) -> HandlerResult {
        let dispatch_id = command.dispatch_id.as_deref().unwrap_or_default();

        let Some((_, pending)) = self
            .inner
            .pending
            .remove_if(dispatch_id, |_, pending| pending.matches(command))
        else {
            if let Some(pending) = self.inner.pending.get(dispatch_id) {
                warn!(
                    "Reply {:?} from {} for {} does not match fire {} ({} of {})",
                    command.command_type,
                    command.subscriber_id,
                    command.job_name,
                    dispatch_id,
                    pending.job_name,
                    pending.subscriber_id
                );
            } else {
                warn!(
                    "Reply {:?} for {} of {} matches no pending fire ({})",
                    command.command_type, command.job_name, command.subscriber_id, dispatch_id
                );
            }
            return Ok(());
        };

        let _ = pending.settled.send(());
        let _ = pending.reply.send(outcome);

        self.inner
            .catalog
            .record_outcome(&pending.subscriber_id, &pending.job_name, outcome)
            .await
            .map_err(HandlerError::unhandled)
    }
}

#[async_trait]
impl MessageHandler for CentralScheduler {
    type Payload = SchedulerCommand;

    async fn handle(&self, command: SchedulerCommand, _ctx: HandlerContext) -> HandlerResult {
        command.validate()?;

        match command.command_type {
            CommandType::Register => self.register(&command).await,
            CommandType::Abort => {
                let previous = self
                    .inner
                    .catalog
                    .set_status(&command.subscriber_id, &command.job_name, JobStatus::Aborted)
                    .await
                    .map_err(HandlerError::unhandled)?;
                if previous.is_none() {
                    warn!(
                        "Abort for unregistered {} of {}",
                        command.job_name, command.subscriber_id
                    );
                }
                Ok(())
            }
            CommandType::Acknowledge => self.resolve(&command, FireOutcome::Acknowledged).await,
            CommandType::NotFound => self.resolve(&command, FireOutcome::NotFound).await,
        }
    }
}
