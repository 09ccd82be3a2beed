//! Per-instance job scheduler.
//!
//! Registers the instance's jobs with the central scheduler at start, then
//! serves fire and abort events addressed to its subscriber id.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use herald_bus::{
    EntityPath, HandlerContext, JobContext, JobRegistry, JobStatus, MessageHandler, MessageSender,
    SubscriptionFilter, TopicBinding,
};
use herald_core::HandlerResult;
use tracing::{debug, info, instrument, warn};

use crate::{
    protocol::{DispatchType, JobDispatch, SchedulerCommand},
    SchedulerConfig, SchedulerError, SchedulerResult,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// `start` has not completed.
    Unregistered,
    /// Registered, nothing fired yet.
    Registered,
    /// Registered, no fire running.
    Idle,
    /// At least one fire running.
    Dispatching,
}

struct Inner {
    subscriber_id: String,
    jobs: Arc<JobRegistry>,
    sender: MessageSender,
    config: SchedulerConfig,
    registered: AtomicBool,
    fired: AtomicBool,
    running: AtomicUsize,
}

#[derive(Clone)]
pub struct JobScheduler {
    inner: Arc<Inner>,
}

/// Counts one running fire until dropped.
struct Running<'a>(&'a AtomicUsize);

impl<'a> Running<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl JobScheduler {
    pub fn new(
        subscriber_id: impl Into<String>,
        jobs: Arc<JobRegistry>,
        sender: MessageSender,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                subscriber_id: subscriber_id.into(),
                jobs,
                sender,
                config,
                registered: AtomicBool::new(false),
                fired: AtomicBool::new(false),
                running: AtomicUsize::new(0),
            }),
        }
    }

    pub fn subscriber_id(&self) -> &str {
        &self.inner.subscriber_id
    }

    pub fn jobs(&self) -> &Arc<JobRegistry> {
        &self.inner.jobs
    }

    pub fn state(&self) -> SchedulerState {
        let inner = &self.inner;
        if !inner.registered.load(Ordering::SeqCst) {
            SchedulerState::Unregistered
        } else if inner.running.load(Ordering::SeqCst) > 0 {
            SchedulerState::Dispatching
        } else if inner.fired.load(Ordering::SeqCst) {
            SchedulerState::Idle
        } else {
            SchedulerState::Registered
        }
    }

    /// The dispatch-topic subscription this instance listens on, filtered to
    /// its own subscriber id.
    pub fn binding(&self) -> TopicBinding {
        let config = &self.inner.config;
        TopicBinding::new(
            config.dispatch_topic.clone(),
            self.inner.subscriber_id.clone(),
            config.connection_key.clone(),
            self.clone(),
        )
        .with_filter(SubscriptionFilter::Label(self.inner.subscriber_id.clone()))
        .with_max_concurrent_calls(config.max_concurrent_calls)
    }

    /// Send a Register for every job, each with status `Running`.
    #[instrument(skip(self), fields(subscriber = %self.inner.subscriber_id))]
    pub async fn start(&self) -> SchedulerResult<usize> {
        let queue = EntityPath::queue(self.inner.config.command_queue.clone());
        let mut registered = 0;

        for descriptor in self.inner.jobs.descriptors() {
            self.inner.jobs.statuses().set(&descriptor.name, JobStatus::Running);

            let command = SchedulerCommand::register(
                &self.inner.subscriber_id,
                &descriptor.name,
                &descriptor.schedule,
                JobStatus::Running,
            );
            let outcome = self.inner.sender.send_json(&queue, None, &command).await?;
            if !outcome.is_sent() {
                return Err(SchedulerError::PublishFailed {
                    entity: queue.to_string(),
                    what: "Register",
                });
            }
            registered += 1;
        }

        self.inner.registered.store(true, Ordering::SeqCst);
        info!("Registered {} job(s) as {}", registered, self.inner.subscriber_id);
        Ok(registered)
    }

    async fn reply(&self, command: SchedulerCommand) {
        let queue = EntityPath::queue(self.inner.config.command_queue.clone());
        match self.inner.sender.send_json(&queue, None, &command).await {
            Ok(outcome) if outcome.is_sent() => {
                debug!("Replied {:?} for {}", command.command_type, command.job_name)
            }
            Ok(_) => warn!(
                "Reply {:?} for {} was not delivered",
                command.command_type, command.job_name
            ),
            Err(e) => warn!("Could not encode reply for {}: {}", command.job_name, e),
        }
    }
}

#[async_trait]
impl MessageHandler for JobScheduler {
    type Payload = JobDispatch;

    async fn handle(&self, dispatch: JobDispatch, ctx: HandlerContext) -> HandlerResult {
        let Some(descriptor) = self.inner.jobs.get(&dispatch.job_name) else {
            warn!("Job {} is not registered here", dispatch.job_name);
            self.reply(SchedulerCommand::not_found(&dispatch)).await;
            return Ok(());
        };

        if dispatch.command_type == DispatchType::Abort {
            self.inner.jobs.statuses().set(&descriptor.name, JobStatus::Aborted);
            info!("Job {} aborted", descriptor.name);
            return Ok(());
        }

        if self.inner.jobs.statuses().get(&descriptor.name) == Some(JobStatus::Aborted) {
            debug!("Job {} is aborted, not running it", descriptor.name);
            self.reply(SchedulerCommand::acknowledge(&dispatch)).await;
            return Ok(());
        }

        descriptor.auth.authorize(dispatch.transaction_context.as_ref())?;

        self.inner.fired.store(true, Ordering::SeqCst);
        {
            let _running = Running::enter(&self.inner.running);
            let mut job = descriptor.instantiate();
            job.run(JobContext {
                job_name: descriptor.name.clone(),
                partition: dispatch.partition,
                activation_payload: dispatch.activation_payload.clone(),
                transaction: ctx.transaction,
            })
            .await?;
        }

        self.reply(SchedulerCommand::acknowledge(&dispatch)).await;
        Ok(())
    }
}
