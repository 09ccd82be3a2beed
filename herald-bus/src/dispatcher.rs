//! Per-entity consumer loop.
//!
//! One [`MessageDispatcher`] serves one queue or subscription. Every message
//! goes through decode, authorize, invoke and settle; the only exits are a
//! completion or a classified dead-letter, both reported.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use herald_core::{FailureKind, HandlerError, TransactionContext};
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    classifier::DeadLetterClassifier,
    config::BusConfig,
    handler::HandlerContext,
    observability::{DispatchFailure, DispatchMetrics, Telemetry},
    registry::HandlerDescriptor,
    transport::Transport,
    types::{EntityPath, InboundMessage},
};

const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// How one message ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Completed,
    DeadLettered {
        kind: FailureKind,
        reason: &'static str,
    },
    /// The failure was classified and reported but the message could not be
    /// parked: receive-and-delete, or the lock was already gone.
    Unsettled {
        kind: FailureKind,
        reason: &'static str,
    },
    /// The handler succeeded but the completion was refused; the broker will
    /// redeliver.
    CompleteFailed(String),
}

impl DispatchOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// What shutdown left behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainReport {
    pub entity: EntityPath,
    /// Invocations still running when the grace period ran out. They keep
    /// running detached; only the dispatcher let go of them.
    pub abandoned: usize,
}

#[derive(Clone)]
pub struct MessageDispatcher {
    descriptor: Arc<HandlerDescriptor>,
    transport: Arc<dyn Transport>,
    telemetry: Arc<dyn Telemetry>,
    metrics: Arc<DispatchMetrics>,
    config: BusConfig,
}

impl MessageDispatcher {
    pub fn new(
        descriptor: Arc<HandlerDescriptor>,
        transport: Arc<dyn Transport>,
        telemetry: Arc<dyn Telemetry>,
        metrics: Arc<DispatchMetrics>,
        config: BusConfig,
    ) -> Self {
        Self {
            descriptor,
            transport,
            telemetry,
            metrics,
            config,
        }
    }

    pub fn descriptor(&self) -> &Arc<HandlerDescriptor> {
        &self.descriptor
    }

    pub fn metrics(&self) -> &Arc<DispatchMetrics> {
        &self.metrics
    }

    /// Receive until `shutdown` fires (or its sender is dropped), then drain.
    ///
    /// A pool slot is taken before each receive and given back only after
    /// the message is settled, so at most `max_concurrent_calls` handlers run
    /// and nothing is pulled from the broker while the pool is full.
    pub async fn run(self, mut shutdown: oneshot::Receiver<()>) -> DrainReport {
        let source = self.descriptor.source.clone();
        let mode = self.descriptor.delivery_mode;
        let slots = Arc::new(Semaphore::new(self.descriptor.max_concurrent_calls));
        let mut in_flight = JoinSet::new();

        info!(
            "Dispatcher for {} started ({} slots, {:?})",
            source, self.descriptor.max_concurrent_calls, mode
        );

        loop {
            let permit = tokio::select! {
                biased;
                _ = &mut shutdown => break,
                permit = slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            while let Some(joined) = in_flight.try_join_next() {
                if let Err(e) = joined {
                    error!("Dispatch task for {} failed: {}", source, e);
                }
            }

            let received = tokio::select! {
                biased;
                _ = &mut shutdown => break,
                received = self.transport.receive(&source, mode, self.config.receive_wait) => {
                    received
                }
            };

            match received {
                Ok(Some(message)) => {
                    let this = self.clone();
                    in_flight.spawn(async move {
                        let _permit = permit;
                        this.process(message).await
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    error!("Receive from {} failed: {}", source, e);
                    drop(permit);
                    tokio::select! {
                        biased;
                        _ = &mut shutdown => break,
                        _ = tokio::time::sleep(RECEIVE_ERROR_BACKOFF) => {}
                    }
                }
            }
        }

        info!("Dispatcher for {} stopping, {} in flight", source, in_flight.len());
        let abandoned = drain(&mut in_flight, self.config.shutdown_grace).await;
        if abandoned > 0 {
            warn!(
                "Released {} with {} invocation(s) still running after {:?}",
                source, abandoned, self.config.shutdown_grace
            );
        }

        DrainReport {
            entity: source,
            abandoned,
        }
    }

    /// Run one delivered message to its end.
    #[instrument(
        skip(self, message),
        fields(
            entity = %self.descriptor.source,
            message_id = %message.message_id,
            delivery_count = message.delivery_count
        )
    )]
    pub async fn process(&self, message: InboundMessage) -> DispatchOutcome {
        self.metrics.increment_received();

        let prepared = match self.descriptor.handler().prepare(&message.body) {
            Ok(prepared) => prepared,
            Err(e) => return self.fail(&message, None, e).await,
        };

        if let Err(e) = self.descriptor.auth.authorize(prepared.context.as_ref()) {
            let operation_id = prepared.context.as_ref().map(|c| c.operation_id.clone());
            return self.fail(&message, operation_id, e).await;
        }

        let transaction = prepared.context.clone().unwrap_or_else(TransactionContext::new);
        let operation_id = transaction.operation_id.clone();
        let ctx = HandlerContext::for_message(&message, transaction);

        let result = {
            let _running = self.metrics.enter();
            AssertUnwindSafe(prepared.invoke(ctx))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(HandlerError::unhandled(panic_text(panic.as_ref()))))
        };

        match result {
            Ok(()) => self.complete(&message).await,
            Err(e) => self.fail(&message, Some(operation_id), e).await,
        }
    }

    async fn complete(&self, message: &InboundMessage) -> DispatchOutcome {
        if let Some(lock) = &message.lock_token {
            if let Err(e) = self.transport.complete(&message.source, lock).await {
                warn!("Could not complete message {}: {}", message.message_id, e);
                return DispatchOutcome::CompleteFailed(e.to_string());
            }
        }

        self.metrics.increment_completed();
        debug!("Completed message {}", message.message_id);
        DispatchOutcome::Completed
    }

    async fn fail(
        &self,
        message: &InboundMessage,
        operation_id: Option<String>,
        error: HandlerError,
    ) -> DispatchOutcome {
        let kind = error.kind();
        let classification = DeadLetterClassifier::classify(&error);

        let dead_lettered = match &message.lock_token {
            Some(lock) => match self
                .transport
                .dead_letter(
                    &message.source,
                    lock,
                    classification.reason,
                    &classification.description,
                )
                .await
            {
                Ok(()) => true,
                Err(e) => {
                    error!("Could not dead-letter message {}: {}", message.message_id, e);
                    false
                }
            },
            None => false,
        };

        if dead_lettered {
            self.metrics.increment_dead_lettered();
        } else {
            self.metrics.increment_unsettled_failures();
        }

        self.telemetry.track_dispatch_failure(&DispatchFailure {
            entity: message.source.to_string(),
            message_id: Some(message.message_id.clone()),
            operation_id,
            kind,
            reason: classification.reason,
            description: classification.description,
            dead_lettered,
        });

        if dead_lettered {
            DispatchOutcome::DeadLettered {
                kind,
                reason: classification.reason,
            }
        } else {
            DispatchOutcome::Unsettled {
                kind,
                reason: classification.reason,
            }
        }
    }
}

/// Wait for every task up to `grace`, then detach the rest.
async fn drain(in_flight: &mut JoinSet<DispatchOutcome>, grace: Duration) -> usize {
    let deadline = tokio::time::sleep(grace);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            joined = in_flight.join_next() => match joined {
                Some(Err(e)) => error!("Dispatch task failed during drain: {}", e),
                Some(Ok(_)) => {}
                None => return 0,
            },
            _ = &mut deadline => {
                let abandoned = in_flight.len();
                in_flight.detach_all();
                return abandoned;
            }
        }
    }
}

pub(crate) fn panic_text(panic: &(dyn Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {text}")
    } else if let Some(text) = panic.downcast_ref::<String>() {
        format!("handler panicked: {text}")
    } else {
        "handler panicked".to_string()
    }
}
