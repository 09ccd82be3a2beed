//! Handler traits and their type-erased form.
//!
//! A [`MessageHandler`] names its payload type. The registry erases it into
//! an [`ErasedMessageHandler`] so the dispatcher can decode, authorize and
//! invoke without knowing the concrete type: runtime dispatch only happens at
//! the binding boundary.

use std::any::type_name;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use herald_core::{HandlerError, HandlerResult, TransactionContext};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::types::{EntityPath, InboundMessage, MessageId};

/// A message body a handler can receive.
pub trait Payload: DeserializeOwned + Send + 'static {
    /// The embedded `transactionContext`, used for authorization.
    fn transaction_context(&self) -> Option<&TransactionContext> {
        None
    }
}

/// Wire shape `{ "transactionContext": {..}, ..fields of T }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<T> {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_context: Option<TransactionContext>,
    #[serde(flatten)]
    pub body: T,
}

impl<T> Envelope<T> {
    pub fn new(body: T) -> Self {
        Self {
            transaction_context: None,
            body,
        }
    }

    pub fn with_context(body: T, ctx: TransactionContext) -> Self {
        Self {
            transaction_context: Some(ctx),
            body,
        }
    }
}

impl<T> Payload for Envelope<T>
where
    T: DeserializeOwned + Send + 'static,
{
    fn transaction_context(&self) -> Option<&TransactionContext> {
        self.transaction_context.as_ref()
    }
}

/// Delivery metadata plus the transaction context owned by this invocation.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub message_id: MessageId,
    pub source: EntityPath,
    pub label: Option<String>,
    pub delivery_count: u32,
    pub enqueued_at: DateTime<Utc>,
    pub transaction: TransactionContext,
}

impl HandlerContext {
    pub fn new(message_id: MessageId, source: EntityPath, transaction: TransactionContext) -> Self {
        Self {
            message_id,
            source,
            label: None,
            delivery_count: 1,
            enqueued_at: Utc::now(),
            transaction,
        }
    }

    pub(crate) fn for_message(message: &InboundMessage, transaction: TransactionContext) -> Self {
        Self {
            message_id: message.message_id.clone(),
            source: message.source.clone(),
            label: message.label.clone(),
            delivery_count: message.delivery_count,
            enqueued_at: message.enqueued_at,
            transaction,
        }
    }

    pub fn operation_id(&self) -> &str {
        &self.transaction.operation_id
    }
}

#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    type Payload: Payload;

    async fn handle(&self, payload: Self::Payload, ctx: HandlerContext) -> HandlerResult;
}

/// A decoded message, ready to be authorized and then run.
pub struct PreparedInvocation {
    pub context: Option<TransactionContext>,
    invoke: Box<dyn FnOnce(HandlerContext) -> BoxFuture<'static, HandlerResult> + Send>,
}

impl PreparedInvocation {
    pub async fn invoke(self, ctx: HandlerContext) -> HandlerResult {
        (self.invoke)(ctx).await
    }
}

/// Type-erased message handler for runtime dispatch
pub trait ErasedMessageHandler: Send + Sync {
    /// Deserialize the body. Failure is always [`HandlerError::InvalidInput`].
    fn prepare(&self, body: &[u8]) -> Result<PreparedInvocation, HandlerError>;

    fn payload_type(&self) -> &'static str;

    fn handler_type(&self) -> &'static str;
}

pub(crate) struct TypedHandler<H> {
    handler: Arc<H>,
}

impl<H> TypedHandler<H> {
    pub(crate) fn new(handler: H) -> Self {
        Self {
            handler: Arc::new(handler),
        }
    }
}

impl<H: MessageHandler> ErasedMessageHandler for TypedHandler<H> {
    fn prepare(&self, body: &[u8]) -> Result<PreparedInvocation, HandlerError> {
        let payload: H::Payload =
            serde_json::from_slice(body).map_err(|e| HandlerError::undecodable(&e))?;
        let context = payload.transaction_context().cloned();
        let handler = self.handler.clone();

        Ok(PreparedInvocation {
            context,
            invoke: Box::new(move |ctx| {
                Box::pin(async move { handler.handle(payload, ctx).await })
            }),
        })
    }

    fn payload_type(&self) -> &'static str {
        type_name::<H::Payload>()
    }

    fn handler_type(&self) -> &'static str {
        type_name::<H>()
    }
}
