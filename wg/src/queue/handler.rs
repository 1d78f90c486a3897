//! Handler registration
//!
//! Business logic enters the queue only here: each pipeline kind maps to
//! one handler, registered at startup. Jobs claimed by any process run
//! through that process's registered handler, so every process that
//! should execute a kind registers for it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use gatestore::JobKind;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

/// What a handler reports when it cannot produce a result
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The payload did not decode into the handler's input type
    #[error("payload did not decode: {0}")]
    Payload(#[from] serde_json::Error),

    /// The handler's own failure, captured verbatim on the job record
    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// One pipeline kind's business logic
///
/// Handlers receive the opaque payload and return an opaque result; the
/// queue never interprets either. A returned error lands verbatim on the
/// failed record. There is no automatic retry: a handler that wants
/// retries re-enqueues on its own terms.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, payload: serde_json::Value) -> Result<serde_json::Value, HandlerError>;
}

/// A payload type bound to a pipeline kind
///
/// Producers that implement this get typed enqueue: the payload
/// serializes on the way in and the kind comes from the type, so a
/// report payload cannot land on the outreach queue.
pub trait JobPayload: Serialize + DeserializeOwned + Send + 'static {
    const KIND: JobKind;
}

struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, HandlerError>> + Send + 'static,
{
    async fn run(&self, payload: serde_json::Value) -> Result<serde_json::Value, HandlerError> {
        (self.f)(payload).await
    }
}

/// Wrap an async closure as a handler
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn JobHandler>
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

/// Wrap an async closure taking a typed payload as a handler
///
/// Decode failures fail the job with the serde message; they never panic
/// the worker.
pub fn typed_handler<P, F, Fut>(f: F) -> Arc<dyn JobHandler>
where
    P: JobPayload,
    F: Fn(P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, HandlerError>> + Send + 'static,
{
    let f = Arc::new(f);
    handler_fn(move |value: serde_json::Value| {
        let f = f.clone();
        async move {
            let payload: P = serde_json::from_value(value)?;
            f(payload).await
        }
    })
}

/// Kind-to-handler map, fixed at queue construction
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a kind, replacing any previous one
    pub fn register(&mut self, kind: JobKind, handler: Arc<dyn JobHandler>) {
        debug!(kind = %kind, "HandlerRegistry::register: handler registered");
        self.handlers.insert(kind, handler);
    }

    /// Builder-style registration
    pub fn with(mut self, kind: JobKind, handler: Arc<dyn JobHandler>) -> Self {
        self.register(kind, handler);
        self
    }

    pub fn get(&self, kind: JobKind) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(&kind).cloned()
    }

    /// Registered kinds with their handlers, one worker loop each
    pub fn entries(&self) -> Vec<(JobKind, Arc<dyn JobHandler>)> {
        JobKind::ALL
            .into_iter()
            .filter_map(|kind| self.handlers.get(&kind).map(|h| (kind, h.clone())))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }
}
