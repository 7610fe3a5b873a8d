// SPDX-License-Identifier: MIT OR Apache-2.0
//! Handler registry and the bounded blocking-handler executor.

use asap_core::{Envelope, Manifest};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::debug;

/// Default size of the blocking-handler worker pool.
pub const DEFAULT_MAX_THREADS: usize = 8;

/// Errors from resolving or executing a handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// No handler registered for the envelope's payload type.
    #[error("no handler registered for payload type {payload_type:?}")]
    NotFound {
        /// The unresolved payload type.
        payload_type: String,
    },

    /// Every blocking-handler worker is busy.
    #[error("handler worker pool exhausted ({active_threads}/{max_threads} workers busy)")]
    PoolExhausted {
        /// Pool capacity.
        max_threads: usize,
        /// Workers currently executing.
        active_threads: usize,
    },

    /// The handler itself failed.
    #[error("handler failed: {0}")]
    Failed(String),
}

/// A payload handler: takes the request envelope and the serving agent's
/// manifest, returns the reply envelope.
///
/// Async handlers run on the ambient scheduler and never consume worker
/// pool capacity; register CPU-bound or otherwise blocking work through
/// [`HandlerRegistry::register_blocking`] instead.
#[async_trait]
pub trait AsapHandler: Send + Sync {
    /// Produce the reply envelope for `envelope`.
    async fn handle(&self, envelope: Envelope, manifest: Manifest)
    -> Result<Envelope, HandlerError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> AsapHandler for FnHandler<F>
where
    F: Fn(Envelope, Manifest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Envelope, HandlerError>> + Send,
{
    async fn handle(
        &self,
        envelope: Envelope,
        manifest: Manifest,
    ) -> Result<Envelope, HandlerError> {
        (self.0)(envelope, manifest).await
    }
}

/// Wrap an async closure as an [`AsapHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn AsapHandler>
where
    F: Fn(Envelope, Manifest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Envelope, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// A synchronous handler executed on the bounded worker pool.
struct BlockingHandler<F> {
    f: Arc<F>,
    permits: Arc<Semaphore>,
    max_threads: usize,
}

#[async_trait]
impl<F> AsapHandler for BlockingHandler<F>
where
    F: Fn(Envelope, Manifest) -> Result<Envelope, HandlerError> + Send + Sync + 'static,
{
    async fn handle(
        &self,
        envelope: Envelope,
        manifest: Manifest,
    ) -> Result<Envelope, HandlerError> {
        // No waiting: when no worker is free the submission fails
        // immediately and the server surfaces 503.
        let Ok(permit) = self.permits.clone().try_acquire_owned() else {
            return Err(HandlerError::PoolExhausted {
                max_threads: self.max_threads,
                active_threads: self.max_threads - self.permits.available_permits(),
            });
        };
        let f = self.f.clone();
        let result = tokio::task::spawn_blocking(move || f(envelope, manifest))
            .await
            .map_err(|e| HandlerError::Failed(format!("blocking handler panicked: {e}")))?;
        drop(permit);
        result
    }
}

/// Maps `payload_type` → handler and owns the blocking worker pool.
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn AsapHandler>>>,
    blocking_permits: Arc<Semaphore>,
    max_threads: usize,
}

impl HandlerRegistry {
    /// Registry with the default worker pool size.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_threads(DEFAULT_MAX_THREADS)
    }

    /// Registry whose blocking pool holds `max_threads` workers.
    #[must_use]
    pub fn with_max_threads(max_threads: usize) -> Self {
        let max_threads = max_threads.max(1);
        Self {
            handlers: RwLock::new(HashMap::new()),
            blocking_permits: Arc::new(Semaphore::new(max_threads)),
            max_threads,
        }
    }

    /// Pool capacity for blocking handlers.
    #[must_use]
    pub fn max_threads(&self) -> usize {
        self.max_threads
    }

    /// Workers currently executing blocking handlers.
    #[must_use]
    pub fn active_threads(&self) -> usize {
        self.max_threads - self.blocking_permits.available_permits()
    }

    /// Register an async handler for `payload_type`, replacing any
    /// previous registration.
    pub fn register(&self, payload_type: impl Into<String>, handler: Arc<dyn AsapHandler>) {
        let payload_type = payload_type.into();
        debug!(payload_type = %payload_type, "handler registered");
        self.handlers
            .write()
            .expect("handler registry lock poisoned")
            .insert(payload_type, handler);
    }

    /// Register a synchronous handler; executions are gated by the
    /// bounded worker pool.
    pub fn register_blocking<F>(&self, payload_type: impl Into<String>, f: F)
    where
        F: Fn(Envelope, Manifest) -> Result<Envelope, HandlerError> + Send + Sync + 'static,
    {
        self.register(
            payload_type,
            Arc::new(BlockingHandler {
                f: Arc::new(f),
                permits: self.blocking_permits.clone(),
                max_threads: self.max_threads,
            }),
        );
    }

    /// Resolve the handler for `payload_type`.
    #[must_use]
    pub fn resolve(&self, payload_type: &str) -> Option<Arc<dyn AsapHandler>> {
        self.handlers
            .read()
            .expect("handler registry lock poisoned")
            .get(payload_type)
            .cloned()
    }

    /// Registered payload types, used to bound metric label spaces.
    #[must_use]
    pub fn known_payload_types(&self) -> Vec<String> {
        self.handlers
            .read()
            .expect("handler registry lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Resolve and execute in one step.
    ///
    /// # Errors
    ///
    /// [`HandlerError::NotFound`] for unknown payload types, otherwise
    /// whatever the handler returns.
    pub async fn dispatch(
        &self,
        envelope: Envelope,
        manifest: Manifest,
    ) -> Result<Envelope, HandlerError> {
        let handler = self
            .resolve(envelope.payload_type())
            .ok_or_else(|| HandlerError::NotFound {
                payload_type: envelope.payload_type().to_string(),
            })?;
        handler.handle(envelope, manifest).await
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
