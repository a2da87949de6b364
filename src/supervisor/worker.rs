//! # Worker abstraction and per-worker context.
//!
//! A [`Worker`] is a named, long-running, cancellable unit supervised by the
//! runtime: the mailbox watcher, the registration engine, the phone-change
//! scheduler. Each execution receives a fresh [`WorkerContext`] — the
//! explicit object that replaces any global mutable state: it owns the
//! cancellation handle and carries the bus and store handles every function
//! in the worker needs.
//!
//! [`WorkerFn`] wraps a closure `F: Fn(WorkerContext) -> Fut`, producing a
//! fresh future per execution, so respawns never observe leftover state.

use std::borrow::Cow;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::WorkerError;
use crate::events::Bus;
use crate::store::Store;

/// Everything a worker execution needs, passed explicitly.
///
/// A respawned worker gets a fresh context; nothing in-memory survives a
/// crash except what the store holds.
#[derive(Clone)]
pub struct WorkerContext {
    /// Cancellation handle; checked at every suspension point.
    pub token: CancellationToken,
    /// Event bus shared with the supervisor and all other workers.
    pub bus: Bus,
    /// Persistent-store collaborator.
    pub store: Arc<dyn Store>,
}

/// Shared handle type for workers.
pub type WorkerRef = Arc<dyn Worker>;

/// A named, supervised, cancellable async unit.
///
/// Implementations should check `ctx.token` at every suspension point and
/// return [`WorkerError::Canceled`] or `Ok(())` promptly during shutdown.
/// Returning `Err(WorkerError::Fail { .. })` marks an unclean exit and asks
/// the supervisor for a respawn.
#[async_trait]
pub trait Worker: Send + Sync + 'static {
    /// Stable, human-readable worker name.
    fn name(&self) -> &str;

    /// Executes the worker until completion, fault, or cancellation.
    async fn run(&self, ctx: WorkerContext) -> Result<(), WorkerError>;
}

/// Function-backed worker implementation.
pub struct WorkerFn<F> {
    name: Cow<'static, str>,
    f: F,
}

impl<F> WorkerFn<F> {
    /// Creates a new function-backed worker.
    pub fn new(name: impl Into<Cow<'static, str>>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }

    /// Creates the worker and returns it as a shared handle.
    pub fn arc(name: impl Into<Cow<'static, str>>, f: F) -> Arc<Self> {
        Arc::new(Self::new(name, f))
    }
}

#[async_trait]
impl<F, Fut> Worker for WorkerFn<F>
where
    F: Fn(WorkerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), WorkerError>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: WorkerContext) -> Result<(), WorkerError> {
        (self.f)(ctx).await
    }
}
