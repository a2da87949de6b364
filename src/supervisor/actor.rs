//! # WorkerActor: single-worker supervision loop.
//!
//! Runs one [`Worker`] and applies the respawn rule:
//!
//! ```text
//! loop {
//!   ├─► publish WorkerStarting{ worker, attempt }
//!   ├─► worker.run(fresh context)
//!   │     ├─ Ok / Err(Canceled)  ─► publish WorkerStopped, exit
//!   │     ├─ Err(Fatal)          ─► publish WorkerFailed{fatal}, exit
//!   │     ├─ Err(Fail)           ─► publish WorkerFailed
//!   │     └─ panic               ─► contained, treated as Fail
//!   └─► publish RespawnScheduled{ delay }
//!        └─► sleep(fixed delay)  — aborted by shutdown, cancelling the respawn
//! }
//! ```
//!
//! ## Rules
//! - Attempts run sequentially; the attempt counter is monotonic.
//! - The respawn delay is **fixed** (no growth); a shutdown request during
//!   the delay cancels the pending respawn.
//! - Each attempt gets a child token and a fresh [`WorkerContext`]; startup
//!   parameters are re-derived from the store inside `run`.

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::error::WorkerError;
use crate::events::{Bus, Event, Payload};
use crate::store::Store;

use super::worker::{WorkerContext, WorkerRef};

/// Supervises execution of a single worker with fixed-delay respawns.
pub(crate) struct WorkerActor {
    pub worker: WorkerRef,
    pub respawn_delay: Duration,
    pub bus: Bus,
    pub store: Arc<dyn Store>,
}

impl WorkerActor {
    pub(crate) fn new(
        worker: WorkerRef,
        respawn_delay: Duration,
        bus: Bus,
        store: Arc<dyn Store>,
    ) -> Self {
        Self {
            worker,
            respawn_delay,
            bus,
            store,
        }
    }

    /// Runs the actor until the worker stops cleanly, fails fatally, or
    /// shutdown is requested.
    pub(crate) async fn run(self, runtime_token: CancellationToken) {
        let name: Arc<str> = Arc::from(self.worker.name());
        let mut attempt: u64 = 0;

        loop {
            if runtime_token.is_cancelled() {
                break;
            }
            attempt += 1;
            self.bus.publish(Event::new(Payload::WorkerStarting {
                worker: name.clone(),
                attempt,
            }));

            let ctx = WorkerContext {
                token: runtime_token.child_token(),
                bus: self.bus.clone(),
                store: self.store.clone(),
            };
            // A panic is a process-level fault: contained here so it takes
            // the respawn path instead of silently killing supervision.
            let res = std::panic::AssertUnwindSafe(self.worker.run(ctx))
                .catch_unwind()
                .await;

            let error = match res {
                Ok(Ok(())) | Ok(Err(WorkerError::Canceled)) => {
                    self.bus.publish(Event::new(Payload::WorkerStopped {
                        worker: name.clone(),
                    }));
                    break;
                }
                Ok(Err(fatal @ WorkerError::Fatal { .. })) => {
                    tracing::error!(worker = %name, error = %fatal, "worker failed fatally");
                    self.bus.publish(Event::new(Payload::WorkerFailed {
                        worker: name.clone(),
                        reason: Arc::from(fatal.to_string()),
                        fatal: true,
                    }));
                    break;
                }
                Ok(Err(fail)) => fail.to_string(),
                Err(panic) => format!("worker panicked: {}", panic_message(&panic)),
            };

            tracing::error!(worker = %name, attempt, error = %error, delay = ?self.respawn_delay, "unclean exit, respawning");
            self.bus.publish(Event::new(Payload::WorkerFailed {
                worker: name.clone(),
                reason: Arc::from(error.as_str()),
                fatal: false,
            }));

            if runtime_token.is_cancelled() {
                break;
            }
            self.bus.publish(Event::new(Payload::RespawnScheduled {
                worker: name.clone(),
                delay: self.respawn_delay,
            }));

            let sleep = tokio::time::sleep(self.respawn_delay);
            tokio::pin!(sleep);
            tokio::select! {
                _ = &mut sleep => {}
                _ = runtime_token.cancelled() => {
                    tracing::info!(worker = %name, "shutdown during respawn backoff, respawn cancelled");
                    break;
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::supervisor::WorkerFn;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn actor(worker: WorkerRef, delay_ms: u64) -> (WorkerActor, Bus) {
        let bus = Bus::new(64);
        let actor = WorkerActor::new(
            worker,
            Duration::from_millis(delay_ms),
            bus.clone(),
            Arc::new(MemoryStore::new()),
        );
        (actor, bus)
    }

    #[tokio::test]
    async fn test_clean_exit_is_not_respawned() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let worker = WorkerFn::arc("one-shot", move |_ctx| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        let (actor, _bus) = actor(worker, 10);
        actor.run(CancellationToken::new()).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unclean_exit_respawns_after_fixed_delay() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let worker = WorkerFn::arc("flaky", move |_ctx| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(WorkerError::failed("boom"))
                } else {
                    Ok(())
                }
            }
        });
        let (actor, _bus) = actor(worker, 10);
        actor.run(CancellationToken::new()).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fatal_exit_is_not_respawned() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let worker = WorkerFn::arc("doomed", move |_ctx| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(WorkerError::fatal("unrecoverable"))
            }
        });
        let (actor, _bus) = actor(worker, 10);
        actor.run(CancellationToken::new()).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panic_takes_the_respawn_path() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let worker = WorkerFn::arc("panicky", move |_ctx| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("corrupted state");
                }
                Ok(())
            }
        });
        let (actor, _bus) = actor(worker, 10);
        actor.run(CancellationToken::new()).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_shutdown_during_backoff_cancels_pending_respawn() {
        // The worker fails immediately; the actor enters its fixed respawn
        // delay; shutdown arrives mid-backoff. No second attempt may start.
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let worker = WorkerFn::arc("failing", move |_ctx| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(WorkerError::failed("boom"))
            }
        });
        let (actor, bus) = actor(worker, 10_000);
        let mut rx = bus.subscribe();
        let token = CancellationToken::new();

        let handle = tokio::spawn(actor.run(token.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        handle.await.unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        let mut starts = 0;
        let mut respawns_scheduled = 0;
        while let Ok(ev) = rx.try_recv() {
            match ev.payload {
                Payload::WorkerStarting { .. } => starts += 1,
                Payload::RespawnScheduled { .. } => respawns_scheduled += 1,
                _ => {}
            }
        }
        assert_eq!(starts, 1);
        assert_eq!(respawns_scheduled, 1);
    }
}
