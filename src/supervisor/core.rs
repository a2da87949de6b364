//! # Supervisor: spawns named workers, respawns crashes, drives shutdown.
//!
//! The [`Supervisor`] owns the event bus and the store handle. It spawns one
//! [`WorkerActor`](super::actor::WorkerActor) per named worker, answers
//! account-binding requests, handles termination signals, and enforces the
//! shutdown grace window.
//!
//! ## Shutdown path
//! ```text
//! signal observed
//!   └─► Bus.publish(ShutdownRequested)
//!   └─► runtime token cancelled  → propagates to every worker context,
//!                                  cancelling waits and pending respawns
//!   └─► wait up to Config::grace:
//!          ├─ all workers joined → publish AllStoppedWithin → Ok(())
//!          └─ grace elapsed      → publish GraceExceeded
//!                                  → Err(GraceExceeded { stuck })
//! ```
//!
//! A graceful result maps to process exit code 0 in an embedding binary;
//! errors (startup failure, grace exceeded) map to 1.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::RuntimeError;
use crate::events::{Bus, Event, Payload};
use crate::store::Store;

use super::actor::WorkerActor;
use super::shutdown;
use super::worker::WorkerRef;

/// How one worker is supervised.
pub struct WorkerSpec {
    worker: WorkerRef,
    respawn_delay: std::time::Duration,
}

impl WorkerSpec {
    /// Explicit respawn delay.
    pub fn new(worker: WorkerRef, respawn_delay: std::time::Duration) -> Self {
        Self {
            worker,
            respawn_delay,
        }
    }

    /// Inherits the fixed respawn delay from global config.
    pub fn with_defaults(worker: WorkerRef, cfg: &Config) -> Self {
        Self {
            worker,
            respawn_delay: cfg.respawn_delay,
        }
    }

    /// Convenience: the worker's name.
    pub fn name(&self) -> &str {
        self.worker.name()
    }
}

/// Coordinates worker actors, binding requests, and graceful shutdown.
pub struct Supervisor {
    /// Global runtime configuration.
    pub cfg: Config,
    /// Event bus shared with all workers.
    pub bus: Bus,
    /// Persistent-store collaborator.
    pub store: Arc<dyn Store>,
}

impl Supervisor {
    /// Creates a supervisor with the given config and store.
    pub fn new(cfg: Config, store: Arc<dyn Store>) -> Self {
        let bus = Bus::new(cfg.bus_capacity_clamped());
        Self { cfg, bus, store }
    }

    /// Handle to the shared bus (for publishing external requests and
    /// subscribing observers).
    pub fn bus(&self) -> Bus {
        self.bus.clone()
    }

    /// Runs the provided workers until either:
    /// - all actors exit on their own, or
    /// - a termination signal arrives → graceful shutdown (which may end
    ///   with the grace window exceeded).
    pub async fn run(&self, workers: Vec<WorkerSpec>) -> Result<(), RuntimeError> {
        let token = CancellationToken::new();
        let _responder =
            spawn_account_responder(self.bus.clone(), self.store.clone(), token.child_token());

        let mut set = JoinSet::new();
        let mut remaining = BTreeSet::new();
        for spec in workers {
            let name = spec.name().to_string();
            remaining.insert(name.clone());
            let actor = WorkerActor::new(
                spec.worker,
                spec.respawn_delay,
                self.bus.clone(),
                self.store.clone(),
            );
            let child = token.child_token();
            set.spawn(async move {
                actor.run(child).await;
                name
            });
        }

        let signalled = tokio::select! {
            _ = shutdown::wait_for_shutdown_signal() => true,
            _ = drain(&mut set, &mut remaining) => false,
        };
        if !signalled {
            token.cancel();
            return Ok(());
        }

        tracing::info!("termination signal observed, stopping workers");
        self.bus.publish(Event::new(Payload::ShutdownRequested));
        token.cancel();
        self.wait_all_with_grace(&mut set, &mut remaining).await
    }

    /// Waits for all actors to finish within the configured grace window.
    async fn wait_all_with_grace(
        &self,
        set: &mut JoinSet<String>,
        remaining: &mut BTreeSet<String>,
    ) -> Result<(), RuntimeError> {
        let grace = self.cfg.grace;
        match tokio::time::timeout(grace, drain(set, remaining)).await {
            Ok(()) => {
                self.bus.publish(Event::new(Payload::AllStoppedWithin));
                Ok(())
            }
            Err(_) => {
                self.bus.publish(Event::new(Payload::GraceExceeded));
                set.abort_all();
                Err(RuntimeError::GraceExceeded {
                    grace,
                    stuck: remaining.iter().cloned().collect(),
                })
            }
        }
    }
}

/// Joins actors as they finish, keeping the not-yet-stopped set current.
async fn drain(set: &mut JoinSet<String>, remaining: &mut BTreeSet<String>) {
    while let Some(res) = set.join_next().await {
        if let Ok(name) = res {
            remaining.remove(&name);
        }
    }
}

/// Answers [`Payload::AccountRequested`] with a registered account not in
/// the exclusion list, or `None` when no such account exists.
pub(crate) fn spawn_account_responder(
    bus: Bus,
    store: Arc<dyn Store>,
    token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut rx = bus.subscribe();
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                msg = rx.recv() => match msg {
                    Ok(ev) => {
                        if let Payload::AccountRequested { task_id, exclude } = ev.payload {
                            let account = match store.bindable_account(&exclude).await {
                                Ok(found) => found,
                                Err(e) => {
                                    tracing::error!(error = %e, "bindable account lookup failed");
                                    None
                                }
                            };
                            tracing::info!(
                                task_id = %task_id,
                                bound = account.as_ref().map(|a| a.account_id.as_str()).unwrap_or("<none>"),
                                "answering account request"
                            );
                            bus.publish(Event::new(Payload::AccountPrepared { task_id, account }));
                        }
                    }
                    Err(RecvError::Closed) => break,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "account responder lagged");
                        continue;
                    }
                },
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WorkerError;
    use crate::store::{Account, AccountStatus, MemoryStore};
    use crate::supervisor::WorkerFn;
    use std::time::Duration;

    #[tokio::test]
    async fn test_run_returns_when_all_workers_finish() {
        let store = Arc::new(MemoryStore::new());
        let sup = Supervisor::new(Config::default(), store);
        let worker = WorkerFn::arc("one-shot", |_ctx| async { Ok::<(), WorkerError>(()) });
        let res = sup
            .run(vec![WorkerSpec::with_defaults(worker, &sup.cfg)])
            .await;
        assert!(res.is_ok());
    }

    #[tokio::test]
    async fn test_account_responder_honors_exclusions() {
        let store = Arc::new(MemoryStore::new());
        let mut acc = Account::new("a@x", "password123");
        acc.status = AccountStatus::Registered;
        store.upsert_accounts(vec![acc]).await.unwrap();

        let bus = Bus::new(64);
        let token = CancellationToken::new();
        let _responder = spawn_account_responder(bus.clone(), store.clone(), token.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;

        let answer = bus
            .request(
                &token,
                Duration::from_secs(2),
                Event::new(Payload::AccountRequested {
                    task_id: "t1".into(),
                    exclude: vec![],
                }),
                |ev| matches!(&ev.payload, Payload::AccountPrepared { task_id, .. } if &**task_id == "t1"),
            )
            .await
            .unwrap();
        match answer.payload {
            Payload::AccountPrepared { account, .. } => {
                assert_eq!(account.unwrap().account_id, "a@x");
            }
            other => panic!("unexpected payload: {}", other.label()),
        }

        let answer = bus
            .request(
                &token,
                Duration::from_secs(2),
                Event::new(Payload::AccountRequested {
                    task_id: "t2".into(),
                    exclude: vec!["a@x".to_string()],
                }),
                |ev| matches!(&ev.payload, Payload::AccountPrepared { task_id, .. } if &**task_id == "t2"),
            )
            .await
            .unwrap();
        match answer.payload {
            Payload::AccountPrepared { account, .. } => assert!(account.is_none()),
            other => panic!("unexpected payload: {}", other.label()),
        }
        token.cancel();
    }
}
