//! # Mailbox watcher: incremental fetch with crash-safe restart.
//!
//! One supervised worker that owns the mailbox session exclusively and turns
//! incoming messages into [`Payload::MailFound`] events.
//!
//! ## State machine
//! ```text
//! Disconnected ──► Connecting ──► Synced ──► Waiting ──► Synced ──► …
//!       ▲              │                        │
//!       │   connect error: fixed delay,         │ stop request / session lost
//!       │   retry forever unless stopped        ▼
//!       └───────────────────────────────── Stopped / reconnect
//! ```
//!
//! ## Rules
//! - **Incremental range**: with a known watermark, fetch `(uid, ∞)`; on cold
//!   start fetch only the trailing lookback window.
//! - **Watermark**: advances to the maximum UID seen, never decreases, and is
//!   re-derived from the store on every (re)start.
//! - **Dedup**: the store inserts at most once per UID; duplicates are logged
//!   and not republished.
//! - **Parse misses**: logged and skipped; they neither block later messages
//!   nor move the watermark backwards.
//! - **Generation**: every (re)start advances the generation counter; a
//!   superseded generation neither reconnects nor applies batches.
//! - **Session ownership**: the previous session is retired (logout, drop)
//!   before any reconnect establishes a new one.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::Config;
use crate::error::{MailError, WorkerError};
use crate::events::{Event, Payload};
use crate::store::Store;
use crate::supervisor::{Worker, WorkerContext};

use super::record::MailRecord;
use super::session::{FetchedMail, Mailbox, Wake};

/// Observable lifecycle state of the watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    /// No session; not currently trying to connect.
    Disconnected,
    /// Establishing and authenticating a session.
    Connecting,
    /// A fetch pass completed; the watermark is current.
    Synced,
    /// Blocked on the change-wait.
    Waiting,
    /// Stop observed; no further reconnects will be scheduled.
    Stopped,
}

/// How one session ended.
enum CycleEnd {
    /// Stop was requested; exit without reconnecting.
    Stopped,
    /// The session broke; reconnect after the fixed delay.
    Lost(MailError),
}

/// Supervised mailbox watcher worker.
pub struct MailWatcher<M: Mailbox> {
    mailbox: M,
    reconnect_delay: Duration,
    lookback: Duration,
    heartbeat: Duration,
    generation: AtomicU64,
    watermark: AtomicU32,
    state: Mutex<WatcherState>,
}

impl<M: Mailbox> MailWatcher<M> {
    /// Creates a watcher over the given mailbox, copying its timing
    /// parameters from `cfg`.
    pub fn new(mailbox: M, cfg: &Config) -> Self {
        Self {
            mailbox,
            reconnect_delay: cfg.reconnect_delay,
            lookback: cfg.lookback,
            heartbeat: cfg.heartbeat,
            generation: AtomicU64::new(0),
            watermark: AtomicU32::new(0),
            state: Mutex::new(WatcherState::Disconnected),
        }
    }

    /// Highest UID seen so far.
    pub fn watermark(&self) -> u32 {
        self.watermark.load(Ordering::SeqCst)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WatcherState {
        *self.state.lock().expect("watcher state lock")
    }

    /// Starts a new generation and returns its tag. Earlier generations
    /// become inert.
    fn begin_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn is_current(&self, gen: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == gen
    }

    /// Whether a reconnect scheduled by generation `gen` may proceed.
    fn should_reconnect(&self, gen: u64, ctx: &WorkerContext) -> bool {
        !ctx.token.is_cancelled() && self.is_current(gen)
    }

    fn set_state(&self, next: WatcherState) {
        *self.state.lock().expect("watcher state lock") = next;
    }

    /// Cancellable fixed-delay sleep; true when the loop may continue.
    async fn pause(&self, gen: u64, ctx: &WorkerContext) -> bool {
        tokio::select! {
            _ = ctx.token.cancelled() => return false,
            _ = tokio::time::sleep(self.reconnect_delay) => {}
        }
        self.should_reconnect(gen, ctx)
    }

    async fn session_cycle(
        &self,
        gen: u64,
        ctx: &WorkerContext,
        session: &mut dyn super::session::MailSession,
    ) -> CycleEnd {
        if let Err(e) = self.sync(gen, ctx, session).await {
            return CycleEnd::Lost(e);
        }
        loop {
            if ctx.token.is_cancelled() {
                return CycleEnd::Stopped;
            }
            self.set_state(WatcherState::Waiting);
            tracing::debug!("waiting for new mail");

            let wake = tokio::select! {
                _ = ctx.token.cancelled() => return CycleEnd::Stopped,
                res = session.wait_for_change(self.heartbeat) => match res {
                    Ok(wake) => wake,
                    Err(e) => return CycleEnd::Lost(e),
                },
            };
            if wake == Wake::Heartbeat {
                if let Err(e) = session.keepalive().await {
                    return CycleEnd::Lost(e);
                }
            }
            if let Err(e) = self.sync(gen, ctx, session).await {
                return CycleEnd::Lost(e);
            }
        }
    }

    /// One incremental fetch pass using the watermark range rule.
    async fn sync(
        &self,
        gen: u64,
        ctx: &WorkerContext,
        session: &mut dyn super::session::MailSession,
    ) -> Result<(), MailError> {
        let mark = self.watermark();
        let batch = if mark > 0 {
            session.fetch_above(mark).await?
        } else {
            tracing::info!(lookback = ?self.lookback, "cold start, fetching recent messages");
            session.fetch_lookback(self.lookback).await?
        };
        self.set_state(WatcherState::Synced);
        if !batch.is_empty() {
            self.apply_batch(gen, ctx, batch).await;
        }
        Ok(())
    }

    /// Advances the watermark and republishes parsed messages, in ascending
    /// UID order. A superseded generation applies nothing.
    async fn apply_batch(&self, gen: u64, ctx: &WorkerContext, mut batch: Vec<FetchedMail>) -> bool {
        if !self.is_current(gen) {
            tracing::debug!(gen, "superseded generation, dropping batch");
            return false;
        }
        batch.sort_by_key(|m| m.uid);
        for mail in batch {
            let uid = mail.uid;
            self.watermark.fetch_max(uid, Ordering::SeqCst);

            let Some(record) = MailRecord::from_fetched(&mail) else {
                tracing::debug!(uid, subject = %mail.subject, "no extractable content, skipping");
                continue;
            };
            tracing::info!(uid, from = %record.sender, subject = %record.subject, "mail hit");

            match ctx.store.record_mail(&record).await {
                Ok(true) => ctx.bus.publish(Event::new(Payload::MailFound { record })),
                Ok(false) => tracing::warn!(uid, "duplicate uid, ignoring"),
                Err(e) => tracing::error!(uid, error = %e, "store write failed, skipping message"),
            }
        }
        true
    }
}

#[async_trait]
impl<M: Mailbox> Worker for MailWatcher<M> {
    fn name(&self) -> &str {
        "mail-watcher"
    }

    async fn run(&self, ctx: WorkerContext) -> Result<(), WorkerError> {
        let gen = self.begin_generation();
        let initial = ctx.store.last_uid().await.map_err(WorkerError::failed)?;
        self.watermark.fetch_max(initial, Ordering::SeqCst);
        self.set_state(WatcherState::Disconnected);
        tracing::info!(gen, watermark = initial, "mailbox watcher starting");

        loop {
            if ctx.token.is_cancelled() {
                self.set_state(WatcherState::Stopped);
                return Ok(());
            }
            if !self.is_current(gen) {
                return Ok(());
            }

            self.set_state(WatcherState::Connecting);
            let mut session = match self.mailbox.connect().await {
                Ok(session) => session,
                Err(e) => {
                    tracing::warn!(error = %e, delay = ?self.reconnect_delay, "connect failed, retrying");
                    if !self.pause(gen, &ctx).await {
                        if self.is_current(gen) {
                            self.set_state(WatcherState::Stopped);
                        }
                        return Ok(());
                    }
                    continue;
                }
            };

            let end = self.session_cycle(gen, &ctx, session.as_mut()).await;

            // Retire this session fully before any reconnect.
            if let Err(e) = session.logout().await {
                tracing::debug!(error = %e, "logout failed");
            }
            drop(session);

            match end {
                CycleEnd::Stopped => {
                    self.set_state(WatcherState::Stopped);
                    return Ok(());
                }
                CycleEnd::Lost(e) => {
                    tracing::warn!(error = %e, delay = ?self.reconnect_delay, "session lost, reconnecting");
                    if self.is_current(gen) {
                        self.set_state(WatcherState::Disconnected);
                    }
                    if !self.pause(gen, &ctx).await {
                        if ctx.token.is_cancelled() && self.is_current(gen) {
                            self.set_state(WatcherState::Stopped);
                        }
                        return Ok(());
                    }
                }
            }
        }
    }
}
