//! # Runtime events exchanged over the bus.
//!
//! [`Event`] wraps a [`Payload`] with a globally monotonic sequence number
//! and a wall-clock timestamp. The payload is a tagged union with one variant
//! per message kind; consumers match exhaustively and log anything they do
//! not handle via [`Payload::label`] instead of dropping it silently.
//!
//! ## Ordering guarantees
//! Each event has a globally unique sequence number (`seq`) that increases
//! monotonically. Use `seq` to restore publish order when events are
//! observed out of order.

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::mail::MailRecord;
use crate::scheduler::PhoneTaskStatus;
use crate::store::{Account, AccountStatus};

/// Global sequence counter for event ordering.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Message payload, one variant per message kind.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum Payload {
    // === Shutdown events ===
    /// Shutdown requested (termination signal observed).
    ShutdownRequested,
    /// All workers stopped within the configured grace period.
    AllStoppedWithin,
    /// Grace period elapsed with workers still running.
    GraceExceeded,

    // === Worker lifecycle ===
    /// A worker is starting an attempt (1-based `attempt` per actor).
    WorkerStarting { worker: Arc<str>, attempt: u64 },
    /// A worker stopped cleanly and will not be respawned.
    WorkerStopped { worker: Arc<str> },
    /// A worker exited with an error; `fatal` means no respawn follows.
    WorkerFailed {
        worker: Arc<str>,
        reason: Arc<str>,
        fatal: bool,
    },
    /// A respawn was scheduled after an unclean exit.
    RespawnScheduled { worker: Arc<str>, delay: Duration },

    // === Mailbox watcher ===
    /// A new mail message was parsed into a structured record.
    MailFound { record: MailRecord },

    // === Registration ===
    /// Replay notice: the store holds accounts awaiting registration.
    PendingAccounts { count: usize },
    /// A registration attempt reached a terminal or retryable outcome.
    AccountOutcome {
        account_id: Arc<str>,
        status: AccountStatus,
        reason: Option<Arc<str>>,
    },

    // === Phone change ===
    /// External request: a phone-change task was created.
    TaskCreated { task_id: Arc<str>, phone: Arc<str> },
    /// A phone-change task advanced (or terminated) with optional detail.
    TaskStatus {
        task_id: Arc<str>,
        status: PhoneTaskStatus,
        detail: Option<Arc<str>>,
    },
    /// External submission: the captcha for a task arrived.
    CaptchaSubmitted { task_id: Arc<str>, captcha: Arc<str> },
    /// A job asks for an account to bind, excluding already-bound ones.
    AccountRequested {
        task_id: Arc<str>,
        exclude: Vec<String>,
    },
    /// Answer to [`Payload::AccountRequested`]; `None` means none available.
    AccountPrepared {
        task_id: Arc<str>,
        account: Option<Account>,
    },
}

impl Payload {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Payload::ShutdownRequested => "shutdown_requested",
            Payload::AllStoppedWithin => "all_stopped_within",
            Payload::GraceExceeded => "grace_exceeded",
            Payload::WorkerStarting { .. } => "worker_starting",
            Payload::WorkerStopped { .. } => "worker_stopped",
            Payload::WorkerFailed { .. } => "worker_failed",
            Payload::RespawnScheduled { .. } => "respawn_scheduled",
            Payload::MailFound { .. } => "mail_found",
            Payload::PendingAccounts { .. } => "pending_accounts",
            Payload::AccountOutcome { .. } => "account_outcome",
            Payload::TaskCreated { .. } => "task_created",
            Payload::TaskStatus { .. } => "task_status",
            Payload::CaptchaSubmitted { .. } => "captcha_submitted",
            Payload::AccountRequested { .. } => "account_requested",
            Payload::AccountPrepared { .. } => "account_prepared",
        }
    }
}

/// Runtime event: a payload plus ordering metadata.
#[derive(Debug, Clone)]
pub struct Event {
    /// Globally unique, monotonically increasing sequence number.
    pub seq: u64,
    /// Wall-clock timestamp.
    pub at: SystemTime,
    /// The typed message.
    pub payload: Payload,
}

impl Event {
    /// Creates a new event with the current timestamp and next sequence.
    pub fn new(payload: Payload) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            at: SystemTime::now(),
            payload,
        }
    }

    /// Shorthand for the payload's label.
    #[inline]
    pub fn label(&self) -> &'static str {
        self.payload.label()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seq_is_monotonic() {
        let a = Event::new(Payload::ShutdownRequested);
        let b = Event::new(Payload::ShutdownRequested);
        assert!(b.seq > a.seq);
    }
}
