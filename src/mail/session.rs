//! # Mailbox collaborator traits.
//!
//! The watcher owns exactly one live [`MailSession`] at a time and drives it
//! through the operations the protocol offers: incremental fetch by UID
//! range, lookback fetch by receive date, a cancellable change-wait bounded
//! by a heartbeat, a no-op keepalive, and a graceful logout.
//!
//! [`Mailbox`] is the connection factory; `mail::imap` provides the IMAP
//! implementation, and tests substitute scripted fakes.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::MailError;

/// Why a change-wait returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// The server signalled a mailbox change.
    Notified,
    /// The heartbeat interval elapsed with no change.
    Heartbeat,
}

/// A raw message as fetched from the mailbox, before extraction.
#[derive(Debug, Clone)]
pub struct FetchedMail {
    /// Mailbox-assigned UID.
    pub uid: u32,
    /// Envelope sender address.
    pub sender: String,
    /// Envelope recipient address.
    pub recipient: String,
    /// Message subject.
    pub subject: String,
    /// Declared receive time.
    pub received_at: DateTime<Utc>,
    /// Text body used for extraction.
    pub body: String,
}

/// Connection factory for the watcher's mailbox.
#[async_trait]
pub trait Mailbox: Send + Sync + 'static {
    /// Connects, authenticates, and selects the watched folder.
    async fn connect(&self) -> Result<Box<dyn MailSession>, MailError>;
}

/// One live, exclusively-owned mailbox session.
#[async_trait]
pub trait MailSession: Send {
    /// Fetches messages with UID strictly greater than `uid`, in ascending
    /// UID order.
    async fn fetch_above(&mut self, uid: u32) -> Result<Vec<FetchedMail>, MailError>;

    /// Fetches messages received within the trailing `window`, in ascending
    /// UID order. Used once on cold start to bound the initial sync.
    async fn fetch_lookback(&mut self, window: Duration) -> Result<Vec<FetchedMail>, MailError>;

    /// Blocks until the server signals a change or `heartbeat` elapses,
    /// whichever comes first.
    async fn wait_for_change(&mut self, heartbeat: Duration) -> Result<Wake, MailError>;

    /// Issues a protocol no-op so an idle connection is not dropped.
    async fn keepalive(&mut self) -> Result<(), MailError>;

    /// Attempts a graceful logout. The session is unusable afterwards.
    async fn logout(&mut self) -> Result<(), MailError>;
}
