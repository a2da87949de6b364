//! Mailbox watching: session traits, the supervised watcher worker, content
//! extraction, and the IMAP adapter.

mod imap;
mod record;
mod session;
mod watcher;

pub use imap::{ImapConfig, ImapMailbox};
pub use record::{extract, Extracted, MailRecord};
pub use session::{FetchedMail, MailSession, Mailbox, Wake};
pub use watcher::{MailWatcher, WatcherState};
