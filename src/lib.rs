//! # provisor
//!
//! **Provisor** is the worker-supervision and workflow-coordination layer for
//! an account-provisioning automation: a mailbox watcher extracts
//! verification artifacts (codes, time-limited links) from incoming mail,
//! and browser-driven workflow engines consume them to complete multi-step
//! web forms (registration, MFA login, phone-number change).
//!
//! ## Architecture
//! ```text
//!     ┌──────────────┐   ┌───────────────────┐   ┌────────────────┐
//!     │ MailWatcher  │   │  RegisterEngine   │   │ PhoneScheduler │
//!     │ (IMAP idle)  │   │ (pending drain)   │   │ (admission)    │
//!     └──────┬───────┘   └─────────┬─────────┘   └───────┬────────┘
//!            ▼                     ▼                     ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │  Supervisor                                                       │
//! │  - Bus (broadcast events, monotonic seq)                          │
//! │  - WorkerActor per worker (fixed-delay respawn on unclean exit)   │
//! │  - account-binding responder                                      │
//! │  - signal-driven shutdown with grace window                       │
//! └──────────────────────────────┬────────────────────────────────────┘
//!                                ▼
//!                     Store (external collaborator:
//!                     mail dedup, accounts, task rows)
//! ```
//!
//! ### Data flow
//! ```text
//! MailWatcher ──► MailFound ──► Bus ──► correlation wait in a workflow
//!   (watermark,                         (registration link / MFA code /
//!    store dedup)                        captcha, each with its bound)
//!                                             │
//!                                             ▼
//!                              workflow outcome ──► store + outcome event
//!                                             │
//!                                             ▼
//!                              scheduler admits the next eligible task
//! ```
//!
//! ## Guarantees
//! - **Dedup**: no mail UID is delivered twice across any number of watcher
//!   restarts (store-backed, watermark never decreases).
//! - **Generations**: a superseded watcher instance neither reconnects nor
//!   mutates current state.
//! - **Correlation waits**: bounded, abortable, and leak-free — a timed-out
//!   wait leaves no residual listener.
//! - **Failure classification**: every workflow failure is retryable
//!   (expired link, timeout, infra) or terminal (explicit page rejection,
//!   region mismatch, missed MFA/captcha deadline).
//! - **Shutdown**: one cancellation token reaches every suspension point;
//!   pending respawns are cancelled; the grace window bounds the wait.
//!
//! ## Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use provisor::{
//!     Config, ImapConfig, ImapMailbox, MailWatcher, MemoryStore, Supervisor,
//!     WorkerSpec,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cfg = Config::default();
//!     let store = Arc::new(MemoryStore::new());
//!     let sup = Supervisor::new(cfg.clone(), store);
//!
//!     let mailbox = ImapMailbox::new(ImapConfig::new(
//!         "imap.example.com",
//!         "watcher@example.com",
//!         "app-password",
//!     ));
//!     let watcher = Arc::new(MailWatcher::new(mailbox, &cfg));
//!
//!     sup.run(vec![WorkerSpec::with_defaults(watcher, &cfg)]).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod flows;
pub mod mail;
pub mod scheduler;
pub mod store;
pub mod supervisor;

pub use config::Config;
pub use error::{
    CorrelateError, FlowError, MailError, PageError, RuntimeError, StoreError, WorkerError,
};
pub use events::{Bus, Event, Payload};
pub use flows::{DriverFactory, PageDriver, RegisterEngine};
pub use mail::{
    Extracted, FetchedMail, ImapConfig, ImapMailbox, MailRecord, MailSession, MailWatcher, Mailbox,
    WatcherState,
};
pub use scheduler::{PhoneChangeTask, PhoneScheduler, PhoneTaskStatus};
pub use store::{Account, AccountStatus, MemoryStore, Store};
pub use supervisor::{Supervisor, Worker, WorkerContext, WorkerFn, WorkerRef, WorkerSpec};
