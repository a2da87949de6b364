//! Persistent-store collaborator.
//!
//! The coordination core treats persistence as an external collaborator
//! supporting upsert-by-unique-key and status-filtered queries; schema and
//! ORM mechanics live behind [`Store`]. [`MemoryStore`] is the in-memory
//! implementation used by tests and lightweight embedders.

mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::mail::MailRecord;
use crate::scheduler::PhoneTaskStatus;

pub use memory::MemoryStore;

/// Registration lifecycle of an account.
///
/// `New → Registered` on success, `New → RegistrationFailed` on a retryable
/// error, `New → Invalid` on a terminal error. `RegistrationFailed → New`
/// happens only through the explicit [`Store::reset_failed`] operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    /// Imported, not yet registered.
    New,
    /// Registration completed.
    Registered,
    /// Registration failed retryably (e.g. expired link, timeout).
    RegistrationFailed,
    /// Registration failed terminally (e.g. validation rejection).
    Invalid,
}

impl AccountStatus {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            AccountStatus::New => "new",
            AccountStatus::Registered => "registered",
            AccountStatus::RegistrationFailed => "registration_failed",
            AccountStatus::Invalid => "invalid",
        }
    }
}

/// An account under management, with the profile fields the registration
/// form requires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    /// Unique business key: the account's email address.
    pub account_id: String,
    /// Login password; the registration form requires at least 8 characters.
    pub password: String,
    /// Contact phone number.
    pub phone: Option<String>,
    /// Birthday, filled into the year/month/day selects.
    pub birthday: Option<chrono::NaiveDate>,
    /// Name in Japanese script.
    pub jp_name: Option<String>,
    /// Reading of the name in fullwidth kana.
    pub fullwidth_name: Option<String>,
    /// Romanized name, used as the display nickname.
    pub roman_name: Option<String>,
    /// Postal code.
    pub zip_code: Option<String>,
    /// Street address; a bracketed suffix is the building/room part.
    pub address: Option<String>,
    /// Browser fingerprint profile identifier for this account.
    pub fingerprint_id: Option<String>,
    /// Current lifecycle status.
    pub status: AccountStatus,
    /// Free-text reason recorded on failure.
    pub reason: Option<String>,
}

impl Account {
    /// Creates a new, unregistered account with empty profile fields.
    pub fn new(account_id: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            password: password.into(),
            phone: None,
            birthday: None,
            jp_name: None,
            fullwidth_name: None,
            roman_name: None,
            zip_code: None,
            address: None,
            fingerprint_id: None,
            status: AccountStatus::New,
            reason: None,
        }
    }
}

/// External persistence seam.
///
/// ## Contract
/// - `record_mail` inserts at most once per UID and reports duplicates as
///   `Ok(false)` rather than errors.
/// - `last_uid` returns the highest recorded UID (0 when empty); it is the
///   watcher's restart watermark.
/// - Account and task updates are upserts by unique key.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Records a parsed mail message. Returns `Ok(false)` when the UID was
    /// already recorded (duplicate delivery suppressed).
    async fn record_mail(&self, record: &MailRecord) -> Result<bool, StoreError>;

    /// Highest recorded mail UID, or 0 when nothing was recorded yet.
    async fn last_uid(&self) -> Result<u32, StoreError>;

    /// Newest recorded registration-link message addressed to `recipient`.
    async fn latest_link(&self, recipient: &str) -> Result<Option<MailRecord>, StoreError>;

    /// Accounts awaiting registration, in import order.
    async fn pending_accounts(&self) -> Result<Vec<Account>, StoreError>;

    /// Records the outcome of a registration attempt.
    async fn set_account_outcome(
        &self,
        account_id: &str,
        status: AccountStatus,
        reason: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Explicit external reset: returns a `RegistrationFailed` account to
    /// `New`. Returns `Ok(false)` when the account is absent or not in the
    /// failed state.
    async fn reset_failed(&self, account_id: &str) -> Result<bool, StoreError>;

    /// A registered account usable for a phone-change job, excluding the
    /// given account ids (already bound to in-flight jobs).
    async fn bindable_account(&self, exclude: &[String]) -> Result<Option<Account>, StoreError>;

    /// Imports accounts, ignoring ones whose `account_id` already exists.
    /// Returns the number actually inserted.
    async fn upsert_accounts(&self, accounts: Vec<Account>) -> Result<usize, StoreError>;

    /// Records a new phone-change task request. Returns `Ok(false)` when the
    /// task id already exists.
    async fn create_task(&self, task_id: &str, phone: &str) -> Result<bool, StoreError>;

    /// Updates a phone-change task's status and detail.
    async fn set_task_outcome(
        &self,
        task_id: &str,
        status: PhoneTaskStatus,
        detail: Option<&str>,
    ) -> Result<(), StoreError>;
}
