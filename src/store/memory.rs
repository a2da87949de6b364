//! In-memory [`Store`] implementation.
//!
//! Keeps the same unique keys the external schema enforces (mail UID,
//! account id, task id) behind a single `RwLock`. Intended for tests and
//! embedders that bring their own durability.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::mail::{Extracted, MailRecord};
use crate::scheduler::PhoneTaskStatus;

use super::{Account, AccountStatus, Store};

#[derive(Default)]
struct Inner {
    /// Mail records keyed by UID; the key set doubles as the dedup index.
    mail: BTreeMap<u32, MailRecord>,
    /// Accounts keyed by account id, with import order preserved separately.
    accounts: BTreeMap<String, Account>,
    import_order: Vec<String>,
    /// Phone-change task rows keyed by task id.
    tasks: BTreeMap<String, TaskRow>,
}

struct TaskRow {
    #[allow(dead_code)]
    phone: String,
    status: PhoneTaskStatus,
    detail: Option<String>,
}

/// Lock-protected in-memory store.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Test/observability helper: current status of a task row.
    pub async fn task_status(&self, task_id: &str) -> Option<(PhoneTaskStatus, Option<String>)> {
        let inner = self.inner.read().await;
        inner
            .tasks
            .get(task_id)
            .map(|row| (row.status, row.detail.clone()))
    }

    /// Test/observability helper: current state of an account row.
    pub async fn account(&self, account_id: &str) -> Option<Account> {
        self.inner.read().await.accounts.get(account_id).cloned()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn record_mail(&self, record: &MailRecord) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        if inner.mail.contains_key(&record.uid) {
            return Ok(false);
        }
        inner.mail.insert(record.uid, record.clone());
        Ok(true)
    }

    async fn last_uid(&self) -> Result<u32, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.mail.keys().next_back().copied().unwrap_or(0))
    }

    async fn latest_link(&self, recipient: &str) -> Result<Option<MailRecord>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .mail
            .values()
            .rev()
            .find(|rec| {
                rec.recipient == recipient
                    && matches!(rec.extracted, Extracted::RegistrationLink(_))
            })
            .cloned())
    }

    async fn pending_accounts(&self) -> Result<Vec<Account>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .import_order
            .iter()
            .filter_map(|id| inner.accounts.get(id))
            .filter(|acc| acc.status == AccountStatus::New)
            .cloned()
            .collect())
    }

    async fn set_account_outcome(
        &self,
        account_id: &str,
        status: AccountStatus,
        reason: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if let Some(acc) = inner.accounts.get_mut(account_id) {
            acc.status = status;
            acc.reason = reason.map(str::to_string);
        }
        Ok(())
    }

    async fn reset_failed(&self, account_id: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        match inner.accounts.get_mut(account_id) {
            Some(acc) if acc.status == AccountStatus::RegistrationFailed => {
                acc.status = AccountStatus::New;
                acc.reason = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn bindable_account(&self, exclude: &[String]) -> Result<Option<Account>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .import_order
            .iter()
            .filter_map(|id| inner.accounts.get(id))
            .find(|acc| {
                acc.status == AccountStatus::Registered
                    && !exclude.iter().any(|ex| ex == &acc.account_id)
            })
            .cloned())
    }

    async fn upsert_accounts(&self, accounts: Vec<Account>) -> Result<usize, StoreError> {
        let mut inner = self.inner.write().await;
        let mut inserted = 0;
        for acc in accounts {
            if inner.accounts.contains_key(&acc.account_id) {
                continue;
            }
            inner.import_order.push(acc.account_id.clone());
            inner.accounts.insert(acc.account_id.clone(), acc);
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn create_task(&self, task_id: &str, phone: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        if inner.tasks.contains_key(task_id) {
            return Ok(false);
        }
        inner.tasks.insert(
            task_id.to_string(),
            TaskRow {
                phone: phone.to_string(),
                status: PhoneTaskStatus::Pending,
                detail: None,
            },
        );
        Ok(true)
    }

    async fn set_task_outcome(
        &self,
        task_id: &str,
        status: PhoneTaskStatus,
        detail: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if let Some(row) = inner.tasks.get_mut(task_id) {
            row.status = status;
            row.detail = detail.map(str::to_string);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(uid: u32, recipient: &str, link: &str) -> MailRecord {
        MailRecord {
            uid,
            sender: "noreply@example.jp".into(),
            recipient: recipient.into(),
            subject: "registration".into(),
            received_at: Utc::now(),
            extracted: Extracted::RegistrationLink(link.into()),
        }
    }

    #[tokio::test]
    async fn test_record_mail_dedups_by_uid() {
        let store = MemoryStore::new();
        assert!(store.record_mail(&record(5, "a@x", "https://a")).await.unwrap());
        assert!(!store.record_mail(&record(5, "a@x", "https://b")).await.unwrap());
        assert_eq!(store.last_uid().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_latest_link_prefers_newest_uid() {
        let store = MemoryStore::new();
        store.record_mail(&record(3, "a@x", "https://old")).await.unwrap();
        store.record_mail(&record(9, "a@x", "https://new")).await.unwrap();
        store.record_mail(&record(7, "b@x", "https://other")).await.unwrap();

        let rec = store.latest_link("a@x").await.unwrap().unwrap();
        assert_eq!(rec.uid, 9);
    }

    #[tokio::test]
    async fn test_bindable_account_honors_exclusions() {
        let store = MemoryStore::new();
        let mut a = Account::new("a@x", "password123");
        a.status = AccountStatus::Registered;
        let mut b = Account::new("b@x", "password123");
        b.status = AccountStatus::Registered;
        store.upsert_accounts(vec![a, b]).await.unwrap();

        let got = store.bindable_account(&[]).await.unwrap().unwrap();
        assert_eq!(got.account_id, "a@x");

        let got = store
            .bindable_account(&["a@x".to_string()])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.account_id, "b@x");

        let got = store
            .bindable_account(&["a@x".to_string(), "b@x".to_string()])
            .await
            .unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_reset_failed_requires_failed_state() {
        let store = MemoryStore::new();
        store
            .upsert_accounts(vec![Account::new("a@x", "password123")])
            .await
            .unwrap();
        assert!(!store.reset_failed("a@x").await.unwrap());

        store
            .set_account_outcome("a@x", AccountStatus::RegistrationFailed, Some("expired"))
            .await
            .unwrap();
        assert!(store.reset_failed("a@x").await.unwrap());
        assert_eq!(store.account("a@x").await.unwrap().status, AccountStatus::New);
    }
}
