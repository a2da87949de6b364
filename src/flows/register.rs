//! # Registration workflow and engine.
//!
//! The registration flow drives one account through sign-up:
//!
//! ```text
//! verify egress region
//!   └─► open login page, submit the account address
//!   └─► confirmation page (must echo the address back)
//!   └─► trigger the confirmation email
//!   └─► registration link: newest still-valid stored one, else await a
//!       fresh MailFound via the correlation layer (up to link_wait)
//!   └─► open the link (expired-link URL pattern → retryable rejection)
//!   └─► fill the profile form, accept terms, submit
//!   └─► poll for the completion pattern
//! ```
//!
//! [`RegisterEngine`] is the supervised worker around the flow: it drains
//! store-pending accounts **sequentially** (at most one in-flight attempt
//! per account, ever), records each outcome, and wakes on
//! [`Payload::PendingAccounts`] replays or a periodic re-check.

use std::sync::Arc;
use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::{Datelike, Utc};
use regex::Regex;
use tokio::sync::broadcast::error::RecvError;

use crate::config::Config;
use crate::error::{CorrelateError, FlowError, WorkerError};
use crate::events::{Event, Payload};
use crate::mail::Extracted;
use crate::store::{Account, AccountStatus, Store};
use crate::supervisor::{Worker, WorkerContext};

use super::page::{poll_for, verify_region, DriverFactory, PageDriver, StepTiming};

/// Landing page carrying the sign-up form.
pub(crate) const LOGIN_URL: &str = "https://www.pokemoncenter-online.com/login/";

static CONFIRM_PAGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("temporary-customer-confirm").expect("confirm pattern"));
static EXPIRED_LINK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"https://www\.pokemoncenter-online\.com/error.*message=error\.message\.account\.invalid")
        .expect("expired-link pattern")
});
static REGISTERED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"https://www\.pokemoncenter-online\.com/new-customer-confirm/\?rurl=1")
        .expect("registered pattern")
});

/// Semantic control identifiers; the driver resolves them to markup.
pub mod controls {
    pub const REGIST_EMAIL: &str = "regist-email";
    pub const REGIST_SUBMIT: &str = "regist-submit";
    pub const SEND_CONFIRMATION: &str = "send-confirmation-email";
    pub const NICKNAME: &str = "profile-nickname";
    pub const NAME: &str = "profile-name";
    pub const KANA: &str = "profile-kana";
    pub const BIRTHDAY_YEAR: &str = "profile-birthday-year";
    pub const BIRTHDAY_MONTH: &str = "profile-birthday-month";
    pub const BIRTHDAY_DAY: &str = "profile-birthday-day";
    pub const POSTCODE: &str = "profile-postcode";
    pub const ADDRESS_LINE1: &str = "profile-address-line1";
    pub const ADDRESS_LINE2: &str = "profile-address-line2";
    pub const PHONE: &str = "profile-phone";
    pub const PASSWORD: &str = "profile-password";
    pub const PASSWORD_CONFIRM: &str = "profile-password-confirm";
    pub const TERMS: &str = "terms";
    pub const PRIVACY: &str = "privacy-policy";
    pub const REGISTRATION_SUBMIT: &str = "registration-submit";
}

/// Default contact phone filled when the profile has none.
const FALLBACK_PHONE: &str = "0900000000";

/// Runs the registration flow for one account to a success/failure outcome.
pub async fn run_registration(
    driver: &mut dyn PageDriver,
    ctx: &WorkerContext,
    cfg: &Config,
    account: &Account,
) -> Result<(), FlowError> {
    let timing = StepTiming {
        interval: cfg.poll_interval,
        timeout: cfg.step_timeout,
    };

    verify_region(driver, &cfg.required_region).await?;

    driver.goto(LOGIN_URL).await?;
    driver
        .fill(controls::REGIST_EMAIL, &account.account_id)
        .await?;
    driver.click(controls::REGIST_SUBMIT).await?;
    poll_for(driver, &ctx.token, &CONFIRM_PAGE_RE, "signup confirmation page", timing).await?;

    // The confirmation page must echo the submitted address back.
    let text = driver.page_text().await?;
    if !text.contains(&account.account_id) {
        return Err(FlowError::PageRejected {
            text: "confirmation page does not echo the submitted address".to_string(),
        });
    }
    driver.click(controls::SEND_CONFIRMATION).await?;
    tracing::info!(account = %account.account_id, "confirmation email triggered");

    let link = obtain_link(ctx, cfg, account).await?;
    driver.goto(&link).await?;
    let landed = driver.current_url().await?;
    if EXPIRED_LINK_RE.is_match(&landed) {
        return Err(FlowError::ExpiredLink);
    }

    fill_profile(driver, account).await?;
    poll_for(driver, &ctx.token, &REGISTERED_RE, "registration result", timing).await?;
    tracing::info!(account = %account.account_id, "registration completed");
    Ok(())
}

/// The newest still-valid stored link, or a fresh one awaited via the
/// correlation layer.
async fn obtain_link(
    ctx: &WorkerContext,
    cfg: &Config,
    account: &Account,
) -> Result<String, FlowError> {
    let now = Utc::now();
    match ctx.store.latest_link(&account.account_id).await {
        Ok(Some(record)) => {
            if let Some(url) = record.valid_link(now, cfg.link_validity) {
                tracing::info!(account = %account.account_id, uid = record.uid, "reusing stored registration link");
                return Ok(url.to_string());
            }
        }
        Ok(None) => {}
        Err(e) => tracing::warn!(error = %e, "stored link lookup failed"),
    }

    tracing::info!(account = %account.account_id, wait = ?cfg.link_wait, "awaiting registration link");
    let ev = ctx
        .bus
        .await_once(&ctx.token, cfg.link_wait, |ev| match &ev.payload {
            Payload::MailFound { record } => {
                record.recipient == account.account_id
                    && matches!(record.extracted, Extracted::RegistrationLink(_))
            }
            _ => false,
        })
        .await
        .map_err(|e| match e {
            CorrelateError::TimedOut { timeout } => FlowError::LinkTimeout { timeout },
            CorrelateError::Aborted | CorrelateError::Closed => FlowError::Canceled,
        })?;

    let link = match ev.payload {
        Payload::MailFound { record } => record.into_link(),
        _ => None,
    };
    // The predicate only matches link records.
    link.ok_or(FlowError::LinkTimeout {
        timeout: cfg.link_wait,
    })
}

/// Fills the profile form. Password policy is checked before touching the
/// page: a short password is malformed data, not a page rejection.
async fn fill_profile(driver: &mut dyn PageDriver, account: &Account) -> Result<(), FlowError> {
    if account.password.len() < 8 {
        return Err(FlowError::MalformedProfile {
            detail: "password shorter than 8 characters".to_string(),
        });
    }

    let nickname = account.roman_name.clone().unwrap_or_default();
    driver.fill(controls::NICKNAME, &nickname).await?;
    let name = account.jp_name.clone().unwrap_or_default();
    driver.fill(controls::NAME, &name).await?;
    let kana = account.fullwidth_name.clone().unwrap_or_default();
    driver.fill(controls::KANA, &kana).await?;

    if let Some(birthday) = account.birthday {
        driver
            .fill(controls::BIRTHDAY_YEAR, &birthday.year().to_string())
            .await?;
        driver
            .fill(controls::BIRTHDAY_MONTH, &format!("{:02}", birthday.month()))
            .await?;
        driver
            .fill(controls::BIRTHDAY_DAY, &format!("{:02}", birthday.day()))
            .await?;
    }

    let zip = account.zip_code.clone().unwrap_or_default();
    driver.fill(controls::POSTCODE, &zip).await?;

    let (line1, line2) = split_address(account.address.as_deref().unwrap_or_default());
    driver.fill(controls::ADDRESS_LINE1, &line1).await?;
    driver.fill(controls::ADDRESS_LINE2, &line2).await?;

    let phone = account.phone.as_deref().unwrap_or(FALLBACK_PHONE);
    driver.fill(controls::PHONE, phone).await?;
    driver.fill(controls::PASSWORD, &account.password).await?;
    driver
        .fill(controls::PASSWORD_CONFIRM, &account.password)
        .await?;

    driver.click(controls::TERMS).await?;
    driver.click(controls::PRIVACY).await?;
    driver.click(controls::REGISTRATION_SUBMIT).await?;
    Ok(())
}

/// Splits "street（building）" into its street and building parts; either
/// bracket style is accepted.
fn split_address(address: &str) -> (String, String) {
    static BRACKETS_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^(.*?)[（(]([^）)]*)[）)]").expect("address pattern"));
    match BRACKETS_RE.captures(address) {
        Some(caps) => (caps[1].trim().to_string(), caps[2].trim().to_string()),
        None => (address.trim().to_string(), String::new()),
    }
}

/// Supervised worker that registers pending accounts one at a time.
pub struct RegisterEngine {
    factory: Arc<dyn DriverFactory>,
    cfg: Config,
}

impl RegisterEngine {
    pub fn new(factory: Arc<dyn DriverFactory>, cfg: &Config) -> Self {
        Self {
            factory,
            cfg: cfg.clone(),
        }
    }

    /// One attempt for one account; flow errors become recorded outcomes and
    /// never escape.
    async fn attempt(&self, ctx: &WorkerContext, account: &Account) {
        tracing::info!(account = %account.account_id, "starting registration attempt");
        let outcome = match self.factory.open(account).await {
            Ok(mut driver) => run_registration(driver.as_mut(), ctx, &self.cfg, account).await,
            Err(e) => Err(FlowError::from(e)),
        };

        match outcome {
            Ok(()) => {
                self.record(ctx, account, AccountStatus::Registered, None).await;
            }
            Err(FlowError::Canceled) => {
                tracing::info!(account = %account.account_id, "attempt cancelled, no outcome recorded");
            }
            Err(e) if e.is_retryable() => {
                tracing::warn!(account = %account.account_id, label = e.as_label(), reason = %e, "retryable registration failure");
                self.record(ctx, account, AccountStatus::RegistrationFailed, Some(e.to_string()))
                    .await;
            }
            Err(e) => {
                tracing::error!(account = %account.account_id, label = e.as_label(), reason = %e, "terminal registration failure");
                self.record(ctx, account, AccountStatus::Invalid, Some(e.to_string()))
                    .await;
            }
        }
    }

    async fn record(
        &self,
        ctx: &WorkerContext,
        account: &Account,
        status: AccountStatus,
        reason: Option<String>,
    ) {
        if let Err(e) = ctx
            .store
            .set_account_outcome(&account.account_id, status, reason.as_deref())
            .await
        {
            tracing::error!(account = %account.account_id, error = %e, "failed to persist outcome");
        }
        ctx.bus.publish(Event::new(Payload::AccountOutcome {
            account_id: Arc::from(account.account_id.as_str()),
            status,
            reason: reason.map(Arc::from),
        }));
    }
}

#[async_trait]
impl Worker for RegisterEngine {
    fn name(&self) -> &str {
        "register-engine"
    }

    async fn run(&self, ctx: WorkerContext) -> Result<(), WorkerError> {
        let mut rx = ctx.bus.subscribe();
        loop {
            if ctx.token.is_cancelled() {
                return Ok(());
            }
            let pending = ctx
                .store
                .pending_accounts()
                .await
                .map_err(WorkerError::failed)?;
            if !pending.is_empty() {
                tracing::info!(count = pending.len(), "processing pending accounts");
            }
            for account in &pending {
                if ctx.token.is_cancelled() {
                    return Ok(());
                }
                self.attempt(&ctx, account).await;
            }

            // Sleep until a replay arrives or the re-check interval elapses.
            loop {
                tokio::select! {
                    _ = ctx.token.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(self.cfg.pending_recheck) => break,
                    msg = rx.recv() => match msg {
                        Ok(ev) => match ev.payload {
                            Payload::PendingAccounts { count } => {
                                tracing::debug!(count, "pending accounts replay");
                                break;
                            }
                            other => {
                                tracing::trace!(kind = other.label(), "event not for this worker");
                            }
                        },
                        Err(RecvError::Closed) => return Ok(()),
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "register engine lagged, re-checking store");
                            break;
                        }
                    },
                }
            }
        }
    }
}
