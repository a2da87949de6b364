//! # Phone-change workflow.
//!
//! Drives one bound account through a phone-number change:
//!
//! ```text
//! verify egress region ──► login (MFA) ──► profile edit page
//!   └─► submit the new number
//!   └─► confirmation page, or inline error with its exact text
//!   └─► captcha_sent → await externally submitted captcha (60 s bound)
//!   └─► submit captcha → completion page
//!   └─► return home via the in-page control, falling back to direct
//!       navigation when it cannot be found within the short bound
//! ```
//!
//! Status transitions (`captcha_sent`, `captcha_submitted`) are published on
//! the bus as the flow crosses them; the scheduler mirrors them into its
//! task map.

use std::sync::Arc;
use std::sync::LazyLock;

use regex::Regex;

use crate::config::Config;
use crate::error::{CorrelateError, FlowError};
use crate::events::{Event, Payload};
use crate::scheduler::PhoneTaskStatus;
use crate::store::Account;
use crate::supervisor::WorkerContext;

use super::login::{run_login, HOME_RE};
use super::page::{poll_for, verify_region, PageDriver, StepTiming};

/// Direct-navigation fallback target after a completed change.
pub(crate) const HOME_URL: &str = "https://www.pokemoncenter-online.com/mypage/";

static PROFILE_EDIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("account-input").expect("profile edit pattern"));
static CHANGE_CONFIRM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"https://www\.pokemoncenter-online\.com/account-confirm").expect("confirm pattern")
});
static CHANGE_COMPLETE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("regist-complete").expect("complete pattern"));

/// Semantic control identifiers; the driver resolves them to markup.
pub mod controls {
    pub const EDIT_PROFILE: &str = "edit-profile";
    pub const PHONE_NUMBER: &str = "phone-number";
    pub const SUBMIT_CHANGE: &str = "submit-change";
    pub const CAPTCHA: &str = "captcha";
    pub const CONFIRM_SUBMIT: &str = "confirm-submit";
    pub const RETURN_HOME: &str = "return-home";
}

/// Runs the full phone-change workflow for one bound account.
pub async fn run_phone_change(
    driver: &mut dyn PageDriver,
    ctx: &WorkerContext,
    cfg: &Config,
    task_id: &str,
    account: &Account,
    phone: &str,
) -> Result<(), FlowError> {
    verify_region(driver, &cfg.required_region).await?;
    run_login(driver, ctx, cfg, account).await?;
    change_phone_steps(driver, ctx, cfg, task_id, phone).await
}

/// The post-login portion: profile edit through completion and return.
pub(crate) async fn change_phone_steps(
    driver: &mut dyn PageDriver,
    ctx: &WorkerContext,
    cfg: &Config,
    task_id: &str,
    phone: &str,
) -> Result<(), FlowError> {
    let timing = StepTiming {
        interval: cfg.poll_interval,
        timeout: cfg.step_timeout,
    };

    driver.click(controls::EDIT_PROFILE).await?;
    poll_for(driver, &ctx.token, &PROFILE_EDIT_RE, "profile edit page", timing).await?;

    driver.fill(controls::PHONE_NUMBER, phone).await?;
    driver.click(controls::SUBMIT_CHANGE).await?;
    poll_for(driver, &ctx.token, &CHANGE_CONFIRM_RE, "change confirmation page", timing).await?;

    publish_status(ctx, task_id, PhoneTaskStatus::CaptchaSent, None);
    tracing::info!(task_id, wait = ?cfg.captcha_wait, "awaiting captcha submission");
    let ev = ctx
        .bus
        .await_once(&ctx.token, cfg.captcha_wait, |ev| match &ev.payload {
            Payload::CaptchaSubmitted { task_id: id, .. } => &**id == task_id,
            _ => false,
        })
        .await
        .map_err(|e| match e {
            CorrelateError::TimedOut { timeout } => FlowError::CodeTimeout {
                what: "captcha",
                timeout,
            },
            CorrelateError::Aborted | CorrelateError::Closed => FlowError::Canceled,
        })?;
    let captcha = match ev.payload {
        Payload::CaptchaSubmitted { captcha, .. } => captcha,
        _ => Arc::from(""),
    };
    publish_status(ctx, task_id, PhoneTaskStatus::CaptchaSubmitted, None);

    driver.fill(controls::CAPTCHA, &captcha).await?;
    driver.click(controls::CONFIRM_SUBMIT).await?;
    poll_for(driver, &ctx.token, &CHANGE_COMPLETE_RE, "change completion page", timing).await?;
    tracing::info!(task_id, "phone change completed");

    // Prefer the in-page return control; fall back to direct navigation when
    // it cannot be found or does not land home within the short bound.
    let return_timing = StepTiming {
        interval: cfg.poll_interval,
        timeout: cfg.return_timeout,
    };
    let returned = match driver.click(controls::RETURN_HOME).await {
        Ok(()) => poll_for(driver, &ctx.token, &HOME_RE, "return to home", return_timing).await,
        Err(e) => Err(FlowError::from(e)),
    };
    match returned {
        Ok(()) => {}
        Err(FlowError::Canceled) => return Err(FlowError::Canceled),
        Err(reason) => {
            tracing::debug!(task_id, %reason, "in-page return unavailable, navigating directly");
            driver.goto(HOME_URL).await?;
        }
    }
    Ok(())
}

fn publish_status(
    ctx: &WorkerContext,
    task_id: &str,
    status: PhoneTaskStatus,
    detail: Option<&str>,
) {
    ctx.bus.publish(Event::new(Payload::TaskStatus {
        task_id: Arc::from(task_id),
        status,
        detail: detail.map(Arc::from),
    }));
}
