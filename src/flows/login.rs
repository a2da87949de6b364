//! # Login/MFA workflow.
//!
//! Submits credentials, waits for the MFA prompt, awaits the account-scoped
//! verification code via the correlation layer (bounded by
//! [`Config::mfa_wait`]), submits it, and polls for the authenticated home
//! page. An MFA code that does not arrive in time is terminal for the item;
//! an inline error fails the step with the indicator's text.

use std::sync::LazyLock;

use regex::Regex;

use crate::config::Config;
use crate::error::{CorrelateError, FlowError};
use crate::events::Payload;
use crate::mail::Extracted;
use crate::store::Account;
use crate::supervisor::WorkerContext;

use super::page::{poll_for, PageDriver, StepTiming};
use super::register::LOGIN_URL;

static MFA_PROMPT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("auth-code-select").expect("mfa prompt pattern"));
pub(crate) static HOME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"https://www\.pokemoncenter-online\.com/mypage").expect("home pattern")
});

/// Semantic control identifiers; the driver resolves them to markup.
pub mod controls {
    pub const LOGIN_EMAIL: &str = "login-email";
    pub const LOGIN_PASSWORD: &str = "login-password";
    pub const LOGIN_SUBMIT: &str = "login-submit";
    pub const MFA_CODE: &str = "mfa-code";
    pub const MFA_SUBMIT: &str = "mfa-submit";
}

/// Logs the account in, completing MFA, and lands on the home page.
pub async fn run_login(
    driver: &mut dyn PageDriver,
    ctx: &WorkerContext,
    cfg: &Config,
    account: &Account,
) -> Result<(), FlowError> {
    let timing = StepTiming {
        interval: cfg.poll_interval,
        timeout: cfg.step_timeout,
    };

    driver.goto(LOGIN_URL).await?;
    driver.fill(controls::LOGIN_EMAIL, &account.account_id).await?;
    driver
        .fill(controls::LOGIN_PASSWORD, &account.password)
        .await?;
    driver.click(controls::LOGIN_SUBMIT).await?;
    poll_for(driver, &ctx.token, &MFA_PROMPT_RE, "mfa prompt", timing).await?;

    tracing::info!(account = %account.account_id, wait = ?cfg.mfa_wait, "awaiting mfa code");
    let ev = ctx
        .bus
        .await_once(&ctx.token, cfg.mfa_wait, |ev| match &ev.payload {
            Payload::MailFound { record } => {
                record.recipient == account.account_id
                    && matches!(record.extracted, Extracted::VerificationCode(_))
            }
            _ => false,
        })
        .await
        .map_err(|e| match e {
            CorrelateError::TimedOut { timeout } => FlowError::CodeTimeout {
                what: "mfa code",
                timeout,
            },
            CorrelateError::Aborted | CorrelateError::Closed => FlowError::Canceled,
        })?;

    let code = match &ev.payload {
        Payload::MailFound { record } => record.code().map(str::to_string),
        _ => None,
    }
    .ok_or(FlowError::CodeTimeout {
        what: "mfa code",
        timeout: cfg.mfa_wait,
    })?;

    driver.fill(controls::MFA_CODE, &code).await?;
    driver.click(controls::MFA_SUBMIT).await?;
    poll_for(driver, &ctx.token, &HOME_RE, "authenticated home", timing).await?;
    tracing::info!(account = %account.account_id, "login completed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Event;
    use crate::flows::page::testdriver::{PageStep, ScriptedDriver};
    use crate::mail::MailRecord;
    use crate::store::MemoryStore;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn quick_cfg() -> Config {
        Config {
            poll_interval: Duration::from_millis(5),
            step_timeout: Duration::from_millis(50),
            mfa_wait: Duration::from_millis(100),
            ..Config::default()
        }
    }

    fn test_ctx() -> WorkerContext {
        WorkerContext {
            token: CancellationToken::new(),
            bus: crate::events::Bus::new(64),
            store: Arc::new(MemoryStore::new()),
        }
    }

    fn code_record(recipient: &str, code: &str) -> MailRecord {
        MailRecord {
            uid: 21,
            sender: "noreply@example.jp".into(),
            recipient: recipient.into(),
            subject: "認証コード".into(),
            received_at: chrono::Utc::now(),
            extracted: Extracted::VerificationCode(code.into()),
        }
    }

    /// Login page (3 actions), MFA prompt after submit, then scripted tail.
    fn steps(tail: Vec<PageStep>) -> (PageStep, Vec<PageStep>) {
        let login = PageStep {
            url: LOGIN_URL.into(),
            ..Default::default()
        };
        let prompt = PageStep {
            url: "https://www.pokemoncenter-online.com/auth-code-select/".into(),
            ..Default::default()
        };
        let mut all = vec![login.clone(), login.clone(), login, prompt];
        all.extend(tail);
        (PageStep::default(), all)
    }

    #[tokio::test]
    async fn test_login_submits_awaited_code() {
        let ctx = test_ctx();
        let account = Account::new("user@example.com", "password123");

        let prompt = PageStep {
            url: "https://www.pokemoncenter-online.com/auth-code-select/".into(),
            ..Default::default()
        };
        let home = PageStep {
            url: "https://www.pokemoncenter-online.com/mypage/".into(),
            ..Default::default()
        };
        // fill(code) keeps the prompt page, click(submit) lands home.
        let (initial, all) = steps(vec![prompt, home]);

        let flow = {
            let ctx = ctx.clone();
            let account = account.clone();
            tokio::spawn(async move {
                let mut driver = ScriptedDriver::new(initial, all);
                let res = run_login(&mut driver, &ctx, &quick_cfg(), &account).await;
                let actions = driver.actions.lock().unwrap().clone();
                (res, actions)
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        ctx.bus.publish(Event::new(Payload::MailFound {
            record: code_record("user@example.com", "654321"),
        }));

        let (res, actions) = flow.await.unwrap();
        assert!(res.is_ok(), "unexpected failure: {res:?}");
        assert!(actions.iter().any(|a| a == "fill mfa-code=654321"));
    }

    #[tokio::test]
    async fn test_missing_mfa_code_is_terminal() {
        let ctx = test_ctx();
        let account = Account::new("user@example.com", "password123");
        let (initial, all) = steps(vec![]);

        let mut driver = ScriptedDriver::new(initial, all);
        let err = run_login(&mut driver, &ctx, &quick_cfg(), &account)
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::CodeTimeout { what: "mfa code", .. }));
        assert!(err.is_terminal());
    }

    #[tokio::test]
    async fn test_inline_error_fails_with_indicator_text() {
        let ctx = test_ctx();
        let account = Account::new("user@example.com", "wrongpass1");
        let login = PageStep {
            url: LOGIN_URL.into(),
            ..Default::default()
        };
        let rejected = PageStep {
            url: LOGIN_URL.into(),
            error: Some("メールアドレスまたはパスワードが正しくありません".into()),
            ..Default::default()
        };
        let mut driver = ScriptedDriver::new(
            PageStep::default(),
            vec![login.clone(), login.clone(), login, rejected],
        );
        let err = run_login(&mut driver, &ctx, &quick_cfg(), &account)
            .await
            .unwrap_err();
        match err {
            FlowError::PageRejected { text } => {
                assert_eq!(text, "メールアドレスまたはパスワードが正しくありません");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
