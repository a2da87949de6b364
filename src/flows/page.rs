//! # Page-state oracle and step polling.
//!
//! Workflows drive the target web application through [`PageDriver`], which
//! exposes exactly what the state machines need: navigation/input actions,
//! the current URL, the page text, and the error-indicator region. Concrete
//! markup knowledge lives in the driver implementation; workflows pass
//! semantic control identifiers and never see selectors.
//!
//! ## Step rule
//! Every step performs its action and then polls, at a fixed interval up to
//! a bound, for one of:
//! - (a) the URL matching the expected success pattern → advance;
//! - (b) the error indicator carrying text → fail with that exact text;
//! - (c) the bound elapsing → fail with a timeout-classified error.

use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{FlowError, PageError};
use crate::store::Account;

/// Abstract page-state oracle over one live browser page.
#[async_trait]
pub trait PageDriver: Send {
    /// Navigates to an absolute URL and waits for the load to settle.
    async fn goto(&mut self, url: &str) -> Result<(), PageError>;

    /// Fills the control identified by `field` with `value`.
    async fn fill(&mut self, field: &str, value: &str) -> Result<(), PageError>;

    /// Activates the control identified by `control`.
    async fn click(&mut self, control: &str) -> Result<(), PageError>;

    /// The page's current URL.
    async fn current_url(&mut self) -> Result<String, PageError>;

    /// The page's visible text content.
    async fn page_text(&mut self) -> Result<String, PageError>;

    /// Text of the designated error-indicator region, if it is showing
    /// anything. `None` means no error is displayed.
    async fn error_indicator(&mut self) -> Result<Option<String>, PageError>;
}

/// Opens one driver per job, bound to the account's browser profile.
#[async_trait]
pub trait DriverFactory: Send + Sync + 'static {
    /// Opens a fresh page session for the given account.
    async fn open(&self, account: &Account) -> Result<Box<dyn PageDriver>, PageError>;
}

/// Timing knobs shared by all steps of one workflow run.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StepTiming {
    pub interval: Duration,
    pub timeout: Duration,
}

/// Polls until the URL matches `expect`, the error indicator fires, or the
/// step bound elapses.
pub(crate) async fn poll_for(
    driver: &mut dyn PageDriver,
    token: &CancellationToken,
    expect: &Regex,
    step: &'static str,
    timing: StepTiming,
) -> Result<(), FlowError> {
    let deadline = Instant::now() + timing.timeout;
    loop {
        if token.is_cancelled() {
            return Err(FlowError::Canceled);
        }
        let url = driver.current_url().await?;
        tracing::debug!(step, url = %url, "polling page state");
        if expect.is_match(&url) {
            return Ok(());
        }
        if let Some(text) = driver.error_indicator().await? {
            let text = text.trim().to_string();
            if !text.is_empty() {
                tracing::info!(step, reason = %text, "page error indicator");
                return Err(FlowError::PageRejected { text });
            }
        }
        if Instant::now() + timing.interval > deadline {
            return Err(FlowError::StepTimeout {
                step,
                timeout: timing.timeout,
            });
        }
        tokio::select! {
            _ = token.cancelled() => return Err(FlowError::Canceled),
            _ = tokio::time::sleep(timing.interval) => {}
        }
    }
}

/// Where the egress probe document is served.
pub(crate) const EGRESS_PROBE_URL: &str = "https://ipinfo.io/json";

#[derive(Debug, Deserialize)]
struct EgressInfo {
    #[serde(default)]
    ip: String,
    country: String,
}

/// Rejects the workflow unless the current network egress reports the
/// required country. A mismatch is terminal; an unreadable probe is a
/// driver fault (retryable).
pub(crate) async fn verify_region(
    driver: &mut dyn PageDriver,
    required: &str,
) -> Result<(), FlowError> {
    driver.goto(EGRESS_PROBE_URL).await?;
    let text = driver.page_text().await?;
    let info: EgressInfo = serde_json::from_str(text.trim()).map_err(|e| FlowError::Driver {
        detail: format!("unreadable egress probe: {e}"),
    })?;
    if info.country != required {
        tracing::warn!(ip = %info.ip, country = %info.country, required, "egress region mismatch");
        return Err(FlowError::RegionMismatch {
            required: required.to_string(),
            found: info.country,
        });
    }
    tracing::debug!(ip = %info.ip, country = %info.country, "egress region verified");
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::testdriver::{PageStep, ScriptedDriver};
    use super::*;
    use std::sync::LazyLock;

    static OK_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new("done").unwrap());

    fn fast() -> StepTiming {
        StepTiming {
            interval: Duration::from_millis(5),
            timeout: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn test_poll_advances_on_url_match() {
        let mut driver = ScriptedDriver::new(
            PageStep {
                url: "https://x/done".into(),
                ..Default::default()
            },
            vec![],
        );
        let token = CancellationToken::new();
        let res = poll_for(&mut driver, &token, &OK_RE, "step", fast()).await;
        assert!(res.is_ok());
    }

    #[tokio::test]
    async fn test_poll_fails_with_exact_indicator_text() {
        let mut driver = ScriptedDriver::new(
            PageStep {
                url: "https://x/pending".into(),
                error: Some("invalid number".into()),
                ..Default::default()
            },
            vec![],
        );
        let token = CancellationToken::new();
        let err = poll_for(&mut driver, &token, &OK_RE, "step", fast())
            .await
            .unwrap_err();
        match &err {
            FlowError::PageRejected { text } => assert_eq!(text, "invalid number"),
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.is_terminal());
        assert_eq!(err.to_string(), "invalid number");
    }

    #[tokio::test]
    async fn test_poll_times_out_retryably() {
        let mut driver = ScriptedDriver::new(
            PageStep {
                url: "https://x/pending".into(),
                ..Default::default()
            },
            vec![],
        );
        let token = CancellationToken::new();
        let err = poll_for(&mut driver, &token, &OK_RE, "step", fast())
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::StepTimeout { step: "step", .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_region_probe_mismatch_is_terminal() {
        let mut driver = ScriptedDriver::new(
            PageStep {
                url: EGRESS_PROBE_URL.into(),
                text: r#"{"ip":"203.0.113.9","country":"US"}"#.into(),
                ..Default::default()
            },
            vec![],
        );
        let err = verify_region(&mut driver, "JP").await.unwrap_err();
        assert!(matches!(err, FlowError::RegionMismatch { .. }));
        assert!(err.is_terminal());
    }

    #[tokio::test]
    async fn test_region_probe_match_passes() {
        let mut driver = ScriptedDriver::new(
            PageStep {
                url: EGRESS_PROBE_URL.into(),
                text: r#"{"ip":"203.0.113.9","country":"JP","city":"Tokyo"}"#.into(),
                ..Default::default()
            },
            vec![],
        );
        assert!(verify_region(&mut driver, "JP").await.is_ok());
    }
}
