//! Error types used by the provisioning runtime and its workers.
//!
//! This module defines the error enums for each layer:
//!
//! - [`RuntimeError`] — errors raised by the supervision runtime itself.
//! - [`WorkerError`] — terminal results of one worker execution.
//! - [`CorrelateError`] — outcomes of a bounded correlation wait.
//! - [`MailError`] — mailbox collaborator failures (always transient).
//! - [`PageError`] — page-driver collaborator failures.
//! - [`FlowError`] — workflow step failures, classified retryable or terminal.
//! - [`StoreError`] — persistent-store collaborator failures.
//!
//! Types provide `as_label()` for logging/metrics; [`FlowError`] additionally
//! carries the retryable/terminal classification that decides whether a
//! failed item goes back to a pending state or stays failed until external
//! intervention.

use std::time::Duration;
use thiserror::Error;

/// Errors produced by the supervision runtime itself.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Shutdown grace period was exceeded; some workers remained stuck.
    #[error("shutdown grace {grace:?} exceeded; stuck: {stuck:?}")]
    GraceExceeded {
        /// The configured grace duration.
        grace: Duration,
        /// Names of workers that did not stop in time.
        stuck: Vec<String>,
    },
}

impl RuntimeError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            RuntimeError::GraceExceeded { .. } => "runtime_grace_exceeded",
        }
    }
}

/// Terminal result of one worker execution.
///
/// A worker that returns `Fail` exited uncleanly and is respawned after the
/// fixed delay; `Fatal` stops the worker permanently; `Canceled` is the
/// graceful response to a stop request and never triggers a respawn.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Non-recoverable fault; the worker is not respawned.
    #[error("fatal worker error (no respawn): {error}")]
    Fatal {
        /// The underlying error message.
        error: String,
    },

    /// Unclean exit; the supervisor schedules a respawn.
    #[error("worker failed: {error}")]
    Fail {
        /// The underlying error message.
        error: String,
    },

    /// Worker observed cancellation and stopped cooperatively.
    #[error("worker cancelled")]
    Canceled,
}

impl WorkerError {
    /// Wraps any error as an unclean (respawnable) exit.
    pub fn failed(err: impl std::fmt::Display) -> Self {
        WorkerError::Fail {
            error: err.to_string(),
        }
    }

    /// Wraps any error as a fatal (non-respawnable) exit.
    pub fn fatal(err: impl std::fmt::Display) -> Self {
        WorkerError::Fatal {
            error: err.to_string(),
        }
    }

    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            WorkerError::Fatal { .. } => "worker_fatal",
            WorkerError::Fail { .. } => "worker_failed",
            WorkerError::Canceled => "worker_canceled",
        }
    }

    /// True when the supervisor should schedule a respawn.
    pub fn is_unclean(&self) -> bool {
        matches!(self, WorkerError::Fail { .. })
    }
}

/// Outcome of a bounded correlation wait that did not match.
#[non_exhaustive]
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CorrelateError {
    /// No matching event arrived within the bound.
    #[error("no matching event within {timeout:?}")]
    TimedOut {
        /// The configured wait bound.
        timeout: Duration,
    },

    /// The wait was aborted by cancellation before it could match.
    #[error("correlation wait aborted")]
    Aborted,

    /// The bus was closed; no further events can arrive.
    #[error("event bus closed")]
    Closed,
}

impl CorrelateError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            CorrelateError::TimedOut { .. } => "correlate_timeout",
            CorrelateError::Aborted => "correlate_aborted",
            CorrelateError::Closed => "correlate_closed",
        }
    }
}

/// Mailbox collaborator failures.
///
/// All variants are transient-infra by taxonomy: the watcher retries with a
/// fixed delay and never surfaces them as item failures.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum MailError {
    /// Could not establish or authenticate a mailbox session.
    #[error("mailbox connect failed: {detail}")]
    Connect {
        /// Underlying failure description.
        detail: String,
    },

    /// The session broke mid-operation (fetch, idle, keepalive).
    #[error("mailbox protocol error: {detail}")]
    Protocol {
        /// Underlying failure description.
        detail: String,
    },

    /// The server closed the session.
    #[error("mailbox session closed")]
    Closed,
}

impl MailError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            MailError::Connect { .. } => "mail_connect",
            MailError::Protocol { .. } => "mail_protocol",
            MailError::Closed => "mail_closed",
        }
    }
}

/// Page-driver collaborator failure (navigation, input, or read fault).
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum PageError {
    /// The driver could not perform the requested operation.
    #[error("page driver error: {detail}")]
    Driver {
        /// Underlying failure description.
        detail: String,
    },
}

/// Persistent-store collaborator failure.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store could not serve the request.
    #[error("store unavailable: {detail}")]
    Unavailable {
        /// Underlying failure description.
        detail: String,
    },
}

/// Workflow step failure with retryable/terminal classification.
///
/// Classification rules:
/// - **retryable** — expired registration link, step timeout, link-wait
///   timeout, driver/infra fault. The item may be attempted again later.
/// - **terminal** — egress-region mismatch, explicit inline page error,
///   malformed profile data, MFA/captcha wait past its deadline, no bindable
///   account. The item stays failed until external intervention.
/// - `Canceled` is neither: it propagates shutdown and records no outcome.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum FlowError {
    /// Network egress reports a different country than required.
    #[error("egress region {found} is not {required}")]
    RegionMismatch {
        /// Country the workflow must run from.
        required: String,
        /// Country the probe actually reported.
        found: String,
    },

    /// The page showed an explicit error indicator; the text is the reason.
    #[error("{text}")]
    PageRejected {
        /// Exact indicator text read from the page.
        text: String,
    },

    /// The registration link was expired or already consumed.
    #[error("registration link expired")]
    ExpiredLink,

    /// A page step reached its poll bound with neither success nor error.
    #[error("timed out after {timeout:?} waiting for {step}")]
    StepTimeout {
        /// Human-readable step description.
        step: &'static str,
        /// The configured step bound.
        timeout: Duration,
    },

    /// No registration-link email arrived within the wait bound.
    #[error("no registration link received within {timeout:?}")]
    LinkTimeout {
        /// The configured wait bound.
        timeout: Duration,
    },

    /// A short-deadline code (MFA code, captcha) did not arrive in time.
    #[error("no {what} received within {timeout:?}")]
    CodeTimeout {
        /// What was awaited ("mfa code", "captcha").
        what: &'static str,
        /// The configured wait bound.
        timeout: Duration,
    },

    /// No account could be bound to the job.
    #[error("no available account")]
    NoAccount,

    /// Profile data cannot fill the form (e.g. password policy).
    #[error("malformed profile: {detail}")]
    MalformedProfile {
        /// What is wrong with the data.
        detail: String,
    },

    /// The page driver itself faulted.
    #[error("page driver fault: {detail}")]
    Driver {
        /// Underlying failure description.
        detail: String,
    },

    /// The workflow observed cancellation.
    #[error("workflow cancelled")]
    Canceled,
}

impl From<PageError> for FlowError {
    fn from(err: PageError) -> Self {
        let PageError::Driver { detail } = err;
        FlowError::Driver { detail }
    }
}

impl FlowError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            FlowError::RegionMismatch { .. } => "flow_region_mismatch",
            FlowError::PageRejected { .. } => "flow_page_rejected",
            FlowError::ExpiredLink => "flow_expired_link",
            FlowError::StepTimeout { .. } => "flow_step_timeout",
            FlowError::LinkTimeout { .. } => "flow_link_timeout",
            FlowError::CodeTimeout { .. } => "flow_code_timeout",
            FlowError::NoAccount => "flow_no_account",
            FlowError::MalformedProfile { .. } => "flow_malformed_profile",
            FlowError::Driver { .. } => "flow_driver",
            FlowError::Canceled => "flow_canceled",
        }
    }

    /// True when the failed item may be attempted again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FlowError::ExpiredLink
                | FlowError::StepTimeout { .. }
                | FlowError::LinkTimeout { .. }
                | FlowError::Driver { .. }
        )
    }

    /// True when the item stays failed until external intervention.
    pub fn is_terminal(&self) -> bool {
        !self.is_retryable() && !matches!(self, FlowError::Canceled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_classification() {
        assert!(FlowError::ExpiredLink.is_retryable());
        assert!(FlowError::StepTimeout {
            step: "x",
            timeout: Duration::from_secs(1)
        }
        .is_retryable());
        assert!(FlowError::LinkTimeout {
            timeout: Duration::from_secs(1)
        }
        .is_retryable());
        assert!(FlowError::Driver {
            detail: "boom".into()
        }
        .is_retryable());

        assert!(FlowError::RegionMismatch {
            required: "JP".into(),
            found: "US".into()
        }
        .is_terminal());
        assert!(FlowError::PageRejected {
            text: "invalid number".into()
        }
        .is_terminal());
        assert!(FlowError::CodeTimeout {
            what: "captcha",
            timeout: Duration::from_secs(60)
        }
        .is_terminal());
        assert!(FlowError::NoAccount.is_terminal());

        assert!(!FlowError::Canceled.is_retryable());
        assert!(!FlowError::Canceled.is_terminal());
    }

    #[test]
    fn test_page_rejection_preserves_exact_text() {
        let err = FlowError::PageRejected {
            text: "invalid number".into(),
        };
        assert_eq!(err.to_string(), "invalid number");
    }
}
