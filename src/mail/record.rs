//! # Structured mail records and content extraction.
//!
//! The watcher turns each fetched message into a [`MailRecord`] carrying one
//! extracted artifact: a six-digit verification code or a registration link.
//! Messages yielding neither are parse misses and never become records.
//!
//! ## Link validity
//! A registration link is time-limited: it is usable only while the message's
//! declared receive time is within the configured window of evaluation time.
//! An expired link is treated as **absent**, not as an error.

use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::session::FetchedMail;

/// Six-digit code following the verification-code label.
static CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"验证码[：:]\s*(\d{6})").expect("code pattern"));

/// First http(s) URL in the body.
static LINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"https?://[^\s"'<>]+"#).expect("link pattern"));

/// The artifact extracted from a message body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum Extracted {
    /// A six-digit verification code (MFA login).
    VerificationCode(String),
    /// A time-limited registration URL.
    RegistrationLink(String),
}

/// A parsed mail message. Written at most once per UID, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailRecord {
    /// Mailbox-assigned, per-mailbox monotonically increasing identifier.
    /// The dedup and watermark key.
    pub uid: u32,
    /// Envelope sender address.
    pub sender: String,
    /// Envelope recipient address; workflows correlate on this.
    pub recipient: String,
    /// Message subject.
    pub subject: String,
    /// Declared receive time of the message.
    pub received_at: DateTime<Utc>,
    /// The extracted artifact.
    pub extracted: Extracted,
}

impl MailRecord {
    /// Parses a fetched message into a record.
    ///
    /// Returns `None` when the body yields neither a code nor a link; the
    /// caller logs and skips such messages without affecting the watermark.
    /// A code takes precedence over a link when both appear.
    pub fn from_fetched(mail: &FetchedMail) -> Option<MailRecord> {
        let extracted = extract(&mail.body)?;
        Some(MailRecord {
            uid: mail.uid,
            sender: mail.sender.clone(),
            recipient: mail.recipient.clone(),
            subject: mail.subject.clone(),
            received_at: mail.received_at,
            extracted,
        })
    }

    /// The registration link, if this record carries one that is still
    /// within its validity `window` at time `at`. Expired links are absent.
    pub fn valid_link(&self, at: DateTime<Utc>, window: Duration) -> Option<&str> {
        let Extracted::RegistrationLink(ref url) = self.extracted else {
            return None;
        };
        let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
        let age = at.signed_duration_since(self.received_at);
        if age <= window {
            Some(url)
        } else {
            None
        }
    }

    /// Consumes the record, yielding its registration link if it has one.
    pub fn into_link(self) -> Option<String> {
        match self.extracted {
            Extracted::RegistrationLink(url) => Some(url),
            Extracted::VerificationCode(_) => None,
        }
    }

    /// The verification code, if this record carries one.
    pub fn code(&self) -> Option<&str> {
        match self.extracted {
            Extracted::VerificationCode(ref code) => Some(code),
            Extracted::RegistrationLink(_) => None,
        }
    }
}

/// Scans a message body for a verification code or a registration link.
pub fn extract(body: &str) -> Option<Extracted> {
    if let Some(caps) = CODE_RE.captures(body) {
        return Some(Extracted::VerificationCode(caps[1].to_string()));
    }
    LINK_RE
        .find(body)
        .map(|m| Extracted::RegistrationLink(m.as_str().to_string()))
}
