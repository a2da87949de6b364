//! # IMAP implementation of the mailbox collaborator.
//!
//! Connects over TLS, authenticates, selects one folder, and serves the
//! [`MailSession`] operations: UID-range search + fetch, since-date search
//! for the cold-start lookback, IDLE-based change waits bounded by the
//! heartbeat, NOOP keepalive, and LOGOUT.
//!
//! The session object is owned exclusively by the watcher; IDLE temporarily
//! consumes it and hands it back through `done()`.

use std::time::Duration;

use async_imap::types::Fetch;
use async_imap::Session;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::net::TcpStream;
use tokio_native_tls::TlsStream;

use crate::error::MailError;

use super::session::{FetchedMail, MailSession, Mailbox, Wake};

type TlsSession = Session<TlsStream<TcpStream>>;

const FETCH_ITEMS: &str = "(UID ENVELOPE INTERNALDATE BODY.PEEK[TEXT])";

/// Connection settings for one watched IMAP mailbox.
#[derive(Debug, Clone)]
pub struct ImapConfig {
    /// Server host name.
    pub host: String,
    /// TLS port, typically 993.
    pub port: u16,
    /// Login user (the watched address).
    pub user: String,
    /// IMAP authorization password.
    pub password: String,
    /// Folder to watch, typically `INBOX`.
    pub folder: String,
}

impl ImapConfig {
    /// Settings for the standard TLS port and `INBOX`.
    pub fn new(host: impl Into<String>, user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 993,
            user: user.into(),
            password: password.into(),
            folder: "INBOX".to_string(),
        }
    }
}

/// IMAP-backed [`Mailbox`] factory.
pub struct ImapMailbox {
    cfg: ImapConfig,
}

impl ImapMailbox {
    pub fn new(cfg: ImapConfig) -> Self {
        Self { cfg }
    }
}

#[async_trait]
impl Mailbox for ImapMailbox {
    async fn connect(&self) -> Result<Box<dyn MailSession>, MailError> {
        let cfg = &self.cfg;
        let tcp = TcpStream::connect((cfg.host.as_str(), cfg.port))
            .await
            .map_err(|e| MailError::Connect {
                detail: e.to_string(),
            })?;
        let tls = tokio_native_tls::native_tls::TlsConnector::builder()
            .build()
            .map_err(|e| MailError::Connect {
                detail: e.to_string(),
            })?;
        let tls = tokio_native_tls::TlsConnector::from(tls);
        let tls_stream = tls
            .connect(&cfg.host, tcp)
            .await
            .map_err(|e| MailError::Connect {
                detail: e.to_string(),
            })?;

        let client = async_imap::Client::new(tls_stream);
        let mut session = client
            .login(&cfg.user, &cfg.password)
            .await
            .map_err(|(e, _)| MailError::Connect {
                detail: format!("login failed: {e}"),
            })?;
        session
            .select(&cfg.folder)
            .await
            .map_err(protocol_err)?;

        tracing::info!(host = %cfg.host, folder = %cfg.folder, "imap session established");
        Ok(Box::new(ImapMailSession {
            session: Some(session),
        }))
    }
}

struct ImapMailSession {
    /// `None` only transiently while IDLE owns the session, or after logout.
    session: Option<TlsSession>,
}

impl ImapMailSession {
    fn session_mut(&mut self) -> Result<&mut TlsSession, MailError> {
        self.session.as_mut().ok_or(MailError::Closed)
    }

    /// Searches with the given criteria and fetches the matching UIDs.
    async fn search_and_fetch(
        &mut self,
        criteria: String,
        above: u32,
    ) -> Result<Vec<FetchedMail>, MailError> {
        let session = self.session_mut()?;
        let uids = session.uid_search(&criteria).await.map_err(protocol_err)?;
        let mut newer: Vec<u32> = uids.into_iter().filter(|u| *u > above).collect();
        newer.sort_unstable();
        if newer.is_empty() {
            return Ok(Vec::new());
        }

        let seq = newer
            .iter()
            .map(|u| u.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let mut out = Vec::new();
        {
            let mut fetches = session
                .uid_fetch(&seq, FETCH_ITEMS)
                .await
                .map_err(protocol_err)?;
            while let Some(item) = fetches.next().await {
                let fetch = item.map_err(protocol_err)?;
                if let Some(mail) = to_fetched(&fetch) {
                    if mail.uid > above {
                        out.push(mail);
                    }
                }
            }
        }
        out.sort_by_key(|m| m.uid);
        Ok(out)
    }
}

#[async_trait]
impl MailSession for ImapMailSession {
    async fn fetch_above(&mut self, uid: u32) -> Result<Vec<FetchedMail>, MailError> {
        // The half-open range (uid, ∞). Servers include the newest message
        // in `n:*` even when its UID is below n, so results are re-filtered.
        self.search_and_fetch(format!("UID {}:*", uid.saturating_add(1)), uid)
            .await
    }

    async fn fetch_lookback(&mut self, window: Duration) -> Result<Vec<FetchedMail>, MailError> {
        let cutoff = Utc::now() - chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
        // SEARCH SINCE has day granularity; re-filter on INTERNALDATE below.
        let criteria = format!("SINCE {}", cutoff.format("%d-%b-%Y"));
        let mut batch = self.search_and_fetch(criteria, 0).await?;
        batch.retain(|m| m.received_at >= cutoff);
        Ok(batch)
    }

    async fn wait_for_change(&mut self, heartbeat: Duration) -> Result<Wake, MailError> {
        let session = self.session.take().ok_or(MailError::Closed)?;
        let mut idle = session.idle();
        if let Err(e) = idle.init().await {
            return Err(protocol_err(e));
        }

        let wake = {
            let (wait, interrupt) = idle.wait();
            tokio::pin!(wait);
            tokio::select! {
                res = &mut wait => match res {
                    Ok(_) => Wake::Notified,
                    Err(e) => return Err(protocol_err(e)),
                },
                _ = tokio::time::sleep(heartbeat) => {
                    // Interrupt the server wait so DONE can be sent.
                    drop(interrupt);
                    Wake::Heartbeat
                }
            }
        };

        let session = idle.done().await.map_err(protocol_err)?;
        self.session = Some(session);
        Ok(wake)
    }

    async fn keepalive(&mut self) -> Result<(), MailError> {
        self.session_mut()?.noop().await.map_err(protocol_err)
    }

    async fn logout(&mut self) -> Result<(), MailError> {
        match self.session.take() {
            Some(mut session) => session.logout().await.map_err(protocol_err),
            None => Ok(()),
        }
    }
}

fn protocol_err(e: async_imap::error::Error) -> MailError {
    MailError::Protocol {
        detail: e.to_string(),
    }
}

/// Converts a FETCH response into the watcher's raw-message shape.
///
/// Messages without a UID or envelope are malformed for our purposes and
/// dropped here; the caller's watermark logic never sees them.
fn to_fetched(fetch: &Fetch) -> Option<FetchedMail> {
    let uid = fetch.uid?;
    let envelope = fetch.envelope()?;

    let sender = envelope
        .from
        .as_ref()
        .and_then(|addrs| addrs.first())
        .map(format_address)
        .unwrap_or_default();
    let recipient = envelope
        .to
        .as_ref()
        .and_then(|addrs| addrs.first())
        .map(format_address)
        .unwrap_or_default();
    let subject = envelope
        .subject
        .as_ref()
        .map(|raw| String::from_utf8_lossy(raw).to_string())
        .unwrap_or_default();
    let received_at: DateTime<Utc> = fetch
        .internal_date()
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);
    let body = fetch
        .text()
        .map(|raw| String::from_utf8_lossy(raw).to_string())
        .unwrap_or_default();

    Some(FetchedMail {
        uid,
        sender,
        recipient,
        subject,
        received_at,
        body,
    })
}

fn format_address(addr: &async_imap::imap_proto::types::Address) -> String {
    let mailbox = addr
        .mailbox
        .as_ref()
        .map(|raw| String::from_utf8_lossy(raw).to_string())
        .unwrap_or_default();
    let host = addr
        .host
        .as_ref()
        .map(|raw| String::from_utf8_lossy(raw).to_string())
        .unwrap_or_default();
    if host.is_empty() {
        mailbox
    } else {
        format!("{mailbox}@{host}")
    }
}
