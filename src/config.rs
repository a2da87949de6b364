//! # Global runtime configuration.
//!
//! Provides [`Config`] centralized settings for the supervisor, the mailbox
//! watcher, the workflow engines, and the phone-change scheduler.
//!
//! Config is used in two ways:
//! 1. **Supervisor creation**: `Supervisor::new(config, store)`
//! 2. **Worker construction**: workers copy the timing fields they need
//!
//! Every delay in the system is a fixed interval. Backoff never grows:
//! a crashed worker is respawned after [`Config::respawn_delay`], a lost
//! mailbox session is reopened after [`Config::reconnect_delay`], and both
//! sleeps abort the moment shutdown is requested.

use std::time::Duration;

/// Global configuration for the provisioning runtime.
///
/// Defines:
/// - **Shutdown behavior**: grace period for graceful termination
/// - **Supervision**: fixed respawn delay for unclean worker exits
/// - **Mailbox watcher**: reconnect delay, cold-start lookback, idle heartbeat
/// - **Workflow timeouts**: per-step page polling and correlation waits
/// - **Scheduler**: tick interval and phone-change concurrency ceiling
///
/// ## Field semantics
/// Durations are hard bounds, not hints: a correlation wait that reaches its
/// bound resolves with a timeout outcome, and a page poll that reaches
/// [`Config::step_timeout`] fails the step with a timeout classification.
#[derive(Clone, Debug)]
pub struct Config {
    /// Maximum time to wait for workers to stop after a shutdown signal.
    ///
    /// When the grace window elapses with workers still running, the
    /// supervisor returns `RuntimeError::GraceExceeded` naming them.
    pub grace: Duration,

    /// Fixed delay before respawning a worker that exited uncleanly.
    ///
    /// A shutdown request during this delay cancels the pending respawn.
    pub respawn_delay: Duration,

    /// Capacity of the event bus broadcast ring buffer.
    ///
    /// Slow subscribers that lag behind more than this many events skip the
    /// oldest ones. Minimum value is 1 (enforced by the bus).
    pub bus_capacity: usize,

    /// Fixed delay before the watcher retries a failed or lost mailbox
    /// connection.
    pub reconnect_delay: Duration,

    /// Cold-start fetch window: with no known watermark the watcher fetches
    /// only messages received within this window.
    pub lookback: Duration,

    /// Idle heartbeat: while waiting for mailbox change notifications the
    /// watcher issues a no-op keepalive at this interval so the server does
    /// not drop the idle connection.
    pub heartbeat: Duration,

    /// How long a registration link stays usable after the message's declared
    /// receive time. An older link is treated as absent.
    pub link_validity: Duration,

    /// Correlation bound for a fresh registration-link email.
    pub link_wait: Duration,

    /// Correlation bound for an account-scoped MFA code.
    pub mfa_wait: Duration,

    /// Correlation bound for an externally submitted captcha.
    pub captcha_wait: Duration,

    /// Correlation bound for account binding before a phone-change job.
    pub bind_wait: Duration,

    /// Interval between page-state polls within one workflow step.
    pub poll_interval: Duration,

    /// Bound on one workflow step: the page must reach the expected URL (or
    /// show an error indicator) within this window.
    pub step_timeout: Duration,

    /// Short bound on the in-page return-to-home control after a completed
    /// phone change, before falling back to direct navigation.
    pub return_timeout: Duration,

    /// Interval at which the registration engine re-checks the store for
    /// pending accounts when no replay event arrives.
    pub pending_recheck: Duration,

    /// Interval of the phone-change scheduler's admission tick.
    pub tick_interval: Duration,

    /// Maximum number of phone-change tasks in flight at once.
    pub max_phone_tasks: usize,

    /// Country code the automation's network egress must report before a
    /// browser workflow is allowed to proceed.
    pub required_region: String,
}

impl Default for Config {
    /// Default configuration:
    ///
    /// - `grace = 60s`, `respawn_delay = 3s`, `bus_capacity = 1024`
    /// - `reconnect_delay = 5s`, `lookback = 60min`, `heartbeat = 20s`
    /// - `link_validity = 60min`, `link_wait = 60min`, `mfa_wait = 5min`
    /// - `captcha_wait = 60s`, `bind_wait = 30s`
    /// - `poll_interval = 1s`, `step_timeout = 60s`, `return_timeout = 10s`
    /// - `pending_recheck = 60s`, `tick_interval = 5s`, `max_phone_tasks = 4`
    /// - `required_region = "JP"`
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(60),
            respawn_delay: Duration::from_secs(3),
            bus_capacity: 1024,
            reconnect_delay: Duration::from_secs(5),
            lookback: Duration::from_secs(60 * 60),
            heartbeat: Duration::from_secs(20),
            link_validity: Duration::from_secs(60 * 60),
            link_wait: Duration::from_secs(60 * 60),
            mfa_wait: Duration::from_secs(5 * 60),
            captcha_wait: Duration::from_secs(60),
            bind_wait: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
            step_timeout: Duration::from_secs(60),
            return_timeout: Duration::from_secs(10),
            pending_recheck: Duration::from_secs(60),
            tick_interval: Duration::from_secs(5),
            max_phone_tasks: 4,
            required_region: "JP".to_string(),
        }
    }
}

impl Config {
    /// Returns a bus capacity clamped to a minimum of 1.
    #[inline]
    pub fn bus_capacity_clamped(&self) -> usize {
        self.bus_capacity.max(1)
    }
}
