//! # Phone-change task model.
//!
//! A [`PhoneChangeTask`] makes monotonic forward progress through its status
//! sequence; the terminal `Failed` state is reachable from any non-terminal
//! status. Rejected transitions are logged invariant violations, never
//! silent state corruption.

use serde::{Deserialize, Serialize};

/// Status sequence of a phone-change task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhoneTaskStatus {
    /// Created, awaiting admission.
    Pending,
    /// An account was bound to the job.
    Bound,
    /// The verification captcha was triggered on the page.
    CaptchaSent,
    /// The externally submitted captcha was consumed.
    CaptchaSubmitted,
    /// Terminal: the number was changed.
    Succeeded,
    /// Terminal: the task failed; see its detail.
    Failed,
}

impl PhoneTaskStatus {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            PhoneTaskStatus::Pending => "pending",
            PhoneTaskStatus::Bound => "bound",
            PhoneTaskStatus::CaptchaSent => "captcha_sent",
            PhoneTaskStatus::CaptchaSubmitted => "captcha_submitted",
            PhoneTaskStatus::Succeeded => "succeeded",
            PhoneTaskStatus::Failed => "failed",
        }
    }

    /// True for the two end states.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PhoneTaskStatus::Succeeded | PhoneTaskStatus::Failed)
    }

    fn rank(&self) -> u8 {
        match self {
            PhoneTaskStatus::Pending => 0,
            PhoneTaskStatus::Bound => 1,
            PhoneTaskStatus::CaptchaSent => 2,
            PhoneTaskStatus::CaptchaSubmitted => 3,
            PhoneTaskStatus::Succeeded => 4,
            PhoneTaskStatus::Failed => 5,
        }
    }

    /// Whether a transition to `next` keeps forward progress: strictly
    /// ahead in the sequence, or `Failed` from any non-terminal state.
    pub fn can_advance_to(&self, next: PhoneTaskStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == PhoneTaskStatus::Failed {
            return true;
        }
        next.rank() > self.rank() && !matches!(next, PhoneTaskStatus::Pending)
    }
}

/// One phone-change job, held in the scheduler's map until terminal.
#[derive(Debug, Clone)]
pub struct PhoneChangeTask {
    /// Unique task identifier from the external request.
    pub task_id: String,
    /// The number to install.
    pub phone: String,
    /// Account bound to the job, once binding succeeded.
    pub bound_account: Option<String>,
    /// Current status.
    pub status: PhoneTaskStatus,
    /// Externally submitted captcha; set at most once.
    pub captcha: Option<String>,
    /// Failure detail or progress annotation.
    pub detail: Option<String>,
    /// Scheduler marker: the job future is running.
    pub(crate) in_flight: bool,
}

impl PhoneChangeTask {
    /// Creates a pending task.
    pub fn new(task_id: impl Into<String>, phone: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            phone: phone.into(),
            bound_account: None,
            status: PhoneTaskStatus::Pending,
            captcha: None,
            detail: None,
            in_flight: false,
        }
    }

    /// Applies a status transition, enforcing forward progress. Returns
    /// whether the transition was accepted.
    pub fn advance(&mut self, next: PhoneTaskStatus, detail: Option<String>) -> bool {
        if !self.status.can_advance_to(next) {
            tracing::warn!(
                task_id = %self.task_id,
                from = self.status.as_label(),
                to = next.as_label(),
                "rejected status transition"
            );
            return false;
        }
        self.status = next;
        if detail.is_some() {
            self.detail = detail;
        }
        true
    }

    /// Records the externally submitted captcha; only the first submission
    /// sticks.
    pub fn set_captcha(&mut self, captcha: impl Into<String>) -> bool {
        if self.captcha.is_some() {
            tracing::warn!(task_id = %self.task_id, "captcha already set, ignoring resubmission");
            return false;
        }
        self.captcha = Some(captcha.into());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_progress_only() {
        let mut task = PhoneChangeTask::new("t1", "08011112222");
        assert!(task.advance(PhoneTaskStatus::Bound, Some("a@x".into())));
        assert!(task.advance(PhoneTaskStatus::CaptchaSent, None));
        // Backwards is rejected and leaves state untouched.
        assert!(!task.advance(PhoneTaskStatus::Bound, None));
        assert_eq!(task.status, PhoneTaskStatus::CaptchaSent);
        assert!(task.advance(PhoneTaskStatus::CaptchaSubmitted, None));
        assert!(task.advance(PhoneTaskStatus::Succeeded, None));
        // Terminal states accept nothing further.
        assert!(!task.advance(PhoneTaskStatus::Failed, None));
    }

    #[test]
    fn test_failed_reachable_from_any_non_terminal() {
        for status in [
            PhoneTaskStatus::Pending,
            PhoneTaskStatus::Bound,
            PhoneTaskStatus::CaptchaSent,
            PhoneTaskStatus::CaptchaSubmitted,
        ] {
            assert!(status.can_advance_to(PhoneTaskStatus::Failed), "{status:?}");
        }
        assert!(!PhoneTaskStatus::Succeeded.can_advance_to(PhoneTaskStatus::Failed));
        assert!(!PhoneTaskStatus::Failed.can_advance_to(PhoneTaskStatus::Failed));
    }

    #[test]
    fn test_captcha_set_once() {
        let mut task = PhoneChangeTask::new("t1", "08011112222");
        assert!(task.set_captcha("1111"));
        assert!(!task.set_captcha("2222"));
        assert_eq!(task.captcha.as_deref(), Some("1111"));
    }
}
