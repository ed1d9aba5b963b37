//! Dunning policy: staged retries for recoverable payment failures.
//!
//! [`DunningPolicy::decide`] is a pure decision function mapping a failed
//! charge to the follow-up action. It performs no I/O; the processor applies
//! the side effects.

use chrono::{DateTime, Duration, Utc};

use crate::error::ErrorCode;
use crate::models::SubscriptionStatus;

/// Maximum dunning attempts before a subscription goes `unpaid`.
pub const MAX_ATTEMPTS: i32 = 4;

/// Retry offsets in days, indexed by attempts already consumed. Cumulative
/// schedule from the first failure: 2, 7, 14, 21 days.
pub const RETRY_INTERVAL_DAYS: [i64; MAX_ATTEMPTS as usize] = [2, 7, 14, 21];

/// Human labels for the scheduled attempts.
pub const RETRY_LABELS: [&str; MAX_ATTEMPTS as usize] =
    ["First retry", "Second retry", "Third retry", "Final retry"];

/// Inputs to a dunning decision.
#[derive(Debug, Clone, Copy)]
pub struct DunningInput {
    pub error: ErrorCode,
    /// Attempts consumed before this failure.
    pub current_attempts: i32,
    pub failure_date: DateTime<Utc>,
}

/// Follow-up action for a failed charge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DunningAction {
    /// Permission revoked or expired: cancel, no retry, no next order.
    Terminal,
    /// Recoverable payment failure with budget left: schedule a retry.
    Retry {
        next_retry_at: DateTime<Utc>,
        /// 1-based number of the attempt being scheduled.
        attempt_number: i32,
        attempt_label: &'static str,
    },
    /// Recoverable failure but the schedule is exhausted: `unpaid`.
    MaxRetriesExhausted,
    /// Infrastructure failure: the queue redelivers, nothing else changes.
    UpstreamError,
    /// Bundler rejected during simulation; likely already settled in a
    /// parallel run, so neither retry nor next order.
    UserOperationFailed,
    /// Opaque payment failure: keep the subscription alive and advance to
    /// the next cycle's order.
    OtherError,
}

impl DunningAction {
    /// Subscription status the processor should persist, if any.
    pub fn subscription_status(&self) -> Option<SubscriptionStatus> {
        match self {
            DunningAction::Terminal => Some(SubscriptionStatus::Canceled),
            DunningAction::Retry { .. } => Some(SubscriptionStatus::PastDue),
            DunningAction::MaxRetriesExhausted => Some(SubscriptionStatus::Unpaid),
            DunningAction::UpstreamError
            | DunningAction::UserOperationFailed
            | DunningAction::OtherError => None,
        }
    }

    /// Whether the order's timer survives this failure.
    pub fn keeps_scheduler(&self) -> bool {
        matches!(self, DunningAction::Retry { .. } | DunningAction::UpstreamError)
    }

    /// Whether the next cycle's order should be created.
    pub fn creates_next_order(&self) -> bool {
        matches!(self, DunningAction::OtherError)
    }
}

/// Dunning decision rules. The defaults carry the canonical schedule; tests
/// and configuration may narrow it.
#[derive(Debug, Clone)]
pub struct DunningPolicy {
    max_attempts: i32,
    retry_interval_days: Vec<i64>,
}

impl Default for DunningPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            retry_interval_days: RETRY_INTERVAL_DAYS.to_vec(),
        }
    }
}

impl DunningPolicy {
    pub fn new(max_attempts: i32, retry_interval_days: Vec<i64>) -> Self {
        Self {
            max_attempts,
            retry_interval_days,
        }
    }

    pub fn max_attempts(&self) -> i32 {
        self.max_attempts
    }

    /// Classify a failure. Checked in order; first match wins.
    pub fn decide(&self, input: DunningInput) -> DunningAction {
        if input.error.is_terminal_payment() {
            return DunningAction::Terminal;
        }

        if input.error.is_retryable_payment() {
            if input.current_attempts < self.max_attempts {
                let index = input.current_attempts as usize;
                let days = self
                    .retry_interval_days
                    .get(index)
                    .copied()
                    .unwrap_or_else(|| *self.retry_interval_days.last().unwrap_or(&7));
                let label = RETRY_LABELS
                    .get(index)
                    .copied()
                    .unwrap_or(RETRY_LABELS[RETRY_LABELS.len() - 1]);

                return DunningAction::Retry {
                    next_retry_at: input.failure_date + Duration::days(days),
                    attempt_number: input.current_attempts + 1,
                    attempt_label: label,
                };
            }
            return DunningAction::MaxRetriesExhausted;
        }

        if input.error == ErrorCode::UpstreamServiceError {
            return DunningAction::UpstreamError;
        }

        if input.error == ErrorCode::UserOperationFailed {
            return DunningAction::UserOperationFailed;
        }

        DunningAction::OtherError
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_terminal_errors_cancel() {
        let policy = DunningPolicy::default();
        for code in [ErrorCode::PermissionRevoked, ErrorCode::PermissionExpired] {
            let action = policy.decide(DunningInput {
                error: code,
                current_attempts: 0,
                failure_date: at(2025, 1, 15),
            });
            assert_eq!(action, DunningAction::Terminal);
            assert_eq!(action.subscription_status(), Some(SubscriptionStatus::Canceled));
            assert!(!action.keeps_scheduler());
            assert!(!action.creates_next_order());
        }
    }

    #[test]
    fn test_retry_schedule() {
        let policy = DunningPolicy::default();
        let failure = at(2025, 1, 15);

        // attempts=2 -> third interval (14 days), attempt number 3
        let action = policy.decide(DunningInput {
            error: ErrorCode::InsufficientBalance,
            current_attempts: 2,
            failure_date: failure,
        });
        assert_eq!(
            action,
            DunningAction::Retry {
                next_retry_at: at(2025, 1, 29),
                attempt_number: 3,
                attempt_label: "Third retry",
            }
        );
        assert_eq!(action.subscription_status(), Some(SubscriptionStatus::PastDue));
        assert!(action.keeps_scheduler());
    }

    #[test]
    fn test_first_and_final_retry() {
        let policy = DunningPolicy::default();
        let failure = at(2025, 1, 1);

        match policy.decide(DunningInput {
            error: ErrorCode::InsufficientSpendingAllowance,
            current_attempts: 0,
            failure_date: failure,
        }) {
            DunningAction::Retry {
                next_retry_at,
                attempt_number,
                attempt_label,
            } => {
                assert_eq!(next_retry_at, at(2025, 1, 3));
                assert_eq!(attempt_number, 1);
                assert_eq!(attempt_label, "First retry");
            }
            other => panic!("expected retry, got {:?}", other),
        }

        match policy.decide(DunningInput {
            error: ErrorCode::InsufficientBalance,
            current_attempts: 3,
            failure_date: failure,
        }) {
            DunningAction::Retry {
                next_retry_at,
                attempt_number,
                attempt_label,
            } => {
                assert_eq!(next_retry_at, at(2025, 1, 22));
                assert_eq!(attempt_number, 4);
                assert_eq!(attempt_label, "Final retry");
            }
            other => panic!("expected retry, got {:?}", other),
        }
    }

    #[test]
    fn test_max_retries_exhausted() {
        let policy = DunningPolicy::default();
        let action = policy.decide(DunningInput {
            error: ErrorCode::InsufficientBalance,
            current_attempts: MAX_ATTEMPTS,
            failure_date: at(2025, 1, 15),
        });
        assert_eq!(action, DunningAction::MaxRetriesExhausted);
        assert_eq!(action.subscription_status(), Some(SubscriptionStatus::Unpaid));
        assert!(!action.keeps_scheduler());
    }

    #[test]
    fn test_upstream_keeps_scheduler() {
        let policy = DunningPolicy::default();
        let action = policy.decide(DunningInput {
            error: ErrorCode::UpstreamServiceError,
            current_attempts: 0,
            failure_date: at(2025, 1, 15),
        });
        assert_eq!(action, DunningAction::UpstreamError);
        assert_eq!(action.subscription_status(), None);
        assert!(action.keeps_scheduler());
        assert!(!action.creates_next_order());
    }

    #[test]
    fn test_user_operation_failed_no_next_order() {
        let policy = DunningPolicy::default();
        let action = policy.decide(DunningInput {
            error: ErrorCode::UserOperationFailed,
            current_attempts: 1,
            failure_date: at(2025, 1, 15),
        });
        assert_eq!(action, DunningAction::UserOperationFailed);
        assert!(!action.keeps_scheduler());
        assert!(!action.creates_next_order());
    }

    #[test]
    fn test_opaque_errors_advance_cycle() {
        let policy = DunningPolicy::default();
        for code in [
            ErrorCode::PaymentFailed,
            ErrorCode::GenericPermissionError,
            ErrorCode::UnknownPaymentError,
        ] {
            let action = policy.decide(DunningInput {
                error: code,
                current_attempts: 0,
                failure_date: at(2025, 1, 15),
            });
            assert_eq!(action, DunningAction::OtherError);
            assert!(action.creates_next_order());
            assert_eq!(action.subscription_status(), None);
        }
    }

    #[test]
    fn test_decide_is_pure() {
        let policy = DunningPolicy::default();
        let input = DunningInput {
            error: ErrorCode::InsufficientBalance,
            current_attempts: 1,
            failure_date: at(2025, 3, 1),
        };
        assert_eq!(policy.decide(input), policy.decide(input));
    }
}
