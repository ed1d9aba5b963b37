//! Subscription model
//!
//! A subscription is keyed by the 32-byte on-chain permission hash and tracks
//! the lifecycle of recurring charges against that permission.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Subscription status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "subscription_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// Created, activation charge not yet settled
    Processing,
    /// Active and billing
    Active,
    /// Payment failed, dunning retries in progress
    PastDue,
    /// All dunning retries exhausted
    Unpaid,
    /// Revoked by the merchant or terminated by a terminal payment error
    Canceled,
    /// Activation charge failed
    Incomplete,
}

impl Default for SubscriptionStatus {
    fn default() -> Self {
        SubscriptionStatus::Processing
    }
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Processing => "processing",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Unpaid => "unpaid",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Incomplete => "incomplete",
        }
    }

    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Canceled | SubscriptionStatus::Unpaid | SubscriptionStatus::Incomplete
        )
    }

    /// States in which an order may be charged.
    pub fn is_billable(&self) -> bool {
        matches!(self, SubscriptionStatus::Active | SubscriptionStatus::PastDue)
    }

    /// States from which the merchant may revoke.
    pub fn is_revocable(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Processing
                | SubscriptionStatus::Active
                | SubscriptionStatus::PastDue
                | SubscriptionStatus::Incomplete
        )
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subscription entity
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Subscription {
    /// 32-byte permission hash, `0x`-prefixed hex
    pub subscription_id: String,
    pub status: SubscriptionStatus,
    /// Owning merchant account (webhook routing)
    pub account_id: i64,
    /// Payee wallet; always the merchant's own account address
    pub beneficiary_address: String,
    /// Provider tag ("base", ...)
    pub provider: String,
    pub testnet: bool,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classes() {
        assert!(SubscriptionStatus::Canceled.is_terminal());
        assert!(SubscriptionStatus::Unpaid.is_terminal());
        assert!(SubscriptionStatus::Incomplete.is_terminal());
        assert!(!SubscriptionStatus::PastDue.is_terminal());

        assert!(SubscriptionStatus::Active.is_billable());
        assert!(SubscriptionStatus::PastDue.is_billable());
        assert!(!SubscriptionStatus::Processing.is_billable());

        assert!(SubscriptionStatus::Processing.is_revocable());
        assert!(SubscriptionStatus::Incomplete.is_revocable());
        assert!(!SubscriptionStatus::Unpaid.is_revocable());
        assert!(!SubscriptionStatus::Canceled.is_revocable());
    }
}
