//! Order and transaction models
//!
//! An order is one scheduled charge attempt for one subscription cycle; a
//! transaction is its on-chain settlement record (at most one confirmed
//! transaction per order).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Order type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "order_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    /// Activation charge, created with the subscription
    Initial,
    /// Scheduled follow-on cycle
    Recurring,
    /// Dunning retry of a failed charge
    Retry,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Initial => "initial",
            OrderType::Recurring => "recurring",
            OrderType::Retry => "retry",
        }
    }
}

/// Order status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "order_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Scheduled, waiting for its due time
    Pending,
    /// Claimed by a processor
    Processing,
    /// Charge settled
    Paid,
    /// Charge failed
    Failed,
    /// Failed, dunning retry scheduled
    PendingRetry,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Processing => "processing",
            OrderStatus::Paid => "paid",
            OrderStatus::Failed => "failed",
            OrderStatus::PendingRetry => "pending_retry",
        }
    }

    /// At most one order per subscription may be in a non-terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Paid | OrderStatus::Failed)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order entity
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Order {
    pub id: i64,
    pub subscription_id: String,
    /// Sequential within the subscription, starting at 1, no gaps
    pub order_number: i32,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub order_type: OrderType,
    pub due_at: DateTime<Utc>,
    /// Stringified integer base units (USDC has 6 decimals)
    pub amount: String,
    pub period_length_in_seconds: i64,
    pub status: OrderStatus,
    /// Dunning attempts consumed so far
    pub attempts: i32,
    pub parent_order_id: Option<i64>,
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Domain error code of the last failure
    pub failure_reason: Option<String>,
    /// Raw provider message, debugging only, never exposed to merchants
    pub raw_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Transaction status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "transaction_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Confirmed,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Confirmed => "confirmed",
            TransactionStatus::Failed => "failed",
        }
    }
}

/// On-chain settlement record, keyed by order id
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Transaction {
    pub order_id: i64,
    /// May be shared across orders when the provider batches
    pub transaction_hash: String,
    pub subscription_id: String,
    pub amount: String,
    pub status: TransactionStatus,
    pub gas_used: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_status_terminal() {
        assert!(OrderStatus::Paid.is_terminal());
        assert!(OrderStatus::Failed.is_terminal());
        assert!(!OrderStatus::Pending.is_terminal());
        assert!(!OrderStatus::Processing.is_terminal());
        assert!(!OrderStatus::PendingRetry.is_terminal());
    }

    #[test]
    fn test_order_type_serde_rename() {
        let json = serde_json::to_value(OrderType::Initial).unwrap();
        assert_eq!(json, serde_json::json!("initial"));
    }
}
