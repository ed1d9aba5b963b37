//! `subscription.updated` event payloads.
//!
//! Field names and shapes are wire contract; times are Unix seconds.

use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;
use crate::models::{Order, Subscription, SubscriptionStatus, Transaction};

pub const EVENT_TYPE: &str = "subscription.updated";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    /// Unix seconds at emission
    pub created_at: i64,
    pub data: WebhookEventData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEventData {
    pub subscription: SubscriptionEventData,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order: Option<OrderEventData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction: Option<TransactionEventData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorEventData>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionEventData {
    pub id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period_in_seconds: Option<i64>,
    /// Present (true) only for testnet subscriptions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub testnet: Option<bool>,
}

impl SubscriptionEventData {
    /// Build from the subscription plus the order carrying the cycle's
    /// amount and period; `status` is the status being announced.
    pub fn build(
        subscription: &Subscription,
        status: SubscriptionStatus,
        order: Option<&Order>,
    ) -> Self {
        Self {
            id: subscription.subscription_id.clone(),
            status: status.as_str().to_string(),
            amount: order.map(|o| o.amount.clone()),
            period_in_seconds: order.map(|o| o.period_length_in_seconds),
            testnet: subscription.testnet.then_some(true),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderEventData {
    pub number: i32,
    #[serde(rename = "type")]
    pub order_type: String,
    pub status: String,
    /// Unix seconds
    pub current_period_start: i64,
    /// Unix seconds
    pub current_period_end: i64,
    /// Unix seconds; present on retryable payment failures
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<i64>,
}

impl OrderEventData {
    pub fn build(order: &Order, next_retry_at: Option<i64>) -> Self {
        let start = order.due_at.timestamp();
        Self {
            number: order.order_number,
            order_type: order.order_type.as_str().to_string(),
            status: order.status.as_str().to_string(),
            current_period_start: start,
            current_period_end: start + order.period_length_in_seconds,
            next_retry_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionEventData {
    pub hash: String,
    pub amount: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gas_used: Option<String>,
}

impl From<&Transaction> for TransactionEventData {
    fn from(transaction: &Transaction) -> Self {
        Self {
            hash: transaction.transaction_hash.clone(),
            amount: transaction.amount.clone(),
            gas_used: transaction.gas_used.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEventData {
    pub code: String,
    pub message: String,
}

impl ErrorEventData {
    /// Payment-class errors are surfaced verbatim; everything else is
    /// replaced with a generic internal error before leaving the system.
    pub fn sanitized(code: ErrorCode, message: &str) -> Self {
        if code.is_exposable() {
            Self {
                code: code.as_str().to_string(),
                message: message.to_string(),
            }
        } else {
            Self {
                code: "internal_error".to_string(),
                message: "An internal error occurred".to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderStatus, OrderType};
    use chrono::{TimeZone, Utc};

    fn order() -> Order {
        Order {
            id: 1,
            subscription_id: "0xaa".repeat(32),
            order_number: 1,
            order_type: OrderType::Initial,
            due_at: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            amount: "500000".into(),
            period_length_in_seconds: 2_592_000,
            status: OrderStatus::Paid,
            attempts: 0,
            parent_order_id: None,
            next_retry_at: None,
            failure_reason: None,
            raw_error: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_order_period_derivation() {
        let data = OrderEventData::build(&order(), None);
        assert_eq!(data.current_period_start, 1_735_689_600);
        assert_eq!(data.current_period_end, 1_735_689_600 + 2_592_000);
        let json = serde_json::to_value(&data).unwrap();
        assert_eq!(json["type"], "initial");
        assert!(json.get("next_retry_at").is_none());
    }

    #[test]
    fn test_error_sanitization() {
        let exposed = ErrorEventData::sanitized(ErrorCode::InsufficientBalance, "no funds");
        assert_eq!(exposed.code, "INSUFFICIENT_BALANCE");
        assert_eq!(exposed.message, "no funds");

        let hidden = ErrorEventData::sanitized(ErrorCode::UpstreamServiceError, "bundler 503");
        assert_eq!(hidden.code, "internal_error");
        assert_eq!(hidden.message, "An internal error occurred");
    }

    #[test]
    fn test_testnet_flag_only_when_true() {
        let subscription = Subscription {
            subscription_id: "0xbb".repeat(32),
            status: SubscriptionStatus::Active,
            account_id: 1,
            beneficiary_address: "0xabc".into(),
            provider: "base".into(),
            testnet: false,
            created_at: Utc::now(),
            modified_at: Utc::now(),
        };
        let data = SubscriptionEventData::build(&subscription, SubscriptionStatus::Active, None);
        let json = serde_json::to_value(&data).unwrap();
        assert!(json.get("testnet").is_none());

        let testnet_sub = Subscription {
            testnet: true,
            ..subscription
        };
        let data = SubscriptionEventData::build(&testnet_sub, SubscriptionStatus::Active, None);
        let json = serde_json::to_value(&data).unwrap();
        assert_eq!(json["testnet"], true);
    }
}
