//! Subscription provider abstraction
//!
//! A provider is the only component allowed to talk to a vendor SDK or API.
//! It exposes exactly four capabilities (validate, status, charge, revoke)
//! and translates every vendor failure into the domain error taxonomy before
//! it reaches the rest of the engine.

pub mod base;
pub mod mock;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorCode, Result};

pub use base::{BaseProvider, BaseProviderConfig};
pub use mock::MockProvider;

/// Seconds per day, used for the floor conversion of `period_in_days`.
const SECONDS_PER_DAY: f64 = 86_400.0;

/// On-chain permission status as reported by the provider's indexer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PermissionStatus {
    /// Whether the permission hash is known to the indexer at all.
    pub permission_exists: bool,
    /// Whether the permission is currently approved and unexpired.
    pub is_subscribed: bool,
    /// Wallet that granted the permission. Advisory only; the engine never
    /// enforces equality against the merchant wallet.
    pub subscription_owner: Option<String>,
    /// Charge still collectable in the current period, base units.
    pub remaining_charge_in_period: Option<String>,
    pub current_period_start: Option<DateTime<Utc>>,
    pub next_period_start: Option<DateTime<Utc>>,
    /// Recurring charge per period, base units.
    pub recurring_charge: Option<String>,
    pub period_in_days: Option<f64>,
}

impl PermissionStatus {
    /// Period length in integer seconds (floor), as persisted on orders.
    pub fn period_in_seconds(&self) -> Option<i64> {
        self.period_in_days.map(|days| (days * SECONDS_PER_DAY).floor() as i64)
    }
}

/// Charge request; `recipient` is always the subscription's beneficiary.
#[derive(Debug, Clone)]
pub struct ChargeRequest {
    pub subscription_id: String,
    /// Integer base units, stringified
    pub amount: String,
    pub recipient: String,
    pub testnet: bool,
}

/// Successful charge settlement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargeReceipt {
    pub transaction_hash: String,
    pub gas_used: Option<String>,
}

/// Successful on-chain revocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevokeReceipt {
    pub transaction_hash: String,
}

/// Provider capability set (C2).
#[async_trait]
pub trait SubscriptionProvider: Send + Sync {
    /// Stable tag stored on subscriptions ("base", ...).
    fn tag(&self) -> &str;

    /// Format check only, no network.
    fn validate_id(&self, id: &str) -> bool;

    async fn get_status(&self, subscription_id: &str, testnet: bool) -> Result<PermissionStatus>;

    /// Execute the charge. Failures carry a domain [`ErrorCode`]; no raw
    /// vendor error escapes.
    async fn charge(&self, request: ChargeRequest) -> Result<ChargeReceipt>;

    /// Revoke the permission on chain. Callers are expected to skip the call
    /// when `get_status` already reports `is_subscribed = false`.
    async fn revoke(&self, subscription_id: &str, testnet: bool) -> Result<RevokeReceipt>;
}

/// Providers keyed by tag.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn SubscriptionProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn SubscriptionProvider>) {
        self.providers.insert(provider.tag().to_string(), provider);
    }

    pub fn get(&self, tag: &str) -> Result<Arc<dyn SubscriptionProvider>> {
        self.providers.get(tag).cloned().ok_or_else(|| {
            Error::http(ErrorCode::InvalidRequest, format!("unknown provider: {}", tag))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_period_in_seconds_floors() {
        let status = PermissionStatus {
            period_in_days: Some(30.0),
            ..Default::default()
        };
        assert_eq!(status.period_in_seconds(), Some(2_592_000));

        let fractional = PermissionStatus {
            period_in_days: Some(0.5),
            ..Default::default()
        };
        assert_eq!(fractional.period_in_seconds(), Some(43_200));

        let sub_second = PermissionStatus {
            period_in_days: Some(1.0000001),
            ..Default::default()
        };
        // Floors, never rounds up
        assert_eq!(sub_second.period_in_seconds(), Some(86_400));

        assert_eq!(PermissionStatus::default().period_in_seconds(), None);
    }

    #[test]
    fn test_registry_unknown_tag() {
        let registry = ProviderRegistry::new();
        let err = registry.get("nope").err().unwrap();
        assert_eq!(err.error_code(), Some(ErrorCode::InvalidRequest));
    }
}
