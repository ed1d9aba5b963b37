//! Scriptable provider used by the lifecycle test suites.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{Error, ErrorCode, Result};
use crate::provider::{
    ChargeReceipt, ChargeRequest, PermissionStatus, RevokeReceipt, SubscriptionProvider,
};

/// A provider whose responses are queued up front. Charge outcomes are
/// consumed in FIFO order; when the queue is empty every charge succeeds with
/// a fresh hash.
pub struct MockProvider {
    tag: String,
    status: Mutex<PermissionStatus>,
    charge_outcomes: Mutex<VecDeque<Result<ChargeReceipt>>>,
    charge_calls: AtomicUsize,
    revoke_calls: AtomicUsize,
    last_charge: Mutex<Option<ChargeRequest>>,
}

impl MockProvider {
    pub fn new(status: PermissionStatus) -> Self {
        Self {
            tag: "base".to_string(),
            status: Mutex::new(status),
            charge_outcomes: Mutex::new(VecDeque::new()),
            charge_calls: AtomicUsize::new(0),
            revoke_calls: AtomicUsize::new(0),
            last_charge: Mutex::new(None),
        }
    }

    /// A healthy subscribed permission: 30-day period, 1 USDC recurring.
    pub fn subscribed() -> Self {
        Self::new(PermissionStatus {
            permission_exists: true,
            is_subscribed: true,
            subscription_owner: Some("0x00000000000000000000000000000000000000aa".to_string()),
            remaining_charge_in_period: Some("500000".to_string()),
            current_period_start: Some(chrono::Utc::now()),
            next_period_start: Some(chrono::Utc::now() + chrono::Duration::days(30)),
            recurring_charge: Some("1000000".to_string()),
            period_in_days: Some(30.0),
        })
    }

    pub fn set_status(&self, status: PermissionStatus) {
        *self.status.lock().unwrap() = status;
    }

    /// Queue the outcome of the next charge call.
    pub fn push_charge_ok(&self, transaction_hash: &str) {
        self.charge_outcomes.lock().unwrap().push_back(Ok(ChargeReceipt {
            transaction_hash: transaction_hash.to_string(),
            gas_used: Some("21000".to_string()),
        }));
    }

    /// Queue a charge failure with the given domain code.
    pub fn push_charge_err(&self, code: ErrorCode, message: &str) {
        self.charge_outcomes
            .lock()
            .unwrap()
            .push_back(Err(Error::http(code, message)));
    }

    pub fn charge_calls(&self) -> usize {
        self.charge_calls.load(Ordering::SeqCst)
    }

    pub fn revoke_calls(&self) -> usize {
        self.revoke_calls.load(Ordering::SeqCst)
    }

    pub fn last_charge(&self) -> Option<ChargeRequest> {
        self.last_charge.lock().unwrap().clone()
    }
}

#[async_trait]
impl SubscriptionProvider for MockProvider {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn validate_id(&self, id: &str) -> bool {
        id.starts_with("0x") && id.len() == 66 && id[2..].chars().all(|c| c.is_ascii_hexdigit())
    }

    async fn get_status(&self, _subscription_id: &str, _testnet: bool) -> Result<PermissionStatus> {
        Ok(self.status.lock().unwrap().clone())
    }

    async fn charge(&self, request: ChargeRequest) -> Result<ChargeReceipt> {
        self.charge_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_charge.lock().unwrap() = Some(request);

        match self.charge_outcomes.lock().unwrap().pop_front() {
            Some(outcome) => outcome,
            None => Ok(ChargeReceipt {
                transaction_hash: format!("0xmock{}", self.charge_calls()),
                gas_used: Some("21000".to_string()),
            }),
        }
    }

    async fn revoke(&self, _subscription_id: &str, _testnet: bool) -> Result<RevokeReceipt> {
        self.revoke_calls.fetch_add(1, Ordering::SeqCst);
        Ok(RevokeReceipt {
            transaction_hash: "0xrevoked".to_string(),
        })
    }
}
