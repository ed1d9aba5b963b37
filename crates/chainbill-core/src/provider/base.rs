//! "base" provider: wrapper over the spend-permission vendor API.
//!
//! All vendor error classification lives here. Charge failures are matched
//! against a table of message patterns and mapped to domain error codes, with
//! an explicit opaque fallback; transport-level failures (timeouts, 5xx)
//! become `UPSTREAM_SERVICE_ERROR`.

use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, ErrorCode, Result};
use crate::provider::{
    ChargeReceipt, ChargeRequest, PermissionStatus, RevokeReceipt, SubscriptionProvider,
};

/// 32-byte permission hash, 0x-prefixed.
static PERMISSION_HASH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^0x[0-9a-fA-F]{64}$").expect("valid regex"));

/// Vendor message fragment -> domain code, checked in order; first match wins.
const CHARGE_ERROR_PATTERNS: &[(&str, ErrorCode)] = &[
    ("transfer amount exceeds balance", ErrorCode::InsufficientBalance),
    ("insufficient balance", ErrorCode::InsufficientBalance),
    ("exceeds remaining spend", ErrorCode::InsufficientSpendingAllowance),
    ("exceeds spend permission", ErrorCode::InsufficientSpendingAllowance),
    ("insufficient allowance", ErrorCode::InsufficientSpendingAllowance),
    ("permission revoked", ErrorCode::PermissionRevoked),
    ("has been revoked", ErrorCode::PermissionRevoked),
    ("permission expired", ErrorCode::PermissionExpired),
    ("after permission end", ErrorCode::PermissionExpired),
    ("user operation reverted", ErrorCode::UserOperationFailed),
    ("useroperation reverted during simulation", ErrorCode::UserOperationFailed),
    ("spend permission", ErrorCode::GenericPermissionError),
];

/// Classify a vendor charge-error message.
fn map_charge_error(message: &str) -> ErrorCode {
    let lowered = message.to_lowercase();
    for (pattern, code) in CHARGE_ERROR_PATTERNS {
        if lowered.contains(pattern) {
            return *code;
        }
    }
    ErrorCode::UnknownPaymentError
}

/// Configuration for the vendor API client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaseProviderConfig {
    pub mainnet_url: String,
    pub testnet_url: String,
    pub api_key: String,
    pub request_timeout_secs: u64,
}

impl Default for BaseProviderConfig {
    fn default() -> Self {
        Self {
            mainnet_url: "https://api.spend-permissions.example/v1".to_string(),
            testnet_url: "https://api.testnet.spend-permissions.example/v1".to_string(),
            api_key: String::new(),
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Deserialize)]
struct VendorPermission {
    exists: bool,
    #[serde(default)]
    is_subscribed: bool,
    #[serde(default)]
    owner: Option<String>,
    #[serde(default)]
    remaining_charge_in_period: Option<String>,
    #[serde(default)]
    current_period_start: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    next_period_start: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    recurring_charge: Option<String>,
    #[serde(default)]
    period_in_days: Option<f64>,
}

#[derive(Debug, Serialize)]
struct VendorChargeBody<'a> {
    amount: &'a str,
    recipient: &'a str,
}

#[derive(Debug, Deserialize)]
struct VendorChargeResponse {
    transaction_hash: String,
    #[serde(default)]
    gas_used: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VendorRevokeResponse {
    transaction_hash: String,
}

#[derive(Debug, Deserialize)]
struct VendorErrorBody {
    #[serde(default)]
    message: String,
}

/// Spend-permission provider ("base" network family).
pub struct BaseProvider {
    client: reqwest::Client,
    config: BaseProviderConfig,
}

impl BaseProvider {
    pub fn new(config: BaseProviderConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .unwrap_or_default();

        Self { client, config }
    }

    fn base_url(&self, testnet: bool) -> &str {
        if testnet {
            &self.config.testnet_url
        } else {
            &self.config.mainnet_url
        }
    }

    async fn vendor_error(response: reqwest::Response) -> (u16, String) {
        let status = response.status().as_u16();
        let message = match response.json::<VendorErrorBody>().await {
            Ok(body) if !body.message.is_empty() => body.message,
            _ => "unknown vendor error".to_string(),
        };
        (status, message)
    }
}

#[async_trait]
impl SubscriptionProvider for BaseProvider {
    fn tag(&self) -> &str {
        "base"
    }

    fn validate_id(&self, id: &str) -> bool {
        PERMISSION_HASH_RE.is_match(id)
    }

    async fn get_status(&self, subscription_id: &str, testnet: bool) -> Result<PermissionStatus> {
        let url = format!("{}/permissions/{}", self.base_url(testnet), subscription_id);

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.config.api_key)
            .send()
            .await
            .map_err(|e| {
                Error::http(ErrorCode::UpstreamServiceError, format!("status lookup failed: {}", e))
            })?;

        if response.status().as_u16() == 404 {
            // Unknown to the indexer
            return Ok(PermissionStatus::default());
        }

        if !response.status().is_success() {
            let (status, message) = Self::vendor_error(response).await;
            warn!(status, %message, "permission status lookup failed");
            return Err(Error::http(
                ErrorCode::UpstreamServiceError,
                format!("indexer returned {}", status),
            ));
        }

        let permission: VendorPermission = response
            .json()
            .await
            .map_err(|e| Error::http(ErrorCode::UpstreamServiceError, e.to_string()))?;

        Ok(PermissionStatus {
            permission_exists: permission.exists,
            is_subscribed: permission.is_subscribed,
            subscription_owner: permission.owner,
            remaining_charge_in_period: permission.remaining_charge_in_period,
            current_period_start: permission.current_period_start,
            next_period_start: permission.next_period_start,
            recurring_charge: permission.recurring_charge,
            period_in_days: permission.period_in_days,
        })
    }

    async fn charge(&self, request: ChargeRequest) -> Result<ChargeReceipt> {
        let url = format!(
            "{}/permissions/{}/charge",
            self.base_url(request.testnet),
            request.subscription_id
        );

        debug!(
            subscription_id = %request.subscription_id,
            amount = %request.amount,
            "submitting charge"
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&VendorChargeBody {
                amount: &request.amount,
                recipient: &request.recipient,
            })
            .send()
            .await
            .map_err(|e| {
                // Connect errors and timeouts are infrastructure failures
                Error::http(ErrorCode::UpstreamServiceError, format!("charge request failed: {}", e))
            })?;

        let status = response.status();
        if status.is_success() {
            let receipt: VendorChargeResponse = response
                .json()
                .await
                .map_err(|e| Error::http(ErrorCode::UpstreamServiceError, e.to_string()))?;
            return Ok(ChargeReceipt {
                transaction_hash: receipt.transaction_hash,
                gas_used: receipt.gas_used,
            });
        }

        let (http_status, message) = Self::vendor_error(response).await;
        if http_status >= 500 {
            return Err(Error::http(
                ErrorCode::UpstreamServiceError,
                format!("bundler unavailable ({}): {}", http_status, message),
            ));
        }

        let code = map_charge_error(&message);
        Err(Error::http(code, message))
    }

    async fn revoke(&self, subscription_id: &str, testnet: bool) -> Result<RevokeReceipt> {
        let url = format!(
            "{}/permissions/{}/revoke",
            self.base_url(testnet),
            subscription_id
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .send()
            .await
            .map_err(|e| {
                Error::http(ErrorCode::UpstreamServiceError, format!("revoke request failed: {}", e))
            })?;

        if !response.status().is_success() {
            let (status, message) = Self::vendor_error(response).await;
            if status >= 500 {
                return Err(Error::http(
                    ErrorCode::UpstreamServiceError,
                    format!("bundler unavailable ({}): {}", status, message),
                ));
            }
            return Err(Error::http(map_charge_error(&message), message));
        }

        let receipt: VendorRevokeResponse = response
            .json()
            .await
            .map_err(|e| Error::http(ErrorCode::UpstreamServiceError, e.to_string()))?;

        Ok(RevokeReceipt {
            transaction_hash: receipt.transaction_hash,
        })
    }
}
