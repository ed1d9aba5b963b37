//! Merchant account, API key and webhook configuration models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Merchant account.
///
/// Created when the merchant first authenticates; never destroyed by the
/// engine. The wallet address doubles as the beneficiary of every
/// subscription the account registers.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Account {
    pub id: i64,
    /// Checksummed 20-byte wallet address
    pub wallet_address: String,
    /// External-auth user id, if the account was created via CDP login
    pub cdp_user_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// API key record.
///
/// Only the SHA-256 hash of the secret half is stored; the full secret is
/// returned exactly once at creation.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ApiKey {
    pub id: Uuid,
    pub account_id: i64,
    /// SHA-256 hex digest of the secret
    #[serde(skip_serializing)]
    pub key_hash: String,
    /// First characters of the secret, shown in listings
    pub start: String,
    pub name: Option<String>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Webhook endpoint configuration; at most one active record per account.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Webhook {
    pub account_id: i64,
    pub url: String,
    /// HMAC secret, `whsec_` + 64 hex chars
    #[serde(skip_serializing)]
    pub secret: String,
    pub enabled: bool,
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl Webhook {
    /// Deliverable = enabled and not soft-deleted.
    pub fn is_active(&self) -> bool {
        self.enabled && !self.deleted
    }
}
