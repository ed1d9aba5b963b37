//! Webhook endpoint management.
//!
//! One active webhook per account. Secrets are `whsec_` + hex(32 random
//! bytes), returned in full only at creation and rotation; reads expose an
//! 8-character preview.

use std::sync::Arc;

use chrono::Utc;
use rand::RngCore;
use tracing::info;
use url::Url;

use crate::config::{
    WebhookConfig, WEBHOOK_SECRET_BYTES, WEBHOOK_SECRET_PREFIX, WEBHOOK_SECRET_PREVIEW_CHARS,
};
use crate::error::{Error, ErrorCode, Result};
use crate::models::Webhook;
use crate::store::{StorageError, Store};

/// Creation/rotation response carrying the full secret, one time only.
#[derive(Debug, Clone)]
pub struct CreatedWebhook {
    pub url: String,
    pub secret: String,
}

/// A webhook as exposed on reads: secret reduced to a preview.
#[derive(Debug, Clone)]
pub struct WebhookView {
    pub url: String,
    pub secret_preview: String,
    pub enabled: bool,
    pub created_at: chrono::DateTime<Utc>,
    pub last_used_at: Option<chrono::DateTime<Utc>>,
}

pub struct WebhookService {
    store: Arc<dyn Store>,
    config: WebhookConfig,
}

impl WebhookService {
    pub fn new(store: Arc<dyn Store>, config: WebhookConfig) -> Self {
        Self { store, config }
    }

    fn generate_secret() -> String {
        let mut bytes = [0u8; WEBHOOK_SECRET_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        format!("{}{}", WEBHOOK_SECRET_PREFIX, hex::encode(bytes))
    }

    fn validate_url(&self, raw: &str) -> Result<()> {
        let url = Url::parse(raw)
            .map_err(|_| Error::http(ErrorCode::InvalidRequest, "invalid webhook url"))?;

        match url.scheme() {
            "https" => Ok(()),
            "http" if !self.config.require_https => Ok(()),
            _ => Err(Error::http(
                ErrorCode::InvalidRequest,
                "webhook url must use https",
            )),
        }
    }

    fn preview(secret: &str) -> String {
        let tail = secret.strip_prefix(WEBHOOK_SECRET_PREFIX).unwrap_or(secret);
        format!(
            "{}{}…",
            WEBHOOK_SECRET_PREFIX,
            &tail[..WEBHOOK_SECRET_PREVIEW_CHARS.min(tail.len())]
        )
    }

    /// Register the account's webhook. Fails with a conflict when an active
    /// one already exists (at most one per account).
    pub async fn create(&self, account_id: i64, url: &str) -> Result<CreatedWebhook> {
        self.validate_url(url)?;

        if self.store.get_webhook(account_id).await?.is_some() {
            return Err(Error::http(
                ErrorCode::InvalidRequest,
                "account already has a webhook; update or delete it first",
            ));
        }

        let secret = Self::generate_secret();
        self.store
            .upsert_webhook(Webhook {
                account_id,
                url: url.to_string(),
                secret: secret.clone(),
                enabled: true,
                deleted: false,
                created_at: Utc::now(),
                last_used_at: None,
            })
            .await?;

        info!(account_id, url, "webhook created");

        Ok(CreatedWebhook {
            url: url.to_string(),
            secret,
        })
    }

    pub async fn get(&self, account_id: i64) -> Result<Option<WebhookView>> {
        Ok(self.store.get_webhook(account_id).await?.map(|w| WebhookView {
            url: w.url,
            secret_preview: Self::preview(&w.secret),
            enabled: w.enabled,
            created_at: w.created_at,
            last_used_at: w.last_used_at,
        }))
    }

    pub async fn update_url(&self, account_id: i64, url: &str) -> Result<()> {
        self.validate_url(url)?;

        match self.store.update_webhook_url(account_id, url).await {
            Ok(()) => Ok(()),
            Err(StorageError::NotFound(_)) => {
                Err(Error::http(ErrorCode::NotFound, "webhook not found"))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Replace the secret; the new value is returned one time only.
    pub async fn rotate_secret(&self, account_id: i64) -> Result<CreatedWebhook> {
        let webhook = self
            .store
            .get_webhook(account_id)
            .await?
            .ok_or_else(|| Error::http(ErrorCode::NotFound, "webhook not found"))?;

        let secret = Self::generate_secret();
        self.store.rotate_webhook_secret(account_id, &secret).await?;

        info!(account_id, "webhook secret rotated");

        Ok(CreatedWebhook {
            url: webhook.url,
            secret,
        })
    }

    /// Soft delete; a later `create` resurrects the slot with a new secret.
    pub async fn delete(&self, account_id: i64) -> Result<()> {
        match self.store.delete_webhook(account_id).await {
            Ok(()) => Ok(()),
            Err(StorageError::NotFound(_)) => {
                Err(Error::http(ErrorCode::NotFound, "webhook not found"))
            }
            Err(err) => Err(err.into()),
        }
    }
}
