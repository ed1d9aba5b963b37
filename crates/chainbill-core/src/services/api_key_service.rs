//! API key management.
//!
//! Keys are `ck_` + 64 hex chars of secret. Only the SHA-256 hash of the
//! secret is stored; the full key is returned exactly once at creation,
//! listings show the `start` preview.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::info;
use uuid::Uuid;

use crate::config::{API_KEY_NAME_MAX_LENGTH, API_KEY_PREFIX, API_KEY_START_CHARS};
use crate::error::{Error, ErrorCode, Result};
use crate::models::ApiKey;
use crate::store::{ApiKeyUpdate, StorageError, Store};

/// Creation response; `api_key` is shown once and never recoverable.
#[derive(Debug, Clone)]
pub struct CreatedApiKey {
    pub id: Uuid,
    pub api_key: String,
    pub name: Option<String>,
    pub prefix: &'static str,
    pub start: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

pub struct ApiKeyService {
    store: Arc<dyn Store>,
}

impl ApiKeyService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    fn hash_secret(secret: &str) -> String {
        hex::encode(Sha256::digest(secret.as_bytes()))
    }

    fn generate_secret() -> String {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    /// Mint a key for an account.
    pub async fn create(&self, account_id: i64, name: Option<String>) -> Result<CreatedApiKey> {
        if let Some(name) = &name {
            if name.is_empty() || name.len() > API_KEY_NAME_MAX_LENGTH {
                return Err(Error::http(
                    ErrorCode::InvalidRequest,
                    format!("name must be 1..={} characters", API_KEY_NAME_MAX_LENGTH),
                ));
            }
        }

        let secret = Self::generate_secret();
        let start = secret[..API_KEY_START_CHARS].to_string();
        let record = ApiKey {
            id: Uuid::new_v4(),
            account_id,
            key_hash: Self::hash_secret(&secret),
            start: start.clone(),
            name: name.clone(),
            enabled: true,
            created_at: Utc::now(),
            last_used_at: None,
        };

        self.store.insert_api_key(record.clone()).await?;

        info!(account_id, key_id = %record.id, "api key created");

        Ok(CreatedApiKey {
            id: record.id,
            api_key: format!("{}{}", API_KEY_PREFIX, secret),
            name,
            prefix: API_KEY_PREFIX,
            start,
            enabled: true,
            created_at: record.created_at,
        })
    }

    /// Resolve a presented key to its record; touches `last_used_at`.
    pub async fn verify(&self, presented: &str) -> Result<ApiKey> {
        let secret = presented
            .strip_prefix(API_KEY_PREFIX)
            .ok_or_else(|| Error::http(ErrorCode::InvalidApiKey, "malformed api key"))?;

        let record = self
            .store
            .find_api_key_by_hash(&Self::hash_secret(secret))
            .await?
            .filter(|key| key.enabled)
            .ok_or_else(|| Error::http(ErrorCode::InvalidApiKey, "unknown or disabled api key"))?;

        self.store.touch_api_key(record.id).await.ok();

        Ok(record)
    }

    pub async fn list(&self, account_id: i64) -> Result<Vec<ApiKey>> {
        Ok(self.store.list_api_keys(account_id).await?)
    }

    pub async fn update(
        &self,
        account_id: i64,
        key_id: Uuid,
        name: Option<String>,
        enabled: Option<bool>,
    ) -> Result<ApiKey> {
        if let Some(name) = &name {
            if name.is_empty() || name.len() > API_KEY_NAME_MAX_LENGTH {
                return Err(Error::http(
                    ErrorCode::InvalidRequest,
                    format!("name must be 1..={} characters", API_KEY_NAME_MAX_LENGTH),
                ));
            }
        }

        match self
            .store
            .update_api_key(account_id, key_id, ApiKeyUpdate { name, enabled })
            .await
        {
            Ok(key) => Ok(key),
            Err(StorageError::NotFound(_)) => {
                Err(Error::http(ErrorCode::NotFound, "api key not found"))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn delete(&self, account_id: i64, key_id: Uuid) -> Result<()> {
        match self.store.delete_api_key(account_id, key_id).await {
            Ok(()) => Ok(()),
            Err(StorageError::NotFound(_)) => {
                Err(Error::http(ErrorCode::NotFound, "api key not found"))
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn service() -> ApiKeyService {
        ApiKeyService::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_create_and_verify() {
        let service = service();
        let created = service.create(1, Some("ci".into())).await.unwrap();

        assert!(created.api_key.starts_with("ck_"));
        assert_eq!(created.api_key.len(), 3 + 64);
        assert_eq!(created.start.len(), 6);
        assert!(created.api_key[3..].starts_with(&created.start));

        let verified = service.verify(&created.api_key).await.unwrap();
        assert_eq!(verified.id, created.id);
        assert_eq!(verified.account_id, 1);
        assert!(verified.last_used_at.is_none()); // touched after the read
    }

    #[tokio::test]
    async fn test_verify_rejects_bad_keys() {
        let service = service();
        let created = service.create(1, None).await.unwrap();

        assert!(service.verify("sk_wrongprefix").await.is_err());
        assert!(service.verify("ck_0000000000").await.is_err());

        // Disabled keys stop verifying
        service
            .update(1, created.id, None, Some(false))
            .await
            .unwrap();
        let err = service.verify(&created.api_key).await.unwrap_err();
        assert_eq!(err.error_code(), Some(ErrorCode::InvalidApiKey));
    }

    #[tokio::test]
    async fn test_listing_never_exposes_secret() {
        let service = service();
        let created = service.create(7, Some("dashboard".into())).await.unwrap();

        let listed = service.list(7).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].start, created.start);
        // Only the hash is stored
        assert_ne!(listed[0].key_hash, created.api_key);
        assert!(!created.api_key.contains(&listed[0].key_hash));
    }

    #[tokio::test]
    async fn test_name_length_limit() {
        let service = service();
        let long = "x".repeat(33);
        let err = service.create(1, Some(long)).await.unwrap_err();
        assert_eq!(err.error_code(), Some(ErrorCode::InvalidRequest));
    }

    #[tokio::test]
    async fn test_delete_requires_ownership() {
        let service = service();
        let created = service.create(1, None).await.unwrap();

        let err = service.delete(2, created.id).await.unwrap_err();
        assert_eq!(err.error_code(), Some(ErrorCode::NotFound));

        service.delete(1, created.id).await.unwrap();
        assert!(service.list(1).await.unwrap().is_empty());
    }
}
