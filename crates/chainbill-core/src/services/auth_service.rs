//! CDP JWT validation.
//!
//! Validation is opaque to the engine: signature, expiry and issuer/audience
//! checks via `jsonwebtoken`, yielding the external user id and (when the
//! token carries one) the wallet address. Authentication upserts the
//! merchant account.

use std::sync::Arc;

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;

use crate::config::AuthConfig;
use crate::error::{Error, ErrorCode, Result};
use crate::models::Account;
use crate::services::AccountService;

/// Claims the engine consumes from a validated CDP token.
#[derive(Debug, Clone, Deserialize)]
pub struct CdpClaims {
    /// External user id (`sub`)
    #[serde(rename = "sub")]
    pub cdp_user_id: String,
    /// Wallet address, when the token carries one
    #[serde(default)]
    pub account_address: Option<String>,
    #[allow(dead_code)]
    exp: usize,
}

pub struct CdpAuthService {
    config: AuthConfig,
    accounts: Arc<AccountService>,
}

impl CdpAuthService {
    pub fn new(config: AuthConfig, accounts: Arc<AccountService>) -> Self {
        Self { config, accounts }
    }

    /// Validate a CDP JWT and return its claims.
    pub fn validate(&self, jwt: &str) -> Result<CdpClaims> {
        if self.config.cdp_public_key_pem.is_empty() {
            return Err(Error::config("CDP JWT validation is not configured"));
        }

        let key = DecodingKey::from_ec_pem(self.config.cdp_public_key_pem.as_bytes())
            .map_err(|e| Error::config(format!("invalid CDP public key: {}", e)))?;

        let mut validation = Validation::new(Algorithm::ES256);
        validation.set_issuer(&[&self.config.cdp_issuer]);
        match &self.config.cdp_audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }

        let token = decode::<CdpClaims>(jwt, &key, &validation)
            .map_err(|e| Error::http(ErrorCode::InvalidApiKey, format!("invalid token: {}", e)))?;

        Ok(token.claims)
    }

    /// Validate the token and resolve (or create) the merchant account.
    /// Tokens without a wallet address authenticate but cannot own
    /// subscriptions yet.
    pub async fn authenticate(&self, jwt: &str) -> Result<(CdpClaims, Option<Account>)> {
        let claims = self.validate(jwt)?;

        let account = match &claims.account_address {
            Some(address) => Some(
                self.accounts
                    .get_or_create(address, Some(&claims.cdp_user_id))
                    .await?,
            ),
            None => None,
        };

        Ok((claims, account))
    }
}
