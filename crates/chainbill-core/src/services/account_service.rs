//! Account management: get-or-create on first authentication.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::info;

use crate::error::{Error, ErrorCode, Result};
use crate::models::Account;
use crate::store::Store;

/// Checksummed-or-lowercase 20-byte wallet address.
static WALLET_ADDRESS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^0x[0-9a-fA-F]{40}$").expect("valid regex"));

pub struct AccountService {
    store: Arc<dyn Store>,
}

impl AccountService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Find or create the account for a wallet address. Accounts are never
    /// destroyed by the engine.
    pub async fn get_or_create(
        &self,
        wallet_address: &str,
        cdp_user_id: Option<&str>,
    ) -> Result<Account> {
        if !WALLET_ADDRESS_RE.is_match(wallet_address) {
            return Err(Error::http(
                ErrorCode::InvalidFormat,
                "wallet address must be a 20-byte 0x-prefixed hex string",
            ));
        }

        let existed = self
            .store
            .get_account_by_address(wallet_address)
            .await?
            .is_some();
        let account = self
            .store
            .get_or_create_account(wallet_address, cdp_user_id)
            .await?;

        if !existed {
            info!(account_id = account.id, wallet_address, "account created");
        }

        Ok(account)
    }

    pub async fn get(&self, account_id: i64) -> Result<Option<Account>> {
        Ok(self.store.get_account(account_id).await?)
    }

    pub async fn get_by_address(&self, wallet_address: &str) -> Result<Option<Account>> {
        Ok(self.store.get_account_by_address(wallet_address).await?)
    }
}
