//! Transactional persistence for accounts, subscriptions, orders,
//! transactions and webhooks.
//!
//! All mutations go through the named operations on [`Store`]; ad-hoc writes
//! are forbidden. Multi-statement operations are atomic and enforce the data
//! model invariants (dense order numbers, single non-terminal order per
//! subscription, paid-implies-transaction).

pub mod memory;
pub mod migrate;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{
    Account, ApiKey, Order, OrderStatus, OrderType, Subscription, SubscriptionStatus, Transaction,
    TransactionStatus, Webhook,
};

pub use memory::MemoryStore;
pub use migrate::Migrator;
pub use postgres::{create_pool, PostgresStore};

/// Storage failure classes.
///
/// `Conflict` is semantic: a unique violation interpreted as "already
/// exists". `Transient` is retryable by the caller.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StorageError {
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("constraint violated: {0}")]
    Constraint(String),

    #[error("transient storage failure: {0}")]
    Transient(String),
}

impl From<sqlx::Error> for StorageError {
    fn from(error: sqlx::Error) -> Self {
        match &error {
            sqlx::Error::RowNotFound => StorageError::NotFound(error.to_string()),
            sqlx::Error::Database(db) => {
                if db.is_unique_violation() {
                    StorageError::Conflict(db.to_string())
                } else if db.is_foreign_key_violation() || db.is_check_violation() {
                    StorageError::Constraint(db.to_string())
                } else {
                    StorageError::Transient(db.to_string())
                }
            }
            _ => StorageError::Transient(error.to_string()),
        }
    }
}

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StorageError>;

/// A new order to insert; `order_number` is assigned by the store.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub order_type: OrderType,
    pub due_at: DateTime<Utc>,
    /// Integer base units, stringified
    pub amount: String,
    pub period_length_in_seconds: i64,
    pub status: OrderStatus,
    pub parent_order_id: Option<i64>,
}

/// A new settlement record.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub order_id: i64,
    pub transaction_hash: String,
    pub subscription_id: String,
    pub amount: String,
    pub status: TransactionStatus,
    pub gas_used: Option<String>,
}

/// Outcome of [`Store::create_subscription_with_order`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateSubscriptionOutcome {
    Created { order_id: i64, order_number: i32 },
    /// The subscription row already existed; nothing was written.
    AlreadyExists,
}

/// Parameters for the atomic activation commit.
#[derive(Debug, Clone)]
pub struct ActivationParams {
    pub subscription_id: String,
    pub order_id: i64,
    pub transaction: NewTransaction,
    /// Next cycle's order; absent when the provider reports no next period.
    pub next_order: Option<NewOrder>,
}

/// Parameters for the atomic success commit of a charged order.
#[derive(Debug, Clone)]
pub struct SuccessfulChargeParams {
    pub subscription_id: String,
    pub order_id: i64,
    /// None when a confirmed transaction already exists (idempotent replay).
    pub transaction: Option<NewTransaction>,
    /// Return the subscription to `active` (successful dunning retry).
    pub reactivate: bool,
    /// Candidate next-cycle order; inserted only when the subscription is
    /// left with no other open order.
    pub next_order: Option<NewOrder>,
}

/// Outcome of [`Store::record_successful_charge`].
#[derive(Debug, Clone)]
pub struct SuccessfulChargeOutcome {
    pub order_number: i32,
    /// `(id, order_number)` of the inserted next order, if any.
    pub next_order: Option<(i64, i32)>,
}

/// Targeted order mutation.
#[derive(Debug, Clone)]
pub struct OrderUpdate {
    pub id: i64,
    pub status: OrderStatus,
    pub failure_reason: Option<String>,
    pub raw_error: Option<String>,
}

/// Parameters for parking an order in `pending_retry`.
#[derive(Debug, Clone)]
pub struct RetryScheduling {
    pub order_id: i64,
    pub subscription_id: String,
    pub next_retry_at: DateTime<Utc>,
    pub failure_reason: String,
    pub raw_error: Option<String>,
}

/// An order together with the subscription-level fields the processor needs.
#[derive(Debug, Clone)]
pub struct OrderContext {
    pub order: Order,
    pub account_id: i64,
    pub beneficiary_address: String,
    pub provider: String,
    pub testnet: bool,
    pub subscription_status: SubscriptionStatus,
}

/// Fields accepted by [`Store::update_api_key`].
#[derive(Debug, Clone, Default)]
pub struct ApiKeyUpdate {
    pub name: Option<String>,
    pub enabled: Option<bool>,
}

/// Store contract (C1). Implementations: [`PostgresStore`], [`MemoryStore`].
#[async_trait]
pub trait Store: Send + Sync {
    // --- Subscription/order lifecycle ---

    /// Atomically insert a subscription in `processing` plus its first order
    /// at `order_number = 1`. Returns [`CreateSubscriptionOutcome::AlreadyExists`]
    /// on conflict, without side effects.
    async fn create_subscription_with_order(
        &self,
        subscription_id: &str,
        account_id: i64,
        beneficiary_address: &str,
        provider: &str,
        testnet: bool,
        order: NewOrder,
    ) -> StoreResult<CreateSubscriptionOutcome>;

    /// Atomic activation commit: insert the confirmed transaction, mark the
    /// activation order paid, insert the next order (when given) at
    /// `max(order_number) + 1`, and flip the subscription to `active`.
    /// Returns the next order's id, if one was created.
    async fn execute_subscription_activation(
        &self,
        params: ActivationParams,
    ) -> StoreResult<Option<i64>>;

    /// Atomically mark the subscription `incomplete` and its activation
    /// order `failed` with the given reason.
    async fn mark_subscription_incomplete(
        &self,
        subscription_id: &str,
        order_id: i64,
        reason: &str,
    ) -> StoreResult<()>;

    /// Claim up to `limit` due pending orders of active subscriptions,
    /// transitioning them to `processing`. Linearizable: a row is never
    /// handed to two concurrent claimers.
    async fn claim_due_orders(&self, limit: i64) -> StoreResult<Vec<OrderContext>>;

    /// CAS-claim a single order (`pending`/`pending_retry` -> `processing`).
    /// Returns false when the order is not claimable, e.g. already claimed by
    /// a concurrent firing.
    async fn claim_order(&self, order_id: i64) -> StoreResult<bool>;

    /// Insert a settlement record.
    async fn record_transaction(&self, transaction: NewTransaction) -> StoreResult<()>;

    /// Atomic success commit for a charged order: insert the settlement
    /// (unless already recorded), mark the order paid, optionally return the
    /// subscription to `active`, and insert the next cycle's order when no
    /// other open order remains. One transaction; partial states are never
    /// visible.
    async fn record_successful_charge(
        &self,
        params: SuccessfulChargeParams,
    ) -> StoreResult<SuccessfulChargeOutcome>;

    /// Update an order's status/failure fields; returns its order number.
    async fn update_order(&self, update: OrderUpdate) -> StoreResult<i32>;

    /// Update a subscription's status, bumping `modified_at`.
    async fn update_subscription_status(
        &self,
        subscription_id: &str,
        status: SubscriptionStatus,
    ) -> StoreResult<()>;

    /// Park an order in `pending_retry`: bump `attempts`, set
    /// `next_retry_at`, keep the row in place.
    async fn schedule_retry(&self, params: RetryScheduling) -> StoreResult<()>;

    /// On successful retry of a failed order, return the subscription to
    /// `active`.
    async fn reactivate_subscription(
        &self,
        order_id: i64,
        subscription_id: &str,
    ) -> StoreResult<()>;

    /// Insert a follow-on order at `max(order_number) + 1`.
    async fn create_order(&self, subscription_id: &str, order: NewOrder)
        -> StoreResult<(i64, i32)>;

    /// Mark all non-terminal orders of a subscription `failed` with reason
    /// "Subscription canceled"; returns the affected ids so the caller can
    /// delete their timers.
    async fn cancel_pending_orders(&self, subscription_id: &str) -> StoreResult<Vec<i64>>;

    /// Set the subscription `canceled`.
    async fn cancel_subscription(&self, subscription_id: &str) -> StoreResult<()>;

    // --- Reads ---

    async fn get_subscription(&self, subscription_id: &str) -> StoreResult<Option<Subscription>>;

    async fn get_subscription_orders(&self, subscription_id: &str) -> StoreResult<Vec<Order>>;

    async fn list_subscriptions(
        &self,
        account_id: i64,
        testnet: Option<bool>,
    ) -> StoreResult<Vec<Subscription>>;

    async fn get_order(&self, order_id: i64) -> StoreResult<Option<Order>>;

    /// Order plus the subscription-level fields the processor needs.
    async fn get_order_details(&self, order_id: i64) -> StoreResult<Option<OrderContext>>;

    /// The confirmed transaction for an order, if any (idempotency check).
    async fn get_successful_transaction(
        &self,
        subscription_id: &str,
        order_id: i64,
    ) -> StoreResult<Option<Transaction>>;

    // --- Accounts ---

    /// Find by wallet address, creating the account on first sight.
    async fn get_or_create_account(
        &self,
        wallet_address: &str,
        cdp_user_id: Option<&str>,
    ) -> StoreResult<Account>;

    async fn get_account(&self, account_id: i64) -> StoreResult<Option<Account>>;

    async fn get_account_by_address(&self, wallet_address: &str) -> StoreResult<Option<Account>>;

    // --- API keys ---

    async fn insert_api_key(&self, key: ApiKey) -> StoreResult<()>;

    async fn find_api_key_by_hash(&self, key_hash: &str) -> StoreResult<Option<ApiKey>>;

    async fn list_api_keys(&self, account_id: i64) -> StoreResult<Vec<ApiKey>>;

    async fn update_api_key(
        &self,
        account_id: i64,
        key_id: Uuid,
        update: ApiKeyUpdate,
    ) -> StoreResult<ApiKey>;

    async fn delete_api_key(&self, account_id: i64, key_id: Uuid) -> StoreResult<()>;

    async fn touch_api_key(&self, key_id: Uuid) -> StoreResult<()>;

    // --- Webhooks ---

    /// Insert or resurrect the account's webhook record.
    async fn upsert_webhook(&self, webhook: Webhook) -> StoreResult<()>;

    /// The account's webhook, soft-deleted records excluded.
    async fn get_webhook(&self, account_id: i64) -> StoreResult<Option<Webhook>>;

    async fn update_webhook_url(&self, account_id: i64, url: &str) -> StoreResult<()>;

    async fn rotate_webhook_secret(&self, account_id: i64, secret: &str) -> StoreResult<()>;

    /// Soft delete.
    async fn delete_webhook(&self, account_id: i64) -> StoreResult<()>;

    async fn touch_webhook(&self, account_id: i64) -> StoreResult<()>;
}
