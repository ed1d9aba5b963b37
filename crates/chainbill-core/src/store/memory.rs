//! In-memory store
//!
//! Implements the full store contract over mutex-guarded maps, backing the
//! lifecycle test suite. Semantics mirror [`super::PostgresStore`], including conflict
//! detection and the claim semantics of `claim_due_orders` (the whole
//! operation runs under one lock, so no row is handed out twice).

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::models::{
    Account, ApiKey, Order, OrderStatus, Subscription, SubscriptionStatus, Transaction, Webhook,
};
use crate::store::{
    ActivationParams, ApiKeyUpdate, CreateSubscriptionOutcome, NewOrder, NewTransaction,
    OrderContext, OrderUpdate, RetryScheduling, StorageError, Store, StoreResult,
    SuccessfulChargeOutcome, SuccessfulChargeParams,
};

#[derive(Default)]
struct Inner {
    accounts: HashMap<i64, Account>,
    next_account_id: i64,
    api_keys: HashMap<Uuid, ApiKey>,
    webhooks: HashMap<i64, Webhook>,
    subscriptions: HashMap<String, Subscription>,
    orders: HashMap<i64, Order>,
    next_order_id: i64,
    transactions: HashMap<i64, Transaction>,
}

impl Inner {
    fn next_order_number(&self, subscription_id: &str) -> i32 {
        self.orders
            .values()
            .filter(|o| o.subscription_id == subscription_id)
            .map(|o| o.order_number)
            .max()
            .unwrap_or(0)
            + 1
    }

    fn insert_order(&mut self, subscription_id: &str, order: &NewOrder) -> (i64, i32) {
        self.next_order_id += 1;
        let id = self.next_order_id;
        let order_number = self.next_order_number(subscription_id);
        self.orders.insert(
            id,
            Order {
                id,
                subscription_id: subscription_id.to_string(),
                order_number,
                order_type: order.order_type,
                due_at: order.due_at,
                amount: order.amount.clone(),
                period_length_in_seconds: order.period_length_in_seconds,
                status: order.status,
                attempts: 0,
                parent_order_id: order.parent_order_id,
                next_retry_at: None,
                failure_reason: None,
                raw_error: None,
                created_at: Utc::now(),
            },
        );
        (id, order_number)
    }

    fn insert_transaction(&mut self, transaction: &NewTransaction) -> StoreResult<()> {
        if self.transactions.contains_key(&transaction.order_id) {
            return Err(StorageError::Conflict(format!(
                "transaction for order {} already exists",
                transaction.order_id
            )));
        }
        self.transactions.insert(
            transaction.order_id,
            Transaction {
                order_id: transaction.order_id,
                transaction_hash: transaction.transaction_hash.clone(),
                subscription_id: transaction.subscription_id.clone(),
                amount: transaction.amount.clone(),
                status: transaction.status,
                gas_used: transaction.gas_used.clone(),
                created_at: Utc::now(),
            },
        );
        Ok(())
    }

    fn set_subscription_status(
        &mut self,
        subscription_id: &str,
        status: SubscriptionStatus,
    ) -> StoreResult<()> {
        let subscription = self.subscriptions.get_mut(subscription_id).ok_or_else(|| {
            StorageError::NotFound(format!("subscription {} not found", subscription_id))
        })?;
        subscription.status = status;
        subscription.modified_at = Utc::now();
        Ok(())
    }

    fn order_context(&self, order: &Order) -> Option<OrderContext> {
        self.subscriptions
            .get(&order.subscription_id)
            .map(|s| OrderContext {
                order: order.clone(),
                account_id: s.account_id,
                beneficiary_address: s.beneficiary_address.clone(),
                provider: s.provider.clone(),
                testnet: s.testnet,
                subscription_status: s.status,
            })
    }
}

/// In-memory store
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_subscription_with_order(
        &self,
        subscription_id: &str,
        account_id: i64,
        beneficiary_address: &str,
        provider: &str,
        testnet: bool,
        order: NewOrder,
    ) -> StoreResult<CreateSubscriptionOutcome> {
        let mut inner = self.inner.lock().unwrap();

        if inner.subscriptions.contains_key(subscription_id) {
            return Ok(CreateSubscriptionOutcome::AlreadyExists);
        }

        let now = Utc::now();
        inner.subscriptions.insert(
            subscription_id.to_string(),
            Subscription {
                subscription_id: subscription_id.to_string(),
                status: SubscriptionStatus::Processing,
                account_id,
                beneficiary_address: beneficiary_address.to_string(),
                provider: provider.to_string(),
                testnet,
                created_at: now,
                modified_at: now,
            },
        );

        let (order_id, order_number) = inner.insert_order(subscription_id, &order);

        Ok(CreateSubscriptionOutcome::Created {
            order_id,
            order_number,
        })
    }

    async fn execute_subscription_activation(
        &self,
        params: ActivationParams,
    ) -> StoreResult<Option<i64>> {
        let mut inner = self.inner.lock().unwrap();

        inner.insert_transaction(&params.transaction)?;

        let order = inner
            .orders
            .get_mut(&params.order_id)
            .ok_or_else(|| StorageError::NotFound(format!("order {} not found", params.order_id)))?;
        order.status = OrderStatus::Paid;

        let next_order_id = params
            .next_order
            .as_ref()
            .map(|next| inner.insert_order(&params.subscription_id, next).0);

        inner.set_subscription_status(&params.subscription_id, SubscriptionStatus::Active)?;

        Ok(next_order_id)
    }

    async fn mark_subscription_incomplete(
        &self,
        subscription_id: &str,
        order_id: i64,
        reason: &str,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();

        inner.set_subscription_status(subscription_id, SubscriptionStatus::Incomplete)?;

        if let Some(order) = inner.orders.get_mut(&order_id) {
            order.status = OrderStatus::Failed;
            order.failure_reason = Some(reason.to_string());
        }

        Ok(())
    }

    async fn claim_due_orders(&self, limit: i64) -> StoreResult<Vec<OrderContext>> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();

        let mut due: Vec<i64> = inner
            .orders
            .values()
            .filter(|o| o.status == OrderStatus::Pending && o.due_at <= now)
            .filter(|o| {
                inner
                    .subscriptions
                    .get(&o.subscription_id)
                    .map(|s| s.status == SubscriptionStatus::Active)
                    .unwrap_or(false)
            })
            .map(|o| o.id)
            .collect();
        due.sort_by_key(|id| inner.orders[id].due_at);
        due.truncate(limit.max(0) as usize);

        let mut contexts = Vec::with_capacity(due.len());
        for id in due {
            if let Some(order) = inner.orders.get_mut(&id) {
                order.status = OrderStatus::Processing;
            }
            let order = inner.orders[&id].clone();
            if let Some(context) = inner.order_context(&order) {
                contexts.push(context);
            }
        }

        Ok(contexts)
    }

    async fn claim_order(&self, order_id: i64) -> StoreResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        match inner.orders.get_mut(&order_id) {
            Some(order)
                if matches!(order.status, OrderStatus::Pending | OrderStatus::PendingRetry) =>
            {
                order.status = OrderStatus::Processing;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_transaction(&self, transaction: NewTransaction) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.insert_transaction(&transaction)
    }

    async fn record_successful_charge(
        &self,
        params: SuccessfulChargeParams,
    ) -> StoreResult<SuccessfulChargeOutcome> {
        let mut inner = self.inner.lock().unwrap();

        // Validate everything up front; a failure must leave no partial state.
        if !inner.orders.contains_key(&params.order_id) {
            return Err(StorageError::NotFound(format!(
                "order {} not found",
                params.order_id
            )));
        }
        if params.reactivate && !inner.subscriptions.contains_key(&params.subscription_id) {
            return Err(StorageError::NotFound(format!(
                "subscription {} not found",
                params.subscription_id
            )));
        }
        if let Some(transaction) = &params.transaction {
            if inner.transactions.contains_key(&transaction.order_id) {
                return Err(StorageError::Conflict(format!(
                    "transaction for order {} already exists",
                    transaction.order_id
                )));
            }
        }

        if let Some(transaction) = &params.transaction {
            inner.insert_transaction(transaction)?;
        }

        let order = inner.orders.get_mut(&params.order_id).ok_or_else(|| {
            StorageError::NotFound(format!("order {} not found", params.order_id))
        })?;
        order.status = OrderStatus::Paid;
        let order_number = order.order_number;

        if params.reactivate {
            inner.set_subscription_status(&params.subscription_id, SubscriptionStatus::Active)?;
        }

        let next_order = match &params.next_order {
            Some(next) => {
                let open = inner
                    .orders
                    .values()
                    .any(|o| o.subscription_id == params.subscription_id && !o.status.is_terminal());
                if open {
                    None
                } else {
                    Some(inner.insert_order(&params.subscription_id, next))
                }
            }
            None => None,
        };

        Ok(SuccessfulChargeOutcome {
            order_number,
            next_order,
        })
    }

    async fn update_order(&self, update: OrderUpdate) -> StoreResult<i32> {
        let mut inner = self.inner.lock().unwrap();

        let order = inner
            .orders
            .get_mut(&update.id)
            .ok_or_else(|| StorageError::NotFound(format!("order {} not found", update.id)))?;

        order.status = update.status;
        if update.failure_reason.is_some() {
            order.failure_reason = update.failure_reason;
        }
        if update.raw_error.is_some() {
            order.raw_error = update.raw_error;
        }

        Ok(order.order_number)
    }

    async fn update_subscription_status(
        &self,
        subscription_id: &str,
        status: SubscriptionStatus,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.set_subscription_status(subscription_id, status)
    }

    async fn schedule_retry(&self, params: RetryScheduling) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();

        let order = inner.orders.get_mut(&params.order_id).ok_or_else(|| {
            StorageError::NotFound(format!("order {} not found", params.order_id))
        })?;
        order.status = OrderStatus::PendingRetry;
        order.attempts += 1;
        order.next_retry_at = Some(params.next_retry_at);
        order.failure_reason = Some(params.failure_reason.clone());
        if params.raw_error.is_some() {
            order.raw_error = params.raw_error.clone();
        }

        inner.set_subscription_status(&params.subscription_id, SubscriptionStatus::PastDue)
    }

    async fn reactivate_subscription(
        &self,
        _order_id: i64,
        subscription_id: &str,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.set_subscription_status(subscription_id, SubscriptionStatus::Active)
    }

    async fn create_order(
        &self,
        subscription_id: &str,
        order: NewOrder,
    ) -> StoreResult<(i64, i32)> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.subscriptions.contains_key(subscription_id) {
            return Err(StorageError::Constraint(format!(
                "subscription {} not found",
                subscription_id
            )));
        }
        Ok(inner.insert_order(subscription_id, &order))
    }

    async fn cancel_pending_orders(&self, subscription_id: &str) -> StoreResult<Vec<i64>> {
        let mut inner = self.inner.lock().unwrap();

        let mut canceled = Vec::new();
        for order in inner.orders.values_mut() {
            if order.subscription_id == subscription_id && !order.status.is_terminal() {
                order.status = OrderStatus::Failed;
                order.failure_reason = Some("Subscription canceled".to_string());
                canceled.push(order.id);
            }
        }
        canceled.sort_unstable();

        Ok(canceled)
    }

    async fn cancel_subscription(&self, subscription_id: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.set_subscription_status(subscription_id, SubscriptionStatus::Canceled)
    }

    async fn get_subscription(&self, subscription_id: &str) -> StoreResult<Option<Subscription>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.subscriptions.get(subscription_id).cloned())
    }

    async fn get_subscription_orders(&self, subscription_id: &str) -> StoreResult<Vec<Order>> {
        let inner = self.inner.lock().unwrap();
        let mut orders: Vec<Order> = inner
            .orders
            .values()
            .filter(|o| o.subscription_id == subscription_id)
            .cloned()
            .collect();
        orders.sort_by_key(|o| o.order_number);
        Ok(orders)
    }

    async fn list_subscriptions(
        &self,
        account_id: i64,
        testnet: Option<bool>,
    ) -> StoreResult<Vec<Subscription>> {
        let inner = self.inner.lock().unwrap();
        let mut subscriptions: Vec<Subscription> = inner
            .subscriptions
            .values()
            .filter(|s| s.account_id == account_id)
            .filter(|s| testnet.map(|t| s.testnet == t).unwrap_or(true))
            .cloned()
            .collect();
        subscriptions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(subscriptions)
    }

    async fn get_order(&self, order_id: i64) -> StoreResult<Option<Order>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.orders.get(&order_id).cloned())
    }

    async fn get_order_details(&self, order_id: i64) -> StoreResult<Option<OrderContext>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .orders
            .get(&order_id)
            .and_then(|o| inner.order_context(o)))
    }

    async fn get_successful_transaction(
        &self,
        subscription_id: &str,
        order_id: i64,
    ) -> StoreResult<Option<Transaction>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .transactions
            .get(&order_id)
            .filter(|t| {
                t.subscription_id == subscription_id
                    && t.status == crate::models::TransactionStatus::Confirmed
            })
            .cloned())
    }

    async fn get_or_create_account(
        &self,
        wallet_address: &str,
        cdp_user_id: Option<&str>,
    ) -> StoreResult<Account> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(existing) = inner
            .accounts
            .values_mut()
            .find(|a| a.wallet_address == wallet_address)
        {
            if existing.cdp_user_id.is_none() {
                existing.cdp_user_id = cdp_user_id.map(|s| s.to_string());
            }
            return Ok(existing.clone());
        }

        inner.next_account_id += 1;
        let account = Account {
            id: inner.next_account_id,
            wallet_address: wallet_address.to_string(),
            cdp_user_id: cdp_user_id.map(|s| s.to_string()),
            created_at: Utc::now(),
        };
        inner.accounts.insert(account.id, account.clone());

        Ok(account)
    }

    async fn get_account(&self, account_id: i64) -> StoreResult<Option<Account>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.accounts.get(&account_id).cloned())
    }

    async fn get_account_by_address(&self, wallet_address: &str) -> StoreResult<Option<Account>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .accounts
            .values()
            .find(|a| a.wallet_address == wallet_address)
            .cloned())
    }

    async fn insert_api_key(&self, key: ApiKey) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.api_keys.values().any(|k| k.key_hash == key.key_hash) {
            return Err(StorageError::Conflict("api key hash already exists".into()));
        }
        inner.api_keys.insert(key.id, key);
        Ok(())
    }

    async fn find_api_key_by_hash(&self, key_hash: &str) -> StoreResult<Option<ApiKey>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .api_keys
            .values()
            .find(|k| k.key_hash == key_hash)
            .cloned())
    }

    async fn list_api_keys(&self, account_id: i64) -> StoreResult<Vec<ApiKey>> {
        let inner = self.inner.lock().unwrap();
        let mut keys: Vec<ApiKey> = inner
            .api_keys
            .values()
            .filter(|k| k.account_id == account_id)
            .cloned()
            .collect();
        keys.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(keys)
    }

    async fn update_api_key(
        &self,
        account_id: i64,
        key_id: Uuid,
        update: ApiKeyUpdate,
    ) -> StoreResult<ApiKey> {
        let mut inner = self.inner.lock().unwrap();
        let key = inner
            .api_keys
            .get_mut(&key_id)
            .filter(|k| k.account_id == account_id)
            .ok_or_else(|| StorageError::NotFound(format!("api key {} not found", key_id)))?;

        if let Some(name) = update.name {
            key.name = Some(name);
        }
        if let Some(enabled) = update.enabled {
            key.enabled = enabled;
        }

        Ok(key.clone())
    }

    async fn delete_api_key(&self, account_id: i64, key_id: Uuid) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let owned = inner
            .api_keys
            .get(&key_id)
            .map(|k| k.account_id == account_id)
            .unwrap_or(false);
        if !owned {
            return Err(StorageError::NotFound(format!("api key {} not found", key_id)));
        }
        inner.api_keys.remove(&key_id);
        Ok(())
    }

    async fn touch_api_key(&self, key_id: Uuid) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(key) = inner.api_keys.get_mut(&key_id) {
            key.last_used_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn upsert_webhook(&self, webhook: Webhook) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.webhooks.insert(webhook.account_id, webhook);
        Ok(())
    }

    async fn get_webhook(&self, account_id: i64) -> StoreResult<Option<Webhook>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .webhooks
            .get(&account_id)
            .filter(|w| !w.deleted)
            .cloned())
    }

    async fn update_webhook_url(&self, account_id: i64, url: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let webhook = inner
            .webhooks
            .get_mut(&account_id)
            .filter(|w| !w.deleted)
            .ok_or_else(|| {
                StorageError::NotFound(format!("webhook for account {} not found", account_id))
            })?;
        webhook.url = url.to_string();
        Ok(())
    }

    async fn rotate_webhook_secret(&self, account_id: i64, secret: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let webhook = inner
            .webhooks
            .get_mut(&account_id)
            .filter(|w| !w.deleted)
            .ok_or_else(|| {
                StorageError::NotFound(format!("webhook for account {} not found", account_id))
            })?;
        webhook.secret = secret.to_string();
        Ok(())
    }

    async fn delete_webhook(&self, account_id: i64) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let webhook = inner.webhooks.get_mut(&account_id).ok_or_else(|| {
            StorageError::NotFound(format!("webhook for account {} not found", account_id))
        })?;
        webhook.deleted = true;
        webhook.enabled = false;
        Ok(())
    }

    async fn touch_webhook(&self, account_id: i64) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(webhook) = inner.webhooks.get_mut(&account_id) {
            webhook.last_used_at = Some(Utc::now());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderType, TransactionStatus};

    fn new_order(status: OrderStatus) -> NewOrder {
        NewOrder {
            order_type: OrderType::Initial,
            due_at: Utc::now(),
            amount: "500000".to_string(),
            period_length_in_seconds: 2_592_000,
            status,
            parent_order_id: None,
        }
    }

    const SUB: &str = "0x1111111111111111111111111111111111111111111111111111111111111111";

    #[tokio::test]
    async fn test_create_subscription_conflict() {
        let store = MemoryStore::new();

        let first = store
            .create_subscription_with_order(SUB, 1, "0xabc", "base", false, new_order(OrderStatus::Processing))
            .await
            .unwrap();
        assert!(matches!(
            first,
            CreateSubscriptionOutcome::Created { order_number: 1, .. }
        ));

        let second = store
            .create_subscription_with_order(SUB, 1, "0xabc", "base", false, new_order(OrderStatus::Processing))
            .await
            .unwrap();
        assert_eq!(second, CreateSubscriptionOutcome::AlreadyExists);

        // No second order was written
        assert_eq!(store.get_subscription_orders(SUB).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_order_numbers_are_dense() {
        let store = MemoryStore::new();
        store
            .create_subscription_with_order(SUB, 1, "0xabc", "base", false, new_order(OrderStatus::Processing))
            .await
            .unwrap();

        for _ in 0..3 {
            store
                .create_order(SUB, new_order(OrderStatus::Pending))
                .await
                .unwrap();
        }

        let numbers: Vec<i32> = store
            .get_subscription_orders(SUB)
            .await
            .unwrap()
            .iter()
            .map(|o| o.order_number)
            .collect();
        assert_eq!(numbers, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_duplicate_transaction_conflicts() {
        let store = MemoryStore::new();
        let outcome = store
            .create_subscription_with_order(SUB, 1, "0xabc", "base", false, new_order(OrderStatus::Processing))
            .await
            .unwrap();
        let order_id = match outcome {
            CreateSubscriptionOutcome::Created { order_id, .. } => order_id,
            _ => unreachable!(),
        };

        let tx = NewTransaction {
            order_id,
            transaction_hash: "0xabc".into(),
            subscription_id: SUB.into(),
            amount: "500000".into(),
            status: TransactionStatus::Confirmed,
            gas_used: None,
        };
        store.record_transaction(tx.clone()).await.unwrap();
        let err = store.record_transaction(tx).await.unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_claim_due_orders_claims_once() {
        let store = MemoryStore::new();
        store
            .create_subscription_with_order(SUB, 1, "0xabc", "base", false, new_order(OrderStatus::Processing))
            .await
            .unwrap();
        store
            .update_subscription_status(SUB, SubscriptionStatus::Active)
            .await
            .unwrap();

        let mut due = new_order(OrderStatus::Pending);
        due.due_at = Utc::now() - chrono::Duration::seconds(5);
        store.create_order(SUB, due).await.unwrap();

        let first = store.claim_due_orders(10).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].order.status, OrderStatus::Processing);

        let second = store.claim_due_orders(10).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_pending_orders_reports_ids() {
        let store = MemoryStore::new();
        store
            .create_subscription_with_order(SUB, 1, "0xabc", "base", false, new_order(OrderStatus::Processing))
            .await
            .unwrap();
        store.create_order(SUB, new_order(OrderStatus::Pending)).await.unwrap();

        let canceled = store.cancel_pending_orders(SUB).await.unwrap();
        assert_eq!(canceled.len(), 2);

        for order in store.get_subscription_orders(SUB).await.unwrap() {
            assert_eq!(order.status, OrderStatus::Failed);
            assert_eq!(order.failure_reason.as_deref(), Some("Subscription canceled"));
        }
    }
}
