//! PostgreSQL implementation of the store contract.
//!
//! Every multi-statement operation runs inside one transaction. Concurrency
//! control relies on the unique constraints on `subscriptions.subscription_id`
//! and `orders (subscription_id, order_number)`, plus `FOR UPDATE SKIP LOCKED`
//! in [`PostgresStore::claim_due_orders`].

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction as PgTransaction};
use uuid::Uuid;

use crate::models::{
    Account, ApiKey, Order, Subscription, SubscriptionStatus, Transaction, Webhook,
};
use crate::store::{
    ActivationParams, ApiKeyUpdate, CreateSubscriptionOutcome, NewOrder, NewTransaction,
    OrderContext, OrderUpdate, RetryScheduling, StorageError, Store, StoreResult,
    SuccessfulChargeOutcome, SuccessfulChargeParams,
};

/// Create a connection pool from a database URL.
pub async fn create_pool(url: &str, max_connections: u32) -> StoreResult<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(url)
        .await
        .map_err(StorageError::from)
}

/// PostgreSQL store
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Insert an order at `max(order_number) + 1` within an open transaction.
    async fn insert_order(
        tx: &mut PgTransaction<'_, Postgres>,
        subscription_id: &str,
        order: &NewOrder,
    ) -> StoreResult<(i64, i32)> {
        let row: (i64, i32) = sqlx::query_as(
            r#"
            INSERT INTO orders (
                subscription_id, order_number, type, due_at, amount,
                period_length_in_seconds, status, attempts, parent_order_id
            )
            SELECT $1, COALESCE(MAX(order_number), 0) + 1, $2, $3, $4, $5, $6, 0, $7
            FROM orders WHERE subscription_id = $1
            RETURNING id, order_number
            "#,
        )
        .bind(subscription_id)
        .bind(order.order_type)
        .bind(order.due_at)
        .bind(&order.amount)
        .bind(order.period_length_in_seconds)
        .bind(order.status)
        .bind(order.parent_order_id)
        .fetch_one(&mut **tx)
        .await?;

        Ok(row)
    }

    async fn insert_transaction(
        tx: &mut PgTransaction<'_, Postgres>,
        transaction: &NewTransaction,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO transactions (
                order_id, transaction_hash, subscription_id, amount, status, gas_used
            ) VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(transaction.order_id)
        .bind(&transaction.transaction_hash)
        .bind(&transaction.subscription_id)
        .bind(&transaction.amount)
        .bind(transaction.status)
        .bind(&transaction.gas_used)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    async fn set_subscription_status(
        tx: &mut PgTransaction<'_, Postgres>,
        subscription_id: &str,
        status: SubscriptionStatus,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE subscriptions SET status = $1, modified_at = NOW() WHERE subscription_id = $2",
        )
        .bind(status)
        .bind(subscription_id)
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!(
                "subscription {} not found",
                subscription_id
            )));
        }

        Ok(())
    }

    async fn order_context(&self, order: Order) -> StoreResult<Option<OrderContext>> {
        let subscription: Option<Subscription> = sqlx::query_as(
            "SELECT * FROM subscriptions WHERE subscription_id = $1",
        )
        .bind(&order.subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(subscription.map(|s| OrderContext {
            order,
            account_id: s.account_id,
            beneficiary_address: s.beneficiary_address,
            provider: s.provider,
            testnet: s.testnet,
            subscription_status: s.status,
        }))
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn create_subscription_with_order(
        &self,
        subscription_id: &str,
        account_id: i64,
        beneficiary_address: &str,
        provider: &str,
        testnet: bool,
        order: NewOrder,
    ) -> StoreResult<CreateSubscriptionOutcome> {
        let mut tx = self.pool.begin().await.map_err(StorageError::from)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO subscriptions (
                subscription_id, status, account_id, beneficiary_address, provider, testnet
            ) VALUES ($1, 'processing', $2, $3, $4, $5)
            ON CONFLICT (subscription_id) DO NOTHING
            "#,
        )
        .bind(subscription_id)
        .bind(account_id)
        .bind(beneficiary_address)
        .bind(provider)
        .bind(testnet)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await.map_err(StorageError::from)?;
            return Ok(CreateSubscriptionOutcome::AlreadyExists);
        }

        let (order_id, order_number) = Self::insert_order(&mut tx, subscription_id, &order).await?;

        tx.commit().await.map_err(StorageError::from)?;

        Ok(CreateSubscriptionOutcome::Created {
            order_id,
            order_number,
        })
    }

    async fn execute_subscription_activation(
        &self,
        params: ActivationParams,
    ) -> StoreResult<Option<i64>> {
        let mut tx = self.pool.begin().await.map_err(StorageError::from)?;

        Self::insert_transaction(&mut tx, &params.transaction).await?;

        let updated = sqlx::query("UPDATE orders SET status = 'paid' WHERE id = $1")
            .bind(params.order_id)
            .execute(&mut *tx)
            .await?;
        if updated.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!(
                "order {} not found",
                params.order_id
            )));
        }

        let next_order_id = match &params.next_order {
            Some(next) => {
                let (id, _) = Self::insert_order(&mut tx, &params.subscription_id, next).await?;
                Some(id)
            }
            None => None,
        };

        Self::set_subscription_status(&mut tx, &params.subscription_id, SubscriptionStatus::Active)
            .await?;

        tx.commit().await.map_err(StorageError::from)?;

        Ok(next_order_id)
    }

    async fn mark_subscription_incomplete(
        &self,
        subscription_id: &str,
        order_id: i64,
        reason: &str,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(StorageError::from)?;

        Self::set_subscription_status(&mut tx, subscription_id, SubscriptionStatus::Incomplete)
            .await?;

        sqlx::query("UPDATE orders SET status = 'failed', failure_reason = $1 WHERE id = $2")
            .bind(reason)
            .bind(order_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await.map_err(StorageError::from)?;

        Ok(())
    }

    async fn claim_due_orders(&self, limit: i64) -> StoreResult<Vec<OrderContext>> {
        let mut tx = self.pool.begin().await.map_err(StorageError::from)?;

        let orders: Vec<Order> = sqlx::query_as(
            r#"
            WITH claimed AS (
                SELECT o.id FROM orders o
                JOIN subscriptions s ON s.subscription_id = o.subscription_id
                WHERE o.status = 'pending' AND o.due_at <= NOW() AND s.status = 'active'
                ORDER BY o.due_at
                LIMIT $1
                FOR UPDATE OF o SKIP LOCKED
            )
            UPDATE orders SET status = 'processing'
            FROM claimed
            WHERE orders.id = claimed.id
            RETURNING orders.*
            "#,
        )
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        let mut contexts = Vec::with_capacity(orders.len());
        for order in orders {
            let subscription: Subscription = sqlx::query_as(
                "SELECT * FROM subscriptions WHERE subscription_id = $1",
            )
            .bind(&order.subscription_id)
            .fetch_one(&mut *tx)
            .await?;

            contexts.push(OrderContext {
                order,
                account_id: subscription.account_id,
                beneficiary_address: subscription.beneficiary_address,
                provider: subscription.provider,
                testnet: subscription.testnet,
                subscription_status: subscription.status,
            });
        }

        tx.commit().await.map_err(StorageError::from)?;

        Ok(contexts)
    }

    async fn claim_order(&self, order_id: i64) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE orders SET status = 'processing'
            WHERE id = $1 AND status IN ('pending', 'pending_retry')
            "#,
        )
        .bind(order_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn record_transaction(&self, transaction: NewTransaction) -> StoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(StorageError::from)?;
        Self::insert_transaction(&mut tx, &transaction).await?;
        tx.commit().await.map_err(StorageError::from)?;
        Ok(())
    }

    async fn record_successful_charge(
        &self,
        params: SuccessfulChargeParams,
    ) -> StoreResult<SuccessfulChargeOutcome> {
        let mut tx = self.pool.begin().await.map_err(StorageError::from)?;

        if let Some(transaction) = &params.transaction {
            Self::insert_transaction(&mut tx, transaction).await?;
        }

        let row: (i32,) = sqlx::query_as(
            "UPDATE orders SET status = 'paid' WHERE id = $1 RETURNING order_number",
        )
        .bind(params.order_id)
        .fetch_one(&mut *tx)
        .await?;
        let order_number = row.0;

        if params.reactivate {
            Self::set_subscription_status(&mut tx, &params.subscription_id, SubscriptionStatus::Active)
                .await?;
        }

        let next_order = match &params.next_order {
            Some(next) => {
                let open: (i64,) = sqlx::query_as(
                    r#"
                    SELECT COUNT(*) FROM orders
                    WHERE subscription_id = $1
                      AND status IN ('pending', 'processing', 'pending_retry')
                    "#,
                )
                .bind(&params.subscription_id)
                .fetch_one(&mut *tx)
                .await?;
                if open.0 == 0 {
                    Some(Self::insert_order(&mut tx, &params.subscription_id, next).await?)
                } else {
                    None
                }
            }
            None => None,
        };

        tx.commit().await.map_err(StorageError::from)?;

        Ok(SuccessfulChargeOutcome {
            order_number,
            next_order,
        })
    }

    async fn update_order(&self, update: OrderUpdate) -> StoreResult<i32> {
        let row: (i32,) = sqlx::query_as(
            r#"
            UPDATE orders
            SET status = $1,
                failure_reason = COALESCE($2, failure_reason),
                raw_error = COALESCE($3, raw_error)
            WHERE id = $4
            RETURNING order_number
            "#,
        )
        .bind(update.status)
        .bind(&update.failure_reason)
        .bind(&update.raw_error)
        .bind(update.id)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0)
    }

    async fn update_subscription_status(
        &self,
        subscription_id: &str,
        status: SubscriptionStatus,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(StorageError::from)?;
        Self::set_subscription_status(&mut tx, subscription_id, status).await?;
        tx.commit().await.map_err(StorageError::from)?;
        Ok(())
    }

    async fn schedule_retry(&self, params: RetryScheduling) -> StoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(StorageError::from)?;

        let result = sqlx::query(
            r#"
            UPDATE orders
            SET status = 'pending_retry',
                attempts = attempts + 1,
                next_retry_at = $1,
                failure_reason = $2,
                raw_error = COALESCE($3, raw_error)
            WHERE id = $4
            "#,
        )
        .bind(params.next_retry_at)
        .bind(&params.failure_reason)
        .bind(&params.raw_error)
        .bind(params.order_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!(
                "order {} not found",
                params.order_id
            )));
        }

        Self::set_subscription_status(&mut tx, &params.subscription_id, SubscriptionStatus::PastDue)
            .await?;

        tx.commit().await.map_err(StorageError::from)?;

        Ok(())
    }

    async fn reactivate_subscription(
        &self,
        _order_id: i64,
        subscription_id: &str,
    ) -> StoreResult<()> {
        self.update_subscription_status(subscription_id, SubscriptionStatus::Active)
            .await
    }

    async fn create_order(
        &self,
        subscription_id: &str,
        order: NewOrder,
    ) -> StoreResult<(i64, i32)> {
        let mut tx = self.pool.begin().await.map_err(StorageError::from)?;
        let inserted = Self::insert_order(&mut tx, subscription_id, &order).await?;
        tx.commit().await.map_err(StorageError::from)?;
        Ok(inserted)
    }

    async fn cancel_pending_orders(&self, subscription_id: &str) -> StoreResult<Vec<i64>> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            r#"
            UPDATE orders
            SET status = 'failed', failure_reason = 'Subscription canceled'
            WHERE subscription_id = $1
              AND status IN ('pending', 'processing', 'pending_retry')
            RETURNING id
            "#,
        )
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn cancel_subscription(&self, subscription_id: &str) -> StoreResult<()> {
        self.update_subscription_status(subscription_id, SubscriptionStatus::Canceled)
            .await
    }

    async fn get_subscription(&self, subscription_id: &str) -> StoreResult<Option<Subscription>> {
        let subscription = sqlx::query_as::<_, Subscription>(
            "SELECT * FROM subscriptions WHERE subscription_id = $1",
        )
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(subscription)
    }

    async fn get_subscription_orders(&self, subscription_id: &str) -> StoreResult<Vec<Order>> {
        let orders = sqlx::query_as::<_, Order>(
            "SELECT * FROM orders WHERE subscription_id = $1 ORDER BY order_number",
        )
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(orders)
    }

    async fn list_subscriptions(
        &self,
        account_id: i64,
        testnet: Option<bool>,
    ) -> StoreResult<Vec<Subscription>> {
        let subscriptions = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT * FROM subscriptions
            WHERE account_id = $1 AND ($2::BOOLEAN IS NULL OR testnet = $2)
            ORDER BY created_at DESC
            "#,
        )
        .bind(account_id)
        .bind(testnet)
        .fetch_all(&self.pool)
        .await?;

        Ok(subscriptions)
    }

    async fn get_order(&self, order_id: i64) -> StoreResult<Option<Order>> {
        let order = sqlx::query_as::<_, Order>("SELECT * FROM orders WHERE id = $1")
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(order)
    }

    async fn get_order_details(&self, order_id: i64) -> StoreResult<Option<OrderContext>> {
        match self.get_order(order_id).await? {
            Some(order) => self.order_context(order).await,
            None => Ok(None),
        }
    }

    async fn get_successful_transaction(
        &self,
        subscription_id: &str,
        order_id: i64,
    ) -> StoreResult<Option<Transaction>> {
        let transaction = sqlx::query_as::<_, Transaction>(
            r#"
            SELECT * FROM transactions
            WHERE subscription_id = $1 AND order_id = $2 AND status = 'confirmed'
            "#,
        )
        .bind(subscription_id)
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(transaction)
    }

    async fn get_or_create_account(
        &self,
        wallet_address: &str,
        cdp_user_id: Option<&str>,
    ) -> StoreResult<Account> {
        let account = sqlx::query_as::<_, Account>(
            r#"
            INSERT INTO accounts (wallet_address, cdp_user_id)
            VALUES ($1, $2)
            ON CONFLICT (wallet_address) DO UPDATE
            SET cdp_user_id = COALESCE(accounts.cdp_user_id, EXCLUDED.cdp_user_id)
            RETURNING *
            "#,
        )
        .bind(wallet_address)
        .bind(cdp_user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(account)
    }

    async fn get_account(&self, account_id: i64) -> StoreResult<Option<Account>> {
        let account = sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE id = $1")
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(account)
    }

    async fn get_account_by_address(&self, wallet_address: &str) -> StoreResult<Option<Account>> {
        let account = sqlx::query_as::<_, Account>(
            "SELECT * FROM accounts WHERE wallet_address = $1",
        )
        .bind(wallet_address)
        .fetch_optional(&self.pool)
        .await?;

        Ok(account)
    }

    async fn insert_api_key(&self, key: ApiKey) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO api_keys (id, account_id, key_hash, start, name, enabled, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(key.id)
        .bind(key.account_id)
        .bind(&key.key_hash)
        .bind(&key.start)
        .bind(&key.name)
        .bind(key.enabled)
        .bind(key.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_api_key_by_hash(&self, key_hash: &str) -> StoreResult<Option<ApiKey>> {
        let key = sqlx::query_as::<_, ApiKey>("SELECT * FROM api_keys WHERE key_hash = $1")
            .bind(key_hash)
            .fetch_optional(&self.pool)
            .await?;

        Ok(key)
    }

    async fn list_api_keys(&self, account_id: i64) -> StoreResult<Vec<ApiKey>> {
        let keys = sqlx::query_as::<_, ApiKey>(
            "SELECT * FROM api_keys WHERE account_id = $1 ORDER BY created_at DESC",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(keys)
    }

    async fn update_api_key(
        &self,
        account_id: i64,
        key_id: Uuid,
        update: ApiKeyUpdate,
    ) -> StoreResult<ApiKey> {
        let key = sqlx::query_as::<_, ApiKey>(
            r#"
            UPDATE api_keys
            SET name = COALESCE($1, name), enabled = COALESCE($2, enabled)
            WHERE id = $3 AND account_id = $4
            RETURNING *
            "#,
        )
        .bind(&update.name)
        .bind(update.enabled)
        .bind(key_id)
        .bind(account_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(key)
    }

    async fn delete_api_key(&self, account_id: i64, key_id: Uuid) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM api_keys WHERE id = $1 AND account_id = $2")
            .bind(key_id)
            .bind(account_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("api key {} not found", key_id)));
        }

        Ok(())
    }

    async fn touch_api_key(&self, key_id: Uuid) -> StoreResult<()> {
        sqlx::query("UPDATE api_keys SET last_used_at = NOW() WHERE id = $1")
            .bind(key_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn upsert_webhook(&self, webhook: Webhook) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO webhooks (account_id, url, secret, enabled, deleted, created_at)
            VALUES ($1, $2, $3, $4, FALSE, $5)
            ON CONFLICT (account_id) DO UPDATE
            SET url = EXCLUDED.url,
                secret = EXCLUDED.secret,
                enabled = EXCLUDED.enabled,
                deleted = FALSE
            "#,
        )
        .bind(webhook.account_id)
        .bind(&webhook.url)
        .bind(&webhook.secret)
        .bind(webhook.enabled)
        .bind(webhook.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_webhook(&self, account_id: i64) -> StoreResult<Option<Webhook>> {
        let webhook = sqlx::query_as::<_, Webhook>(
            "SELECT * FROM webhooks WHERE account_id = $1 AND deleted = FALSE",
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(webhook)
    }

    async fn update_webhook_url(&self, account_id: i64, url: &str) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE webhooks SET url = $1 WHERE account_id = $2 AND deleted = FALSE",
        )
        .bind(url)
        .bind(account_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!(
                "webhook for account {} not found",
                account_id
            )));
        }

        Ok(())
    }

    async fn rotate_webhook_secret(&self, account_id: i64, secret: &str) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE webhooks SET secret = $1 WHERE account_id = $2 AND deleted = FALSE",
        )
        .bind(secret)
        .bind(account_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!(
                "webhook for account {} not found",
                account_id
            )));
        }

        Ok(())
    }

    async fn delete_webhook(&self, account_id: i64) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE webhooks SET deleted = TRUE, enabled = FALSE WHERE account_id = $1",
        )
        .bind(account_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!(
                "webhook for account {} not found",
                account_id
            )));
        }

        Ok(())
    }

    async fn touch_webhook(&self, account_id: i64) -> StoreResult<()> {
        sqlx::query("UPDATE webhooks SET last_used_at = NOW() WHERE account_id = $1")
            .bind(account_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
