//! Subscription Service (C7)
//!
//! Orchestrates the create / background-activation / revoke flows and the
//! merchant-facing read surface. Activation runs detached from the HTTP
//! caller: nothing it does can propagate an error upward, and every failure
//! converges on `incomplete` plus an `activation_failed` webhook.

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::error::{Error, ErrorCode, Result};
use crate::models::{Order, OrderStatus, OrderType, Subscription, TransactionStatus};
use crate::provider::{ChargeRequest, ProviderRegistry};
use crate::scheduler::OrderScheduler;
use crate::store::{
    ActivationParams, CreateSubscriptionOutcome, NewOrder, NewTransaction, Store,
};
use crate::webhook::WebhookOutbox;

/// Inputs to `create_subscription`.
#[derive(Debug, Clone)]
pub struct CreateSubscriptionParams {
    pub subscription_id: String,
    pub account_id: i64,
    pub provider: String,
    pub testnet: bool,
}

/// Immediate result; activation continues in the background.
#[derive(Debug, Clone)]
pub struct CreateSubscriptionResult {
    pub order_id: i64,
    pub order_number: i32,
    pub subscription: Subscription,
}

/// Subscription lifecycle orchestration.
pub struct SubscriptionService {
    store: Arc<dyn Store>,
    providers: Arc<ProviderRegistry>,
    scheduler: Arc<dyn OrderScheduler>,
    outbox: Arc<WebhookOutbox>,
}

impl SubscriptionService {
    pub fn new(
        store: Arc<dyn Store>,
        providers: Arc<ProviderRegistry>,
        scheduler: Arc<dyn OrderScheduler>,
        outbox: Arc<WebhookOutbox>,
    ) -> Self {
        Self {
            store,
            providers,
            scheduler,
            outbox,
        }
    }

    /// Register an on-chain permission as a subscription. Returns once the
    /// rows exist; the caller is expected to spawn [`Self::run_activation`].
    pub async fn create_subscription(
        &self,
        params: CreateSubscriptionParams,
    ) -> Result<CreateSubscriptionResult> {
        let provider = self.providers.get(&params.provider)?;

        if !provider.validate_id(&params.subscription_id) {
            return Err(Error::http(
                ErrorCode::InvalidFormat,
                "subscription id must be a 32-byte 0x-prefixed hash",
            ));
        }

        if self
            .store
            .get_subscription(&params.subscription_id)
            .await?
            .is_some()
        {
            return Err(Error::http(
                ErrorCode::SubscriptionExists,
                "subscription already registered",
            ));
        }

        let status = provider
            .get_status(&params.subscription_id, params.testnet)
            .await?;
        if !status.permission_exists {
            return Err(Error::http(
                ErrorCode::PermissionNotFound,
                "permission not found on chain",
            ));
        }
        if !status.is_subscribed {
            return Err(Error::http(
                ErrorCode::Forbidden,
                "permission is not an active subscription",
            ));
        }

        let account = self
            .store
            .get_account(params.account_id)
            .await?
            .ok_or_else(|| Error::http(ErrorCode::NotFound, "account not found"))?;

        let amount = status.remaining_charge_in_period.clone().ok_or_else(|| {
            Error::http(
                ErrorCode::UpstreamServiceError,
                "permission status missing charge amount",
            )
        })?;
        let period_in_seconds = status.period_in_seconds().unwrap_or(0);

        let outcome = self
            .store
            .create_subscription_with_order(
                &params.subscription_id,
                account.id,
                &account.wallet_address,
                &params.provider,
                params.testnet,
                NewOrder {
                    order_type: OrderType::Initial,
                    due_at: Utc::now(),
                    amount,
                    period_length_in_seconds: period_in_seconds,
                    status: OrderStatus::Processing,
                    parent_order_id: None,
                },
            )
            .await?;

        let (order_id, order_number) = match outcome {
            CreateSubscriptionOutcome::Created {
                order_id,
                order_number,
            } => (order_id, order_number),
            CreateSubscriptionOutcome::AlreadyExists => {
                return Err(Error::http(
                    ErrorCode::SubscriptionExists,
                    "subscription already registered",
                ));
            }
        };

        let subscription = self
            .store
            .get_subscription(&params.subscription_id)
            .await?
            .ok_or_else(|| Error::http(ErrorCode::NotFound, "subscription vanished"))?;

        info!(
            subscription_id = %params.subscription_id,
            account_id = account.id,
            order_id,
            "subscription created, activation pending"
        );

        Ok(CreateSubscriptionResult {
            order_id,
            order_number,
            subscription,
        })
    }

    /// Background activation: emit `subscription_created`, settle the
    /// activation charge, commit, arm the next timer, emit
    /// `subscription_activated`. Errors never escape; failures mark the
    /// subscription `incomplete` and emit `activation_failed`.
    pub async fn run_activation(&self, subscription_id: String, order_id: i64) {
        let (subscription, order) = match self.load_activation(&subscription_id, order_id).await {
            Ok(pair) => pair,
            Err(err) => {
                error!(%subscription_id, order_id, %err, "activation aborted before start");
                return;
            }
        };

        self.outbox.subscription_created(&subscription, &order).await;

        if let Err(err) = self.activate(&subscription, &order).await {
            let code = err.error_code().unwrap_or(ErrorCode::InternalError);
            warn!(
                %subscription_id,
                order_id,
                code = %code,
                %err,
                "activation failed, marking incomplete"
            );

            if let Err(mark_err) = self
                .store
                .mark_subscription_incomplete(&subscription_id, order_id, code.as_str())
                .await
            {
                error!(%subscription_id, %mark_err, "failed to mark subscription incomplete");
            }

            self.outbox
                .activation_failed(&subscription, &order, code, &err.to_string())
                .await;
        }
    }

    async fn load_activation(
        &self,
        subscription_id: &str,
        order_id: i64,
    ) -> Result<(Subscription, Order)> {
        let subscription = self
            .store
            .get_subscription(subscription_id)
            .await?
            .ok_or_else(|| Error::http(ErrorCode::NotFound, "subscription not found"))?;
        let order = self
            .store
            .get_order(order_id)
            .await?
            .ok_or_else(|| Error::http(ErrorCode::NotFound, "activation order not found"))?;
        Ok((subscription, order))
    }

    /// The fallible part of activation.
    async fn activate(&self, subscription: &Subscription, order: &Order) -> Result<()> {
        let provider = self.providers.get(&subscription.provider)?;

        // Authoritative charge detail for this cycle.
        let status = provider
            .get_status(&subscription.subscription_id, subscription.testnet)
            .await?;

        // Idempotent: a confirmed transaction from a prior attempt wins.
        let existing = self
            .store
            .get_successful_transaction(&subscription.subscription_id, order.id)
            .await?;

        // What actually settled on chain: the prior transaction's amount on
        // replay, otherwise the fresh status lookup's remaining charge (the
        // registration-time order amount may be stale by now).
        let (transaction_hash, gas_used, charged_amount) = match existing {
            Some(transaction) => (
                transaction.transaction_hash,
                transaction.gas_used,
                transaction.amount,
            ),
            None => {
                let amount = status
                    .remaining_charge_in_period
                    .clone()
                    .unwrap_or_else(|| order.amount.clone());
                let receipt = provider
                    .charge(ChargeRequest {
                        subscription_id: subscription.subscription_id.clone(),
                        amount: amount.clone(),
                        recipient: subscription.beneficiary_address.clone(),
                        testnet: subscription.testnet,
                    })
                    .await?;
                (receipt.transaction_hash, receipt.gas_used, amount)
            }
        };

        let next_order = match (
            status.is_subscribed,
            status.next_period_start,
            status.period_in_seconds(),
            status.recurring_charge.clone(),
        ) {
            (true, Some(due_at), Some(period), Some(amount)) => Some(NewOrder {
                order_type: OrderType::Recurring,
                due_at,
                amount,
                period_length_in_seconds: period,
                status: OrderStatus::Pending,
                parent_order_id: Some(order.id),
            }),
            _ => None,
        };
        let next_due_at = next_order.as_ref().map(|o| o.due_at);

        let next_order_id = self
            .store
            .execute_subscription_activation(ActivationParams {
                subscription_id: subscription.subscription_id.clone(),
                order_id: order.id,
                transaction: NewTransaction {
                    order_id: order.id,
                    transaction_hash: transaction_hash.clone(),
                    subscription_id: subscription.subscription_id.clone(),
                    amount: charged_amount,
                    status: TransactionStatus::Confirmed,
                    gas_used,
                },
                next_order,
            })
            .await?;

        if let (Some(next_order_id), Some(due_at)) = (next_order_id, next_due_at) {
            self.scheduler
                .set(next_order_id, due_at, &subscription.provider)
                .await?;
        }

        let paid_order = self
            .store
            .get_order(order.id)
            .await?
            .unwrap_or_else(|| order.clone());
        let transaction = self
            .store
            .get_successful_transaction(&subscription.subscription_id, order.id)
            .await?;

        info!(
            subscription_id = %subscription.subscription_id,
            transaction_hash = %transaction_hash,
            next_order_id = ?next_order_id,
            "subscription activated"
        );

        if let Some(transaction) = transaction {
            self.outbox
                .subscription_activated(subscription, &paid_order, &transaction)
                .await;
        }

        Ok(())
    }

    /// Revoke a subscription on behalf of its owning account.
    pub async fn revoke_subscription(
        &self,
        account_id: i64,
        subscription_id: &str,
    ) -> Result<()> {
        let subscription = self
            .store
            .get_subscription(subscription_id)
            .await?
            .ok_or_else(|| Error::http(ErrorCode::NotFound, "subscription not found"))?;

        if subscription.account_id != account_id {
            return Err(Error::http(
                ErrorCode::Forbidden,
                "subscription belongs to another account",
            ));
        }

        if subscription.status == crate::models::SubscriptionStatus::Canceled {
            // Idempotent success
            return Ok(());
        }

        if !subscription.status.is_revocable() {
            return Err(Error::http(
                ErrorCode::InvalidRequest,
                format!("subscription is {} and cannot be revoked", subscription.status),
            ));
        }

        let provider = self.providers.get(&subscription.provider)?;
        let status = provider
            .get_status(subscription_id, subscription.testnet)
            .await?;
        if !status.permission_exists {
            return Err(Error::http(
                ErrorCode::PermissionNotFound,
                "permission not found on chain",
            ));
        }

        if status.is_subscribed {
            let receipt = provider.revoke(subscription_id, subscription.testnet).await?;
            info!(
                %subscription_id,
                transaction_hash = %receipt.transaction_hash,
                "permission revoked on chain"
            );
        } else {
            // Already revoked on chain; skip the call.
            info!(%subscription_id, "permission already revoked on chain");
        }

        let canceled_orders = self.store.cancel_pending_orders(subscription_id).await?;
        for order_id in &canceled_orders {
            self.scheduler.delete(*order_id).await?;
        }

        self.store.cancel_subscription(subscription_id).await?;

        let orders = self.store.get_subscription_orders(subscription_id).await?;
        self.outbox
            .subscription_canceled(&subscription, orders.last())
            .await;

        info!(
            %subscription_id,
            canceled_orders = canceled_orders.len(),
            "subscription canceled"
        );

        Ok(())
    }

    /// Subscription summaries for an account.
    pub async fn list_subscriptions(
        &self,
        account_id: i64,
        testnet: Option<bool>,
    ) -> Result<Vec<Subscription>> {
        Ok(self.store.list_subscriptions(account_id, testnet).await?)
    }

    /// One subscription with its orders; 403 on foreign-account access.
    pub async fn get_subscription(
        &self,
        account_id: i64,
        subscription_id: &str,
    ) -> Result<Option<(Subscription, Vec<Order>)>> {
        let Some(subscription) = self.store.get_subscription(subscription_id).await? else {
            return Ok(None);
        };

        if subscription.account_id != account_id {
            return Err(Error::http(
                ErrorCode::Forbidden,
                "subscription belongs to another account",
            ));
        }

        let orders = self.store.get_subscription_orders(subscription_id).await?;
        Ok(Some((subscription, orders)))
    }
}
