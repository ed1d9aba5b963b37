//! Order processor (C5): the per-order charge pipeline.
//!
//! Triggered by a queue message or a fired timer. Load, pre-check the
//! subscription, check idempotency, charge, persist, classify the failure,
//! act on the dunning decision, and schedule what comes next. A crash
//! between the failure-path updates is recoverable: the order row's `failed`
//! status is the checkpoint and `attempts` the progress counter.

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::config::DeliveryRetryConfig;
use crate::dunning::{DunningAction, DunningInput, DunningPolicy};
use crate::error::{Error, ErrorCode, Result};
use crate::models::{OrderStatus, OrderType, Subscription, SubscriptionStatus, TransactionStatus};
use crate::provider::{ChargeRequest, PermissionStatus, ProviderRegistry};
use crate::queue::{
    backoff_delay, pop_json, push_json, push_json_delayed, MessageQueue, ProcessOrderMessage,
};
use crate::scheduler::OrderScheduler;
use crate::store::{
    NewOrder, NewTransaction, OrderContext, OrderUpdate, RetryScheduling, Store,
    SuccessfulChargeParams,
};
use crate::webhook::WebhookOutbox;

/// Outcome of one `process_order` run.
#[derive(Debug, Clone)]
pub struct ProcessOrderResult {
    pub success: bool,
    pub transaction_hash: Option<String>,
    pub order_number: Option<i32>,
    pub next_order_created: bool,
    pub subscription_status: SubscriptionStatus,
    pub failure_reason: Option<ErrorCode>,
    /// True when the failure was infrastructure-level and the whole message
    /// should be redelivered with backoff.
    pub is_upstream_error: bool,
}

/// The per-order charge pipeline.
pub struct OrderProcessor {
    store: Arc<dyn Store>,
    providers: Arc<ProviderRegistry>,
    scheduler: Arc<dyn OrderScheduler>,
    outbox: Arc<WebhookOutbox>,
    policy: DunningPolicy,
}

impl OrderProcessor {
    pub fn new(
        store: Arc<dyn Store>,
        providers: Arc<ProviderRegistry>,
        scheduler: Arc<dyn OrderScheduler>,
        outbox: Arc<WebhookOutbox>,
        policy: DunningPolicy,
    ) -> Self {
        Self {
            store,
            providers,
            scheduler,
            outbox,
            policy,
        }
    }

    /// Process one order end to end.
    pub async fn process_order(&self, order_id: i64) -> Result<ProcessOrderResult> {
        // 1. Load. A missing order is a logic error: delete the timer and
        // report a permanent failure.
        let context = match self.store.get_order_details(order_id).await? {
            Some(context) => context,
            None => {
                self.scheduler.delete(order_id).await.ok();
                return Err(Error::http(
                    ErrorCode::NotFound,
                    format!("order {} not found", order_id),
                ));
            }
        };

        let subscription = self
            .store
            .get_subscription(&context.order.subscription_id)
            .await?
            .ok_or_else(|| {
                Error::http(
                    ErrorCode::NotFound,
                    format!("subscription {} not found", context.order.subscription_id),
                )
            })?;

        // 2. Pre-check: never charge a non-billable subscription.
        if !context.subscription_status.is_billable() {
            warn!(
                order_id,
                subscription_id = %context.order.subscription_id,
                status = %context.subscription_status,
                "subscription not active, failing order without charge"
            );
            self.store
                .update_order(OrderUpdate {
                    id: order_id,
                    status: OrderStatus::Failed,
                    failure_reason: Some(ErrorCode::SubscriptionNotActive.as_str().to_string()),
                    raw_error: None,
                })
                .await?;
            self.scheduler.delete(order_id).await?;

            return Ok(ProcessOrderResult {
                success: false,
                transaction_hash: None,
                order_number: Some(context.order.order_number),
                next_order_created: false,
                subscription_status: context.subscription_status,
                failure_reason: Some(ErrorCode::SubscriptionNotActive),
                is_upstream_error: false,
            });
        }

        // 3. Idempotency: a confirmed transaction from a previous run stands
        // in for the charge.
        let existing = self
            .store
            .get_successful_transaction(&context.order.subscription_id, order_id)
            .await?;

        let charge_result = match &existing {
            Some(transaction) => {
                info!(
                    order_id,
                    transaction_hash = %transaction.transaction_hash,
                    "order already settled, skipping charge"
                );
                Ok((transaction.transaction_hash.clone(), transaction.gas_used.clone()))
            }
            None => {
                // 4. Charge. The recipient is the subscription's beneficiary
                // and nothing else.
                let provider = self.providers.get(&context.provider)?;
                provider
                    .charge(ChargeRequest {
                        subscription_id: context.order.subscription_id.clone(),
                        amount: context.order.amount.clone(),
                        recipient: context.beneficiary_address.clone(),
                        testnet: context.testnet,
                    })
                    .await
                    .map(|receipt| (receipt.transaction_hash, receipt.gas_used))
            }
        };

        match charge_result {
            Ok((transaction_hash, gas_used)) => {
                self.handle_success(&context, &subscription, transaction_hash, gas_used, existing.is_some())
                    .await
            }
            Err(err) => self.handle_failure(&context, &subscription, err).await,
        }
    }

    async fn handle_success(
        &self,
        context: &OrderContext,
        subscription: &Subscription,
        transaction_hash: String,
        gas_used: Option<String>,
        already_recorded: bool,
    ) -> Result<ProcessOrderResult> {
        let order = &context.order;

        // The next cycle's candidate order comes from the authoritative
        // on-chain state, resolved up front so the settlement, the paid
        // flip, the reactivation and the next order commit as one store
        // transaction.
        let next_order = match self.fetch_status(context).await {
            Ok(status) => Self::next_order_candidate(context, &status),
            Err(err) => {
                warn!(
                    order_id = order.id,
                    %err,
                    "status lookup after charge failed, next order not scheduled"
                );
                None
            }
        };
        let next_due_at = next_order.as_ref().map(|o| o.due_at);

        // A successful retry returns the subscription to active.
        let was_retry =
            matches!(order.status, OrderStatus::Failed | OrderStatus::PendingRetry) || order.attempts > 0;

        let outcome = self
            .store
            .record_successful_charge(SuccessfulChargeParams {
                subscription_id: order.subscription_id.clone(),
                order_id: order.id,
                transaction: (!already_recorded).then(|| NewTransaction {
                    order_id: order.id,
                    transaction_hash: transaction_hash.clone(),
                    subscription_id: order.subscription_id.clone(),
                    amount: order.amount.clone(),
                    status: TransactionStatus::Confirmed,
                    gas_used: gas_used.clone(),
                }),
                reactivate: was_retry,
                next_order,
            })
            .await?;
        let order_number = outcome.order_number;

        self.scheduler.delete(order.id).await?;

        let next_order_created = outcome.next_order.is_some();
        if let (Some((next_order_id, next_order_number)), Some(due_at)) =
            (outcome.next_order, next_due_at)
        {
            self.scheduler
                .set(next_order_id, due_at, &context.provider)
                .await?;
            info!(
                subscription_id = %order.subscription_id,
                next_order_id,
                next_order_number,
                due_at = %due_at,
                "next cycle order scheduled"
            );
        }

        info!(
            order_id = order.id,
            order_number,
            transaction_hash = %transaction_hash,
            next_order_created,
            "order paid"
        );

        let paid_order = self.store.get_order(order.id).await?.unwrap_or_else(|| order.clone());
        let transaction = self
            .store
            .get_successful_transaction(&order.subscription_id, order.id)
            .await?;
        if let Some(transaction) = transaction {
            self.outbox
                .payment_processed(subscription, &paid_order, &transaction)
                .await;
        }

        Ok(ProcessOrderResult {
            success: true,
            transaction_hash: Some(transaction_hash),
            order_number: Some(order_number),
            next_order_created,
            subscription_status: SubscriptionStatus::Active,
            failure_reason: None,
            is_upstream_error: false,
        })
    }

    async fn handle_failure(
        &self,
        context: &OrderContext,
        subscription: &Subscription,
        err: Error,
    ) -> Result<ProcessOrderResult> {
        let order = &context.order;
        let code = err.error_code().unwrap_or(ErrorCode::PaymentFailed);
        // The provider's own message, kept for debugging and (for payment
        // errors) the webhook body; never the Display form with the code.
        let raw_error = match &err {
            Error::Http(http) => http.message.clone(),
            other => other.to_string(),
        };

        warn!(
            order_id = order.id,
            subscription_id = %order.subscription_id,
            code = %code,
            attempts = order.attempts,
            "charge failed"
        );

        // Checkpoint first: the failed status plus reason survive a crash in
        // the middle of the follow-up updates.
        self.store
            .update_order(OrderUpdate {
                id: order.id,
                status: OrderStatus::Failed,
                failure_reason: Some(code.as_str().to_string()),
                raw_error: Some(raw_error.clone()),
            })
            .await?;

        let action = self.policy.decide(DunningInput {
            error: code,
            current_attempts: order.attempts,
            failure_date: Utc::now(),
        });

        let mut subscription_status = context.subscription_status;
        let mut next_order_created = false;
        let mut is_upstream_error = false;
        let mut next_retry_at = None;

        match &action {
            DunningAction::Terminal => {
                self.store
                    .update_subscription_status(&order.subscription_id, SubscriptionStatus::Canceled)
                    .await?;
                self.scheduler.delete(order.id).await?;
                subscription_status = SubscriptionStatus::Canceled;
            }
            DunningAction::Retry {
                next_retry_at: retry_at,
                attempt_number,
                attempt_label,
            } => {
                self.store
                    .schedule_retry(RetryScheduling {
                        order_id: order.id,
                        subscription_id: order.subscription_id.clone(),
                        next_retry_at: *retry_at,
                        failure_reason: code.as_str().to_string(),
                        raw_error: Some(raw_error.clone()),
                    })
                    .await?;
                self.scheduler
                    .update(order.id, *retry_at, &context.provider)
                    .await?;
                subscription_status = SubscriptionStatus::PastDue;
                next_retry_at = Some(*retry_at);
                info!(
                    order_id = order.id,
                    attempt_number,
                    attempt_label,
                    next_retry_at = %retry_at,
                    "retry scheduled"
                );
            }
            DunningAction::MaxRetriesExhausted => {
                self.store
                    .update_subscription_status(&order.subscription_id, SubscriptionStatus::Unpaid)
                    .await?;
                self.scheduler.delete(order.id).await?;
                subscription_status = SubscriptionStatus::Unpaid;
            }
            DunningAction::UpstreamError => {
                // Timer (where still armed) stays as a backup; the queue
                // consumer redelivers this message with backoff.
                is_upstream_error = true;
            }
            DunningAction::UserOperationFailed => {
                self.scheduler.delete(order.id).await?;
            }
            DunningAction::OtherError => {
                self.scheduler.delete(order.id).await?;
                match self.fetch_status(context).await {
                    Ok(status) => {
                        next_order_created = self.create_next_order(context, &status).await?;
                    }
                    Err(status_err) => warn!(
                        order_id = order.id,
                        %status_err,
                        "status lookup after opaque failure failed, next order not scheduled"
                    ),
                }
            }
        }

        if !is_upstream_error {
            let failed_order = self.store.get_order(order.id).await?.unwrap_or_else(|| order.clone());
            self.outbox
                .payment_failed(
                    subscription,
                    subscription_status,
                    &failed_order,
                    code,
                    &raw_error,
                    next_retry_at,
                )
                .await;
        }

        Ok(ProcessOrderResult {
            success: false,
            transaction_hash: None,
            order_number: Some(order.order_number),
            next_order_created,
            subscription_status,
            failure_reason: Some(code),
            is_upstream_error,
        })
    }

    async fn fetch_status(&self, context: &OrderContext) -> Result<PermissionStatus> {
        let provider = self.providers.get(&context.provider)?;
        provider
            .get_status(&context.order.subscription_id, context.testnet)
            .await
    }

    /// The next cycle's order as reported by the permission, if it has one.
    fn next_order_candidate(context: &OrderContext, status: &PermissionStatus) -> Option<NewOrder> {
        if !status.is_subscribed {
            return None;
        }
        let due_at = status.next_period_start?;
        let period_in_seconds = status.period_in_seconds()?;
        let amount = status.recurring_charge.clone()?;

        Some(NewOrder {
            order_type: OrderType::Recurring,
            due_at,
            amount,
            period_length_in_seconds: period_in_seconds,
            status: OrderStatus::Pending,
            parent_order_id: Some(context.order.id),
        })
    }

    /// Create and arm the next cycle's order if the permission has one and
    /// no open order already exists for the subscription.
    async fn create_next_order(
        &self,
        context: &OrderContext,
        status: &PermissionStatus,
    ) -> Result<bool> {
        let Some(new_order) = Self::next_order_candidate(context, status) else {
            return Ok(false);
        };
        let due_at = new_order.due_at;

        // Guard for replays: at most one non-terminal order per subscription.
        let orders = self
            .store
            .get_subscription_orders(&context.order.subscription_id)
            .await?;
        if orders
            .iter()
            .any(|o| o.id != context.order.id && !o.status.is_terminal())
        {
            return Ok(false);
        }

        let (next_order_id, next_order_number) = self
            .store
            .create_order(&context.order.subscription_id, new_order)
            .await?;

        self.scheduler
            .set(next_order_id, due_at, &context.provider)
            .await?;

        info!(
            subscription_id = %context.order.subscription_id,
            next_order_id,
            next_order_number,
            due_at = %due_at,
            "next cycle order scheduled"
        );

        Ok(true)
    }
}

/// Queue consumer driving the processor. Upstream failures re-enter the
/// queue with exponential backoff; after the attempt budget is spent the
/// message is dead-lettered for the operator.
pub struct OrderConsumer {
    processor: Arc<OrderProcessor>,
    queue: Arc<dyn MessageQueue>,
    dead_letters: Arc<dyn MessageQueue>,
    retry: DeliveryRetryConfig,
}

impl OrderConsumer {
    pub fn new(
        processor: Arc<OrderProcessor>,
        queue: Arc<dyn MessageQueue>,
        dead_letters: Arc<dyn MessageQueue>,
        retry: DeliveryRetryConfig,
    ) -> Self {
        Self {
            processor,
            queue,
            dead_letters,
            retry,
        }
    }

    /// Handle one message; returns whether one was consumed.
    pub async fn consume_one(&self) -> Result<bool> {
        let Some(message) = pop_json::<ProcessOrderMessage>(self.queue.as_ref()).await? else {
            return Ok(false);
        };

        match self.processor.process_order(message.order_id).await {
            Ok(result) if result.is_upstream_error => {
                let next_attempt = message.attempt + 1;
                if next_attempt >= self.retry.max_attempts {
                    error!(
                        order_id = message.order_id,
                        attempts = next_attempt,
                        "upstream retries exhausted, dead-lettering order message"
                    );
                    push_json(
                        self.dead_letters.as_ref(),
                        &ProcessOrderMessage {
                            attempt: next_attempt,
                            ..message
                        },
                    )
                    .await?;
                } else {
                    let delay = backoff_delay(&self.retry, message.attempt);
                    push_json_delayed(
                        self.queue.as_ref(),
                        &ProcessOrderMessage {
                            attempt: next_attempt,
                            ..message
                        },
                        Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default(),
                    )
                    .await?;
                }
            }
            Ok(_) => {}
            Err(err) => {
                // Permanent failures (missing order, unknown provider) are
                // logged and acked; there is nothing to retry.
                error!(order_id = message.order_id, %err, "order processing failed permanently");
            }
        }

        Ok(true)
    }

    /// Consumer loop; runs until the task is aborted.
    pub async fn run(self) {
        info!("order consumer started");
        loop {
            match self.consume_one().await {
                Ok(true) => {}
                Ok(false) => tokio::time::sleep(std::time::Duration::from_millis(250)).await,
                Err(err) => {
                    error!(%err, "failed to read order queue");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        }
    }
}
