//! End-to-end lifecycle tests over the in-memory store, mock provider and
//! recording scheduler: activation, idempotent replay, the dunning ladder,
//! terminal failures, revocation, and the upstream-error queue path.

use std::sync::Arc;

use chrono::{Duration, Utc};

use chainbill_core::config::DeliveryRetryConfig;
use chainbill_core::dunning::DunningPolicy;
use chainbill_core::models::{OrderStatus, OrderType, SubscriptionStatus, TransactionStatus, Webhook};
use chainbill_core::provider::{MockProvider, PermissionStatus, ProviderRegistry};
use chainbill_core::queue::{pop_json, MemoryQueue, ProcessOrderMessage, WebhookDeliveryMessage};
use chainbill_core::scheduler::{MemoryScheduler, SchedulerCall};
use chainbill_core::services::{CreateSubscriptionParams, SubscriptionService};
use chainbill_core::store::{MemoryStore, Store};
use chainbill_core::webhook::{WebhookEvent, WebhookOutbox};
use chainbill_core::{ErrorCode, MessageQueue, OrderConsumer, OrderProcessor};

const SUB: &str = "0x52fdfc072182654f163f5f0f9a621d729566c74d10037c4d7bbb0407d1e2c649";
const WALLET: &str = "0x00000000000000000000000000000000000000aa";

struct Harness {
    store: Arc<MemoryStore>,
    provider: Arc<MockProvider>,
    scheduler: Arc<MemoryScheduler>,
    webhook_queue: Arc<MemoryQueue>,
    service: SubscriptionService,
    processor: Arc<OrderProcessor>,
    account_id: i64,
}

impl Harness {
    async fn new() -> Self {
        Self::with_provider(Arc::new(MockProvider::subscribed())).await
    }

    async fn with_provider(provider: Arc<MockProvider>) -> Self {
        let store = Arc::new(MemoryStore::new());
        let scheduler = Arc::new(MemoryScheduler::new());
        let webhook_queue = Arc::new(MemoryQueue::new());

        let mut registry = ProviderRegistry::new();
        registry.register(provider.clone());
        let registry = Arc::new(registry);

        let account = store.get_or_create_account(WALLET, None).await.unwrap();
        store
            .upsert_webhook(Webhook {
                account_id: account.id,
                url: "https://merchant.example/hooks".into(),
                secret: "whsec_test".into(),
                enabled: true,
                deleted: false,
                created_at: Utc::now(),
                last_used_at: None,
            })
            .await
            .unwrap();

        let outbox = Arc::new(WebhookOutbox::new(store.clone(), webhook_queue.clone()));
        let service = SubscriptionService::new(
            store.clone(),
            registry.clone(),
            scheduler.clone(),
            outbox.clone(),
        );
        let processor = Arc::new(OrderProcessor::new(
            store.clone(),
            registry,
            scheduler.clone(),
            outbox,
            DunningPolicy::default(),
        ));

        Self {
            store,
            provider,
            scheduler,
            webhook_queue,
            service,
            processor,
            account_id: account.id,
        }
    }

    /// Create + activate, returning the id of the pending recurring order.
    async fn activate(&self) -> i64 {
        let created = self
            .service
            .create_subscription(CreateSubscriptionParams {
                subscription_id: SUB.into(),
                account_id: self.account_id,
                provider: "base".into(),
                testnet: false,
            })
            .await
            .unwrap();

        self.service.run_activation(SUB.into(), created.order_id).await;

        let orders = self.store.get_subscription_orders(SUB).await.unwrap();
        orders
            .iter()
            .find(|o| o.status == OrderStatus::Pending)
            .expect("activation should schedule the next order")
            .id
    }

    async fn drain_events(&self) -> Vec<WebhookEvent> {
        let mut events = Vec::new();
        while let Some(message) = pop_json::<WebhookDeliveryMessage>(self.webhook_queue.as_ref())
            .await
            .unwrap()
        {
            events.push(serde_json::from_str(&message.payload).unwrap());
        }
        events
    }
}

#[tokio::test]
async fn happy_path_activation() {
    let harness = Harness::new().await;
    harness.provider.push_charge_ok("0xabc");

    let created = harness
        .service
        .create_subscription(CreateSubscriptionParams {
            subscription_id: SUB.into(),
            account_id: harness.account_id,
            provider: "base".into(),
            testnet: false,
        })
        .await
        .unwrap();
    assert_eq!(created.order_number, 1);
    assert_eq!(created.subscription.status, SubscriptionStatus::Processing);
    assert_eq!(created.subscription.beneficiary_address, WALLET);

    harness
        .service
        .run_activation(SUB.into(), created.order_id)
        .await;

    // processing -> active
    let subscription = harness.store.get_subscription(SUB).await.unwrap().unwrap();
    assert_eq!(subscription.status, SubscriptionStatus::Active);

    // Two orders: #1 paid (activation amount), #2 pending (recurring amount)
    let orders = harness.store.get_subscription_orders(SUB).await.unwrap();
    assert_eq!(orders.len(), 2);
    assert_eq!(orders[0].order_number, 1);
    assert_eq!(orders[0].status, OrderStatus::Paid);
    assert_eq!(orders[0].amount, "500000");
    assert_eq!(orders[0].order_type, OrderType::Initial);
    assert_eq!(orders[1].order_number, 2);
    assert_eq!(orders[1].status, OrderStatus::Pending);
    assert_eq!(orders[1].amount, "1000000");
    assert_eq!(orders[1].order_type, OrderType::Recurring);

    // One confirmed transaction on order #1
    let transaction = harness
        .store
        .get_successful_transaction(SUB, orders[0].id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(transaction.transaction_hash, "0xabc");
    assert_eq!(transaction.status, TransactionStatus::Confirmed);

    // Timer armed for order #2 at its due time
    assert_eq!(harness.scheduler.armed_at(orders[1].id), Some(orders[1].due_at));

    // Events: created (processing) then activated (active, order #1, tx)
    let events = harness.drain_events().await;
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].data.subscription.status, "processing");
    let activated = &events[1];
    assert_eq!(activated.data.subscription.status, "active");
    let order = activated.data.order.as_ref().unwrap();
    assert_eq!(order.number, 1);
    assert_eq!(order.order_type, "initial");
    assert_eq!(
        activated.data.transaction.as_ref().unwrap().hash,
        "0xabc"
    );
}

#[tokio::test]
async fn activation_charges_fresh_amount() {
    let harness = Harness::new().await;

    // Registration captures the remaining charge at create time (500000)
    let created = harness
        .service
        .create_subscription(CreateSubscriptionParams {
            subscription_id: SUB.into(),
            account_id: harness.account_id,
            provider: "base".into(),
            testnet: false,
        })
        .await
        .unwrap();

    // The period's remaining charge moves before activation runs
    harness.provider.set_status(PermissionStatus {
        permission_exists: true,
        is_subscribed: true,
        subscription_owner: None,
        remaining_charge_in_period: Some("750000".to_string()),
        current_period_start: Some(Utc::now()),
        next_period_start: Some(Utc::now() + Duration::days(30)),
        recurring_charge: Some("1000000".to_string()),
        period_in_days: Some(30.0),
    });
    harness.provider.push_charge_ok("0xfresh");

    harness
        .service
        .run_activation(SUB.into(), created.order_id)
        .await;

    // The charge used the activation-time amount, not the stale order amount
    let charge = harness.provider.last_charge().unwrap();
    assert_eq!(charge.amount, "750000");

    // The settlement row records what was actually charged
    let transaction = harness
        .store
        .get_successful_transaction(SUB, created.order_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(transaction.amount, "750000");

    // The registration-time order keeps its original amount for audit
    let orders = harness.store.get_subscription_orders(SUB).await.unwrap();
    assert_eq!(orders[0].amount, "500000");
    assert_eq!(orders[0].status, OrderStatus::Paid);

    // The merchant-facing event reports the settled amount too
    let events = harness.drain_events().await;
    let activated = events
        .iter()
        .find(|e| e.data.transaction.is_some())
        .unwrap();
    assert_eq!(activated.data.transaction.as_ref().unwrap().amount, "750000");
    assert_eq!(activated.data.transaction.as_ref().unwrap().hash, "0xfresh");
}

#[tokio::test]
async fn idempotent_replay_does_not_recharge() {
    let harness = Harness::new().await;
    harness.provider.push_charge_ok("0xexisting");
    harness.activate().await;

    let charges_before = harness.provider.charge_calls();
    let paid_order = harness
        .store
        .get_subscription_orders(SUB)
        .await
        .unwrap()
        .into_iter()
        .find(|o| o.status == OrderStatus::Paid)
        .unwrap();

    let result = harness.processor.process_order(paid_order.id).await.unwrap();
    assert!(result.success);
    assert_eq!(result.transaction_hash.as_deref(), Some("0xexisting"));
    // No provider charge call and no extra order
    assert_eq!(harness.provider.charge_calls(), charges_before);
    assert_eq!(harness.store.get_subscription_orders(SUB).await.unwrap().len(), 2);
}

#[tokio::test]
async fn dunning_ladder_to_unpaid() {
    let harness = Harness::new().await;
    harness.activate().await;
    let order_id = harness
        .store
        .get_subscription_orders(SUB)
        .await
        .unwrap()
        .into_iter()
        .find(|o| o.status == OrderStatus::Pending)
        .unwrap()
        .id;

    let expected_days = [2i64, 7, 14, 21];
    for (attempt, days) in expected_days.iter().enumerate() {
        harness
            .provider
            .push_charge_err(ErrorCode::InsufficientBalance, "transfer amount exceeds balance");

        let before = Utc::now();
        let result = harness.processor.process_order(order_id).await.unwrap();
        assert!(!result.success);
        assert!(!result.is_upstream_error);
        assert_eq!(result.subscription_status, SubscriptionStatus::PastDue);

        let order = harness.store.get_order(order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::PendingRetry);
        assert_eq!(order.attempts, attempt as i32 + 1);

        let next_retry = order.next_retry_at.unwrap();
        let expected = before + Duration::days(*days);
        assert!((next_retry - expected).num_seconds().abs() < 5);

        // Timer re-armed at the retry time
        assert_eq!(harness.scheduler.armed_at(order_id), Some(next_retry));

        let subscription = harness.store.get_subscription(SUB).await.unwrap().unwrap();
        assert_eq!(subscription.status, SubscriptionStatus::PastDue);
    }

    // Fifth failure exhausts the schedule
    harness
        .provider
        .push_charge_err(ErrorCode::InsufficientBalance, "transfer amount exceeds balance");
    let orders_before = harness.store.get_subscription_orders(SUB).await.unwrap().len();
    let result = harness.processor.process_order(order_id).await.unwrap();
    assert_eq!(result.subscription_status, SubscriptionStatus::Unpaid);

    let subscription = harness.store.get_subscription(SUB).await.unwrap().unwrap();
    assert_eq!(subscription.status, SubscriptionStatus::Unpaid);
    assert!(!harness.scheduler.is_armed(order_id));
    // No new order was created
    assert_eq!(
        harness.store.get_subscription_orders(SUB).await.unwrap().len(),
        orders_before
    );

    let order = harness.store.get_order(order_id).await.unwrap().unwrap();
    assert_eq!(order.attempts, 4);
    assert_eq!(
        order.failure_reason.as_deref(),
        Some("INSUFFICIENT_BALANCE")
    );

    // payment_failed events carried next_retry_at while retries remained
    let events = harness.drain_events().await;
    let failed: Vec<_> = events
        .iter()
        .filter(|e| e.data.error.is_some())
        .collect();
    assert_eq!(failed.len(), 5);
    assert!(failed[0].data.order.as_ref().unwrap().next_retry_at.is_some());
    assert_eq!(failed[0].data.error.as_ref().unwrap().code, "INSUFFICIENT_BALANCE");
    assert!(failed[4].data.order.as_ref().unwrap().next_retry_at.is_none());
    assert_eq!(failed[4].data.subscription.status, "unpaid");
}

#[tokio::test]
async fn successful_retry_reactivates() {
    let harness = Harness::new().await;
    harness.activate().await;
    let order_id = harness
        .store
        .get_subscription_orders(SUB)
        .await
        .unwrap()
        .into_iter()
        .find(|o| o.status == OrderStatus::Pending)
        .unwrap()
        .id;

    harness
        .provider
        .push_charge_err(ErrorCode::InsufficientBalance, "transfer amount exceeds balance");
    harness.processor.process_order(order_id).await.unwrap();
    assert_eq!(
        harness.store.get_subscription(SUB).await.unwrap().unwrap().status,
        SubscriptionStatus::PastDue
    );

    // Retry fires and the wallet is funded now
    harness.provider.push_charge_ok("0xrecovered");
    let result = harness.processor.process_order(order_id).await.unwrap();
    assert!(result.success);
    assert_eq!(
        harness.store.get_subscription(SUB).await.unwrap().unwrap().status,
        SubscriptionStatus::Active
    );
    assert!(result.next_order_created);
}

#[tokio::test]
async fn terminal_error_cancels() {
    let harness = Harness::new().await;
    harness.activate().await;
    let order_id = harness
        .store
        .get_subscription_orders(SUB)
        .await
        .unwrap()
        .into_iter()
        .find(|o| o.status == OrderStatus::Pending)
        .unwrap()
        .id;

    harness
        .provider
        .push_charge_err(ErrorCode::PermissionRevoked, "permission revoked by owner");
    let orders_before = harness.store.get_subscription_orders(SUB).await.unwrap().len();
    let result = harness.processor.process_order(order_id).await.unwrap();

    assert!(!result.success);
    assert_eq!(result.subscription_status, SubscriptionStatus::Canceled);
    assert!(!result.is_upstream_error);

    let subscription = harness.store.get_subscription(SUB).await.unwrap().unwrap();
    assert_eq!(subscription.status, SubscriptionStatus::Canceled);
    assert!(!harness.scheduler.is_armed(order_id));
    assert_eq!(
        harness.store.get_subscription_orders(SUB).await.unwrap().len(),
        orders_before
    );

    let order = harness.store.get_order(order_id).await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Failed);
    assert_eq!(order.failure_reason.as_deref(), Some("PERMISSION_REVOKED"));
}

#[tokio::test]
async fn not_active_precheck_skips_charge() {
    let harness = Harness::new().await;
    harness.activate().await;
    let order_id = harness
        .store
        .get_subscription_orders(SUB)
        .await
        .unwrap()
        .into_iter()
        .find(|o| o.status == OrderStatus::Pending)
        .unwrap()
        .id;

    harness.store.cancel_subscription(SUB).await.unwrap();
    let charges_before = harness.provider.charge_calls();

    let result = harness.processor.process_order(order_id).await.unwrap();
    assert!(!result.success);
    assert!(!result.is_upstream_error);
    assert_eq!(result.failure_reason, Some(ErrorCode::SubscriptionNotActive));
    assert_eq!(result.subscription_status, SubscriptionStatus::Canceled);
    assert_eq!(harness.provider.charge_calls(), charges_before);

    let order = harness.store.get_order(order_id).await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Failed);
    assert_eq!(
        order.failure_reason.as_deref(),
        Some("SUBSCRIPTION_NOT_ACTIVE")
    );
    assert!(!harness.scheduler.is_armed(order_id));
}

#[tokio::test]
async fn upstream_error_reenters_queue() {
    let harness = Harness::new().await;
    harness.activate().await;
    let order_id = harness
        .store
        .get_subscription_orders(SUB)
        .await
        .unwrap()
        .into_iter()
        .find(|o| o.status == OrderStatus::Pending)
        .unwrap()
        .id;

    harness
        .provider
        .push_charge_err(ErrorCode::UpstreamServiceError, "bundler unavailable (503)");
    let result = harness.processor.process_order(order_id).await.unwrap();
    assert!(result.is_upstream_error);
    assert_eq!(result.subscription_status, SubscriptionStatus::Active);

    // Timer untouched and no new order
    let deletes: Vec<_> = harness
        .scheduler
        .calls()
        .into_iter()
        .filter(|c| matches!(c, SchedulerCall::Delete { order_id: id } if *id == order_id))
        .collect();
    assert!(deletes.is_empty());

    // The consumer re-enqueues with backoff...
    let order_queue = Arc::new(MemoryQueue::new());
    let dead_letters = Arc::new(MemoryQueue::new());
    let consumer = OrderConsumer::new(
        harness.processor.clone(),
        order_queue.clone(),
        dead_letters.clone(),
        DeliveryRetryConfig::default(),
    );

    harness
        .provider
        .push_charge_err(ErrorCode::UpstreamServiceError, "bundler unavailable (503)");
    order_queue
        .push(
            serde_json::to_string(&ProcessOrderMessage {
                order_id,
                provider: "base".into(),
                attempt: 0,
            })
            .unwrap(),
        )
        .await
        .unwrap();
    assert!(consumer.consume_one().await.unwrap());
    assert_eq!(order_queue.delayed_len(), 1);
    assert_eq!(dead_letters.ready_len(), 0);

    // ...and dead-letters once the attempt budget is spent
    harness
        .provider
        .push_charge_err(ErrorCode::UpstreamServiceError, "bundler unavailable (503)");
    order_queue
        .push(
            serde_json::to_string(&ProcessOrderMessage {
                order_id,
                provider: "base".into(),
                attempt: 9,
            })
            .unwrap(),
        )
        .await
        .unwrap();
    // Skip past the delayed redelivery from the previous step
    order_queue.promote_all();
    while consumer.consume_one().await.unwrap() {}
    assert_eq!(dead_letters.ready_len(), 1);
}

#[tokio::test]
async fn opaque_failure_advances_cycle() {
    let harness = Harness::new().await;
    harness.activate().await;
    let order_id = harness
        .store
        .get_subscription_orders(SUB)
        .await
        .unwrap()
        .into_iter()
        .find(|o| o.status == OrderStatus::Pending)
        .unwrap()
        .id;

    harness
        .provider
        .push_charge_err(ErrorCode::UnknownPaymentError, "execution reverted: 0xdeadbeef");
    let result = harness.processor.process_order(order_id).await.unwrap();

    assert!(!result.success);
    assert!(result.next_order_created);
    assert_eq!(result.subscription_status, SubscriptionStatus::Active);
    assert_eq!(
        harness.store.get_subscription(SUB).await.unwrap().unwrap().status,
        SubscriptionStatus::Active
    );

    // The failed order is terminal, a fresh pending order exists
    let orders = harness.store.get_subscription_orders(SUB).await.unwrap();
    let open: Vec<_> = orders.iter().filter(|o| !o.status.is_terminal()).collect();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].parent_order_id, Some(order_id));
}

#[tokio::test]
async fn revoke_cancels_orders_and_timers() {
    let harness = Harness::new().await;
    harness.activate().await;
    let pending_id = harness
        .store
        .get_subscription_orders(SUB)
        .await
        .unwrap()
        .into_iter()
        .find(|o| o.status == OrderStatus::Pending)
        .unwrap()
        .id;

    harness.drain_events().await;

    harness
        .service
        .revoke_subscription(harness.account_id, SUB)
        .await
        .unwrap();

    assert_eq!(harness.provider.revoke_calls(), 1);
    let subscription = harness.store.get_subscription(SUB).await.unwrap().unwrap();
    assert_eq!(subscription.status, SubscriptionStatus::Canceled);
    assert!(!harness.scheduler.is_armed(pending_id));

    let order = harness.store.get_order(pending_id).await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Failed);
    assert_eq!(order.failure_reason.as_deref(), Some("Subscription canceled"));

    let events = harness.drain_events().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].data.subscription.status, "canceled");

    // Idempotent: a second revoke succeeds without another on-chain call
    harness
        .service
        .revoke_subscription(harness.account_id, SUB)
        .await
        .unwrap();
    assert_eq!(harness.provider.revoke_calls(), 1);

    // Foreign accounts are rejected
    let err = harness
        .service
        .revoke_subscription(harness.account_id + 1, SUB)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), Some(ErrorCode::Forbidden));
}

#[tokio::test]
async fn create_rejects_duplicates_and_bad_permissions() {
    let harness = Harness::new().await;
    harness.activate().await;

    let err = harness
        .service
        .create_subscription(CreateSubscriptionParams {
            subscription_id: SUB.into(),
            account_id: harness.account_id,
            provider: "base".into(),
            testnet: false,
        })
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), Some(ErrorCode::SubscriptionExists));

    // Unknown permission -> 404
    let unknown = Arc::new(MockProvider::new(PermissionStatus::default()));
    let harness2 = Harness::with_provider(unknown).await;
    let err = harness2
        .service
        .create_subscription(CreateSubscriptionParams {
            subscription_id: SUB.into(),
            account_id: harness2.account_id,
            provider: "base".into(),
            testnet: false,
        })
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), Some(ErrorCode::PermissionNotFound));

    // Exists but not subscribed -> 403
    let unsubscribed = Arc::new(MockProvider::new(PermissionStatus {
        permission_exists: true,
        is_subscribed: false,
        ..PermissionStatus::default()
    }));
    let harness3 = Harness::with_provider(unsubscribed).await;
    let err = harness3
        .service
        .create_subscription(CreateSubscriptionParams {
            subscription_id: SUB.into(),
            account_id: harness3.account_id,
            provider: "base".into(),
            testnet: false,
        })
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), Some(ErrorCode::Forbidden));
}

#[tokio::test]
async fn failed_activation_marks_incomplete() {
    let harness = Harness::new().await;
    harness
        .provider
        .push_charge_err(ErrorCode::InsufficientBalance, "transfer amount exceeds balance");

    let created = harness
        .service
        .create_subscription(CreateSubscriptionParams {
            subscription_id: SUB.into(),
            account_id: harness.account_id,
            provider: "base".into(),
            testnet: false,
        })
        .await
        .unwrap();

    harness
        .service
        .run_activation(SUB.into(), created.order_id)
        .await;

    let subscription = harness.store.get_subscription(SUB).await.unwrap().unwrap();
    assert_eq!(subscription.status, SubscriptionStatus::Incomplete);

    let order = harness.store.get_order(created.order_id).await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Failed);
    assert_eq!(
        order.failure_reason.as_deref(),
        Some("INSUFFICIENT_BALANCE")
    );

    // created + activation_failed, payment error surfaced verbatim
    let events = harness.drain_events().await;
    assert_eq!(events.len(), 2);
    assert_eq!(events[1].data.subscription.status, "incomplete");
    assert_eq!(
        events[1].data.error.as_ref().unwrap().code,
        "INSUFFICIENT_BALANCE"
    );
}

#[tokio::test]
async fn order_numbers_stay_dense_under_parallel_processing() {
    let harness = Harness::new().await;
    harness.activate().await;
    let order_id = harness
        .store
        .get_subscription_orders(SUB)
        .await
        .unwrap()
        .into_iter()
        .find(|o| o.status == OrderStatus::Pending)
        .unwrap()
        .id;

    // Two replays of the same order racing: the transaction primary key
    // serialises them, so at most one run settles the charge.
    let (left, right) = tokio::join!(
        harness.processor.process_order(order_id),
        harness.processor.process_order(order_id)
    );
    assert!(left.is_ok() || right.is_ok());

    let orders = harness.store.get_subscription_orders(SUB).await.unwrap();
    let mut numbers: Vec<i32> = orders.iter().map(|o| o.order_number).collect();
    numbers.sort_unstable();
    let expected: Vec<i32> = (1..=numbers.len() as i32).collect();
    assert_eq!(numbers, expected, "order numbers must be dense and unique");

    let open = orders.iter().filter(|o| !o.status.is_terminal()).count();
    assert!(open <= 1, "at most one non-terminal order per subscription");
}
