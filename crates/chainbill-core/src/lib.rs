//! chainbill-core: recurring-payment engine for on-chain subscriptions.
//!
//! Merchants register an existing spend-permission; the engine drives the
//! lifecycle from there: activation charge, per-order durable timers,
//! dunning for recoverable failures, terminal cancellation, and signed
//! `subscription.updated` webhooks with at-least-once delivery.

pub mod config;
pub mod dunning;
pub mod error;
pub mod models;
pub mod processor;
pub mod provider;
pub mod queue;
pub mod scheduler;
pub mod services;
pub mod store;
pub mod webhook;

// Re-export commonly used types
pub use config::Config;
pub use dunning::{DunningAction, DunningInput, DunningPolicy};
pub use error::{Error, ErrorCode, HttpError, Result};
pub use models::{
    Account, ApiKey, Order, OrderStatus, OrderType, Subscription, SubscriptionStatus, Transaction,
    TransactionStatus, Webhook,
};
pub use processor::{OrderConsumer, OrderProcessor, ProcessOrderResult};
pub use provider::{
    BaseProvider, ChargeReceipt, ChargeRequest, PermissionStatus, ProviderRegistry,
    SubscriptionProvider,
};
pub use queue::{MemoryQueue, MessageQueue, ProcessOrderMessage, RedisQueue, WebhookDeliveryMessage};
pub use scheduler::{MemoryScheduler, OrderScheduler, RedisScheduler, TimerDispatcher};
pub use services::{
    AccountService, ApiKeyService, CdpAuthService, SubscriptionService, WebhookService,
};
pub use store::{MemoryStore, Migrator, PostgresStore, StorageError, Store};
pub use webhook::{DeadLetterConsumer, DeliveryWorker, WebhookOutbox};

/// Current version of chainbill
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
