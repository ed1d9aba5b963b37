//! Data model for the subscription billing engine.

pub mod account;
pub mod order;
pub mod subscription;

pub use account::{Account, ApiKey, Webhook};
pub use order::{Order, OrderStatus, OrderType, Transaction, TransactionStatus};
pub use subscription::{Subscription, SubscriptionStatus};
