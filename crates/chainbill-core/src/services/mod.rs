//! Business logic services
//!
//! The callable surface the RPC/HTTP layer consumes: subscription lifecycle
//! orchestration plus account, API-key, webhook and CDP-auth management.

pub mod account_service;
pub mod api_key_service;
pub mod auth_service;
pub mod subscription_service;
pub mod webhook_service;

pub use account_service::AccountService;
pub use api_key_service::{ApiKeyService, CreatedApiKey};
pub use auth_service::{CdpAuthService, CdpClaims};
pub use subscription_service::{
    CreateSubscriptionParams, CreateSubscriptionResult, SubscriptionService,
};
pub use webhook_service::{CreatedWebhook, WebhookService};
