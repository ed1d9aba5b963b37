//! Per-order durable timers.
//!
//! Each order gets exactly one armed fire time; re-arming replaces the prior
//! schedule. On fire the dispatcher enqueues a process-order message. Two
//! different orders may fire concurrently; a single order never has two
//! concurrent firings in flight (the sorted-set claim admits one winner).

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;

pub use memory::{MemoryScheduler, SchedulerCall};
pub use redis::{RedisScheduler, TimerDispatcher};

/// Durable per-order timer contract (C4).
#[async_trait]
pub trait OrderScheduler: Send + Sync {
    /// Arm exactly one fire for this order at `due_at`, replacing any prior
    /// schedule. Persists across restarts.
    async fn set(&self, order_id: i64, due_at: DateTime<Utc>, provider: &str) -> Result<()>;

    /// Re-arm an already scheduled order.
    async fn update(&self, order_id: i64, due_at: DateTime<Utc>, provider: &str) -> Result<()>;

    /// Cancel the timer. Idempotent.
    async fn delete(&self, order_id: i64) -> Result<()>;
}
