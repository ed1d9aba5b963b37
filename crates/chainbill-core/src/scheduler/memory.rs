//! In-memory scheduler recording armed timers, for the lifecycle tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::scheduler::OrderScheduler;

/// Operations a test may assert on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerCall {
    Set { order_id: i64, due_at: DateTime<Utc> },
    Update { order_id: i64, due_at: DateTime<Utc> },
    Delete { order_id: i64 },
}

/// Scheduler double: keeps the armed set and a call log.
#[derive(Default)]
pub struct MemoryScheduler {
    timers: Mutex<HashMap<i64, DateTime<Utc>>>,
    calls: Mutex<Vec<SchedulerCall>>,
}

impl MemoryScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn armed_at(&self, order_id: i64) -> Option<DateTime<Utc>> {
        self.timers.lock().unwrap().get(&order_id).copied()
    }

    pub fn is_armed(&self, order_id: i64) -> bool {
        self.timers.lock().unwrap().contains_key(&order_id)
    }

    pub fn calls(&self) -> Vec<SchedulerCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl OrderScheduler for MemoryScheduler {
    async fn set(&self, order_id: i64, due_at: DateTime<Utc>, _provider: &str) -> Result<()> {
        self.timers.lock().unwrap().insert(order_id, due_at);
        self.calls
            .lock()
            .unwrap()
            .push(SchedulerCall::Set { order_id, due_at });
        Ok(())
    }

    async fn update(&self, order_id: i64, due_at: DateTime<Utc>, _provider: &str) -> Result<()> {
        self.timers.lock().unwrap().insert(order_id, due_at);
        self.calls
            .lock()
            .unwrap()
            .push(SchedulerCall::Update { order_id, due_at });
        Ok(())
    }

    async fn delete(&self, order_id: i64) -> Result<()> {
        self.timers.lock().unwrap().remove(&order_id);
        self.calls
            .lock()
            .unwrap()
            .push(SchedulerCall::Delete { order_id });
        Ok(())
    }
}
