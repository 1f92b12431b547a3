use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::NaiveDate;
use tokio::sync::Mutex;

use crate::domain::{ActionRecord, UsageLimits, UsagePort, UsageSnapshot};

#[derive(Default)]
struct PeriodCounters {
    usage: UsageSnapshot,
    seen: HashSet<String>,
}

/// Process-local usage store. A single lock serializes all increments.
#[derive(Default)]
pub struct InMemoryUsageStore {
    limits: HashMap<String, UsageLimits>,
    counters: Mutex<HashMap<(String, NaiveDate), PeriodCounters>>,
}

impl InMemoryUsageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(mut self, user_id: impl Into<String>, limits: UsageLimits) -> Self {
        self.limits.insert(user_id.into(), limits);
        self
    }
}

#[async_trait]
impl UsagePort for InMemoryUsageStore {
    async fn limits(&self, user_id: &str) -> anyhow::Result<Option<UsageLimits>> {
        Ok(self.limits.get(user_id).copied())
    }

    async fn usage(&self, user_id: &str, date: NaiveDate) -> anyhow::Result<UsageSnapshot> {
        let counters = self.counters.lock().await;
        Ok(counters
            .get(&(user_id.to_string(), date))
            .map(|c| c.usage)
            .unwrap_or_default())
    }

    async fn try_record_action(
        &self,
        user_id: &str,
        date: NaiveDate,
        message_id: &str,
        max_actions: i64,
    ) -> anyhow::Result<ActionRecord> {
        let mut counters = self.counters.lock().await;
        let entry = counters.entry((user_id.to_string(), date)).or_default();

        if entry.seen.contains(message_id) {
            return Ok(ActionRecord::Duplicate);
        }
        if max_actions >= 0 && entry.usage.action_count >= max_actions {
            return Ok(ActionRecord::LimitReached(entry.usage));
        }

        entry.seen.insert(message_id.to_string());
        entry.usage.action_count += 1;
        Ok(ActionRecord::Recorded(entry.usage))
    }

    async fn release_action(
        &self,
        user_id: &str,
        date: NaiveDate,
        message_id: &str,
    ) -> anyhow::Result<bool> {
        let mut counters = self.counters.lock().await;
        let Some(entry) = counters.get_mut(&(user_id.to_string(), date)) else {
            return Ok(false);
        };
        if !entry.seen.remove(message_id) {
            return Ok(false);
        }
        entry.usage.action_count = (entry.usage.action_count - 1).max(0);
        Ok(true)
    }

    async fn record_tokens(
        &self,
        user_id: &str,
        date: NaiveDate,
        tokens: i64,
    ) -> anyhow::Result<UsageSnapshot> {
        let mut counters = self.counters.lock().await;
        let entry = counters.entry((user_id.to_string(), date)).or_default();
        entry.usage.token_count = entry.usage.token_count.saturating_add(tokens.max(0));
        Ok(entry.usage)
    }
}
