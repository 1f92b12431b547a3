//! Per-user daily usage quotas
//!
//! Every accepted inbound user message counts as one action. Token usage is
//! added after the turn from what the upstream reported. Both counters are
//! kept per (user, UTC day).

mod memory;

pub use memory::InMemoryUsageStore;

use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use thiserror::Error;

use crate::adapters::metrics_handler::MetricsCollector;
use crate::domain::{ActionRecord, UsageLimits, UsagePort, UsageSnapshot};

#[derive(Debug, Error)]
pub enum QuotaError {
    #[error("Daily action limit reached ({used}/{limit})")]
    ActionLimit { used: i64, limit: i64 },

    #[error("Daily token limit reached ({used}/{limit})")]
    TokenLimit { used: i64, limit: i64 },

    #[error("Message {0} was already accepted")]
    DuplicateMessage(String),

    #[error("Usage store error: {0}")]
    Store(#[from] anyhow::Error),
}

/// A message that passed the gate and was counted
#[derive(Debug, Clone)]
pub struct Admission {
    pub user_id: String,
    pub message_id: String,
    pub period: NaiveDate,
    pub limits: UsageLimits,
    pub usage: UsageSnapshot,
}

/// The quota period a point in time falls into
pub fn current_period() -> NaiveDate {
    Utc::now().date_naive()
}

fn exhausted(used: i64, limit: i64) -> bool {
    limit != UsageLimits::UNLIMITED && used >= limit
}

pub struct QuotaGate {
    store: Arc<dyn UsagePort>,
    defaults: UsageLimits,
    metrics: Option<Arc<MetricsCollector>>,
}

impl QuotaGate {
    /// `defaults` apply to users without a subscription row.
    pub fn new(store: Arc<dyn UsagePort>, defaults: UsageLimits) -> Self {
        Self {
            store,
            defaults,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn limits_for(&self, user_id: &str) -> Result<UsageLimits, QuotaError> {
        Ok(self.store.limits(user_id).await?.unwrap_or(self.defaults))
    }

    pub async fn admit(&self, user_id: &str, message_id: &str) -> Result<Admission, QuotaError> {
        self.admit_on(current_period(), user_id, message_id).await
    }

    /// Checks the limits for `period` and counts the message.
    ///
    /// A rejected message leaves every counter untouched. The increment is
    /// delegated to the store, which rechecks the action limit atomically
    /// so concurrent sessions of one user cannot overshoot it.
    pub async fn admit_on(
        &self,
        period: NaiveDate,
        user_id: &str,
        message_id: &str,
    ) -> Result<Admission, QuotaError> {
        let limits = self.limits_for(user_id).await?;
        let current = self.store.usage(user_id, period).await?;

        if exhausted(current.token_count, limits.max_tokens_per_day) {
            return Err(self.reject(QuotaError::TokenLimit {
                used: current.token_count,
                limit: limits.max_tokens_per_day,
            }));
        }
        if exhausted(current.action_count, limits.max_actions_per_day) {
            return Err(self.reject(QuotaError::ActionLimit {
                used: current.action_count,
                limit: limits.max_actions_per_day,
            }));
        }

        match self
            .store
            .try_record_action(user_id, period, message_id, limits.max_actions_per_day)
            .await?
        {
            ActionRecord::Recorded(usage) => {
                tracing::debug!(
                    user_id = %user_id,
                    actions = usage.action_count,
                    limit = limits.max_actions_per_day,
                    "Action counted"
                );
                Ok(Admission {
                    user_id: user_id.to_string(),
                    message_id: message_id.to_string(),
                    period,
                    limits,
                    usage,
                })
            }
            ActionRecord::Duplicate => Err(self.reject(QuotaError::DuplicateMessage(
                message_id.to_string(),
            ))),
            ActionRecord::LimitReached(usage) => Err(self.reject(QuotaError::ActionLimit {
                used: usage.action_count,
                limit: limits.max_actions_per_day,
            })),
        }
    }

    /// Refunds an admission whose turn never reached the upstream. The
    /// message id becomes usable again.
    pub async fn release(&self, admission: &Admission) -> Result<(), QuotaError> {
        let released = self
            .store
            .release_action(&admission.user_id, admission.period, &admission.message_id)
            .await?;
        tracing::debug!(
            user_id = %admission.user_id,
            message_id = %admission.message_id,
            released,
            "Action released"
        );
        Ok(())
    }

    /// Adds a finished turn's token usage to the admission's period.
    pub async fn record_tokens(
        &self,
        admission: &Admission,
        tokens: u64,
    ) -> Result<UsageSnapshot, QuotaError> {
        if tokens == 0 {
            return Ok(self.store.usage(&admission.user_id, admission.period).await?);
        }
        let tokens = i64::try_from(tokens).unwrap_or(i64::MAX);
        Ok(self
            .store
            .record_tokens(&admission.user_id, admission.period, tokens)
            .await?)
    }

    fn reject(&self, err: QuotaError) -> QuotaError {
        let label = match &err {
            QuotaError::ActionLimit { .. } => "actions",
            QuotaError::TokenLimit { .. } => "tokens",
            QuotaError::DuplicateMessage(_) => "duplicate",
            QuotaError::Store(_) => "store",
        };
        if let Some(metrics) = &self.metrics {
            metrics.quota_rejections.with_label_values(&[label]).inc();
        }
        tracing::info!(limit = label, "Quota gate rejected message: {}", err);
        err
    }
}
