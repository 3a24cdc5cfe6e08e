//! Marking deployments as used.

use crate::tenant::BackendTarget;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Receives one mark per served query.
#[async_trait]
pub trait UsageTracker: Send + Sync {
    async fn mark_used(&self, deployment_id: &str) -> anyhow::Result<()>;
}

/// Fire-and-forget front for a [`UsageTracker`].
#[derive(Clone)]
pub struct UsageRecorder {
    tracker: Arc<dyn UsageTracker>,
}

impl UsageRecorder {
    pub fn new(tracker: Arc<dyn UsageTracker>) -> Self {
        Self { tracker }
    }

    /// Record usage without waiting. Failures are logged and dropped.
    pub fn record(&self, target: &BackendTarget) {
        let tracker = self.tracker.clone();
        let deployment_id = target.deployment_id.clone();
        tokio::spawn(async move {
            if let Err(e) = tracker.mark_used(&deployment_id).await {
                tracing::warn!(deployment = %deployment_id, error = %e, "Failed to record usage");
            }
        });
    }
}

/// Usage of a single deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageRecord {
    pub queries: u64,
    pub last_used: DateTime<Utc>,
}

/// Keeps per-deployment query counts in memory.
#[derive(Debug, Default)]
pub struct InMemoryUsageTracker {
    records: Mutex<BTreeMap<String, UsageRecord>>,
}

impl InMemoryUsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> BTreeMap<String, UsageRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn queries(&self, deployment_id: &str) -> u64 {
        self.snapshot().get(deployment_id).map_or(0, |r| r.queries)
    }
}

#[async_trait]
impl UsageTracker for InMemoryUsageTracker {
    async fn mark_used(&self, deployment_id: &str) -> anyhow::Result<()> {
        let now = Utc::now();
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let record = records
            .entry(deployment_id.to_string())
            .or_insert(UsageRecord {
                queries: 0,
                last_used: now,
            });
        record.queries += 1;
        record.last_used = now;
        tracing::trace!(deployment = %deployment_id, queries = record.queries, "Deployment used");
        Ok(())
    }
}
