//! Dispatch audit records and the in-memory registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::{Clock, SystemClock};
use crate::error::CronError;
use crate::traits::AuditBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    Dispatched,
    Failed,
}

impl DispatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dispatched => "dispatched",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "dispatched" => Some(Self::Dispatched),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for DispatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One dispatched (or failed) firing. `(job_key, firing_instant)` is unique
/// per registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRecord {
    pub job_key: String,
    pub firing_instant: DateTime<Utc>,
    pub dispatched_at: DateTime<Utc>,
    pub node_id: String,
    pub status: DispatchStatus,
}

/// Mutex-protected map keyed by `(job_key, unix_seconds)`. Single-process
/// counterpart of the Redis/SQL registries.
pub struct InMemoryAudit {
    records: Mutex<HashMap<(String, i64), DispatchRecord>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryAudit {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All records, unordered. Snapshot for tests and introspection.
    pub fn all(&self) -> Vec<DispatchRecord> {
        self.records.lock().unwrap().values().cloned().collect()
    }
}

impl Default for InMemoryAudit {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuditBackend for InMemoryAudit {
    async fn log(
        &self,
        job_key: &str,
        firing_instant: DateTime<Utc>,
        node_id: &str,
        status: DispatchStatus,
    ) -> Result<(), CronError> {
        let record = DispatchRecord {
            job_key: job_key.to_string(),
            firing_instant,
            dispatched_at: self.clock.now_utc(),
            node_id: node_id.to_string(),
            status,
        };
        self.records
            .lock()
            .unwrap()
            .insert((job_key.to_string(), firing_instant.timestamp()), record);
        Ok(())
    }

    async fn find(
        &self,
        job_key: &str,
        firing_instant: DateTime<Utc>,
    ) -> Result<Option<DispatchRecord>, CronError> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .get(&(job_key.to_string(), firing_instant.timestamp()))
            .cloned())
    }

    async fn cleanup(&self, older_than: Duration) -> Result<u64, CronError> {
        let cutoff = self.clock.now_utc()
            - chrono::Duration::from_std(older_than)
                .map_err(|e| CronError::Backend(format!("cleanup window out of range: {e}")))?;
        let mut records = self.records.lock().unwrap();
        let before = records.len();
        records.retain(|_, r| r.firing_instant >= cutoff);
        Ok((before - records.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use chrono::TimeZone;

    fn instant(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[tokio::test]
    async fn log_then_find() {
        let audit = InMemoryAudit::new();
        audit
            .log("j", instant(100), "node-1", DispatchStatus::Dispatched)
            .await
            .unwrap();

        let record = audit.find("j", instant(100)).await.unwrap().unwrap();
        assert_eq!(record.job_key, "j");
        assert_eq!(record.node_id, "node-1");
        assert_eq!(record.status, DispatchStatus::Dispatched);

        assert!(audit.dispatched("j", instant(100)).await.unwrap());
        assert!(!audit.dispatched("j", instant(160)).await.unwrap());
        assert!(!audit.dispatched("other", instant(100)).await.unwrap());
    }

    #[tokio::test]
    async fn relogging_same_firing_keeps_one_record() {
        let audit = InMemoryAudit::new();
        audit
            .log("j", instant(100), "node-1", DispatchStatus::Failed)
            .await
            .unwrap();
        audit
            .log("j", instant(100), "node-2", DispatchStatus::Dispatched)
            .await
            .unwrap();

        assert_eq!(audit.len(), 1);
        let record = audit.find("j", instant(100)).await.unwrap().unwrap();
        assert_eq!(record.node_id, "node-2");
    }

    #[tokio::test]
    async fn cleanup_trims_records_older_than_window() {
        let clock = FixedClock::at(instant(10_000));
        let audit = InMemoryAudit::with_clock(Arc::new(clock));

        audit
            .log("old", instant(1_000), "n", DispatchStatus::Dispatched)
            .await
            .unwrap();
        audit
            .log("new", instant(9_500), "n", DispatchStatus::Dispatched)
            .await
            .unwrap();

        let removed = audit.cleanup(Duration::from_secs(3_600)).await.unwrap();
        assert_eq!(removed, 1);
        assert!(audit.find("old", instant(1_000)).await.unwrap().is_none());
        assert!(audit.find("new", instant(9_500)).await.unwrap().is_some());
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [DispatchStatus::Dispatched, DispatchStatus::Failed] {
            assert_eq!(DispatchStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(DispatchStatus::parse("unknown"), None);
    }
}
