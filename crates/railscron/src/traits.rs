//! Capability interfaces the coordinator depends on.
//!
//! Concrete backends live in [`lease`](crate::lease), [`audit`](crate::audit),
//! [`redis_impls`](crate::redis_impls), and [`sql_impls`](crate::sql_impls);
//! the coordinator only ever sees `Arc<dyn LeaseBackend>` /
//! `Arc<dyn AuditBackend>` chosen at construction.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::audit::{DispatchRecord, DispatchStatus};
use crate::error::CronError;

/// Distributed mutual exclusion keyed on a lock key.
///
/// `acquire` must be atomic: it succeeds iff no holder currently owns `key`,
/// recording an expiry of `now + ttl`. Backends whose locks are
/// connection-scoped (Postgres advisory, MySQL named locks) ignore `ttl`; the
/// lease then lives until the owning connection closes, which substitutes for
/// TTL expiry.
#[async_trait]
pub trait LeaseBackend: Send + Sync {
    /// Returns `Ok(true)` iff this call claimed the key.
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<bool, CronError>;

    /// Releases the lease iff this holder owns it. Safe to call when not
    /// held — returns `Ok(false)`.
    async fn release(&self, key: &str) -> Result<bool, CronError>;
}

/// Optional persistent log of dispatched firings.
///
/// Logging is best-effort: the coordinator never lets an audit failure block
/// or roll back a callback invocation.
#[async_trait]
pub trait AuditBackend: Send + Sync {
    async fn log(
        &self,
        job_key: &str,
        firing_instant: DateTime<Utc>,
        node_id: &str,
        status: DispatchStatus,
    ) -> Result<(), CronError>;

    async fn find(
        &self,
        job_key: &str,
        firing_instant: DateTime<Utc>,
    ) -> Result<Option<DispatchRecord>, CronError>;

    async fn dispatched(
        &self,
        job_key: &str,
        firing_instant: DateTime<Utc>,
    ) -> Result<bool, CronError> {
        Ok(self.find(job_key, firing_instant).await?.is_some())
    }

    /// Delete records with a firing instant older than `now - older_than`,
    /// returning how many were removed. Backends where expiry is native
    /// (Redis TTL) keep the default no-op.
    async fn cleanup(&self, older_than: Duration) -> Result<u64, CronError> {
        let _ = older_than;
        Ok(0)
    }
}
