//! Lease helpers and the single-process in-memory backend.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;

use crate::clock::{Clock, SystemClock};
use crate::error::CronError;
use crate::traits::LeaseBackend;

/// Acquire `key`, run `body`, release.
///
/// Returns `Ok(None)` without running `body` when acquisition fails. A panic
/// inside `body` is resumed after the lease has been released.
pub async fn with_lease<T, F, Fut>(
    backend: &dyn LeaseBackend,
    key: &str,
    ttl: Duration,
    body: F,
) -> Result<Option<T>, CronError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    if !backend.acquire(key, ttl).await? {
        return Ok(None);
    }
    let outcome = AssertUnwindSafe(body()).catch_unwind().await;
    let _ = backend.release(key).await;
    match outcome {
        Ok(value) => Ok(Some(value)),
        Err(panic) => std::panic::resume_unwind(panic),
    }
}

/// Mutex-protected `key -> expiry` map. Single-process only — use it for
/// development, tests, or deployments with exactly one scheduler node.
pub struct InMemoryLease {
    leases: Mutex<HashMap<String, DateTime<Utc>>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryLease {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            leases: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Number of live (unexpired) leases, for tests and introspection.
    pub fn held(&self) -> usize {
        let now = self.clock.now_utc();
        self.leases
            .lock()
            .unwrap()
            .values()
            .filter(|expiry| **expiry > now)
            .count()
    }
}

impl Default for InMemoryLease {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LeaseBackend for InMemoryLease {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<bool, CronError> {
        let now = self.clock.now_utc();
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| CronError::Backend(format!("lease ttl out of range: {e}")))?;

        let mut leases = self.leases.lock().unwrap();
        // A lease expiring exactly at `now` is free.
        leases.retain(|_, expiry| *expiry > now);
        if leases.contains_key(key) {
            return Ok(false);
        }
        leases.insert(key.to_string(), now + ttl);
        Ok(true)
    }

    async fn release(&self, key: &str) -> Result<bool, CronError> {
        Ok(self.leases.lock().unwrap().remove(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;

    fn ttl(secs: u64) -> Duration {
        Duration::from_secs(secs)
    }

    #[tokio::test]
    async fn acquire_is_exclusive_until_release() {
        let lease = InMemoryLease::new();
        assert!(lease.acquire("k", ttl(60)).await.unwrap());
        assert!(!lease.acquire("k", ttl(60)).await.unwrap());

        assert!(lease.release("k").await.unwrap());
        assert!(lease.acquire("k", ttl(60)).await.unwrap());
    }

    #[tokio::test]
    async fn release_of_unheld_key_returns_false() {
        let lease = InMemoryLease::new();
        assert!(!lease.release("missing").await.unwrap());
    }

    #[tokio::test]
    async fn distinct_keys_do_not_contend() {
        let lease = InMemoryLease::new();
        assert!(lease.acquire("a", ttl(60)).await.unwrap());
        assert!(lease.acquire("b", ttl(60)).await.unwrap());
        assert_eq!(lease.held(), 2);
    }

    #[tokio::test]
    async fn expired_lease_is_reacquirable() {
        let clock = FixedClock::at(Utc::now());
        let lease = InMemoryLease::with_clock(Arc::new(clock.clone()));

        assert!(lease.acquire("k", ttl(30)).await.unwrap());
        clock.advance(chrono::Duration::seconds(29));
        assert!(!lease.acquire("k", ttl(30)).await.unwrap());

        // Expiry at exactly `now` counts as free.
        clock.advance(chrono::Duration::seconds(1));
        assert!(lease.acquire("k", ttl(30)).await.unwrap());
    }

    #[tokio::test]
    async fn with_lease_runs_body_only_when_acquired() {
        let lease = InMemoryLease::new();

        let ran = with_lease(&lease, "k", ttl(60), || async { 42 })
            .await
            .unwrap();
        assert_eq!(ran, Some(42));

        // Body released the lease, so a second run goes through.
        let again = with_lease(&lease, "k", ttl(60), || async { 7 })
            .await
            .unwrap();
        assert_eq!(again, Some(7));

        // Hold the key out-of-band: body must be skipped.
        assert!(lease.acquire("k", ttl(60)).await.unwrap());
        let skipped = with_lease(&lease, "k", ttl(60), || async { 1 })
            .await
            .unwrap();
        assert_eq!(skipped, None);
    }

    #[tokio::test]
    async fn with_lease_releases_on_panic() {
        let lease = Arc::new(InMemoryLease::new());

        let caught = AssertUnwindSafe(with_lease(lease.as_ref(), "k", ttl(60), || async {
            panic!("boom");
        }))
        .catch_unwind()
        .await;
        assert!(caught.is_err());

        // The panic path must have released the lease.
        assert!(lease.acquire("k", ttl(60)).await.unwrap());
    }
}
