//! Test doubles for unit testing without real backends.
//!
//! Available in this crate's own tests, and to downstream crates with the
//! `test-support` feature:
//!
//! ```toml
//! [dev-dependencies]
//! railscron = { version = "...", features = ["test-support"] }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::CronError;
use crate::registry::{Firing, JobCallback};
use crate::traits::LeaseBackend;

// ── MockLease ─────────────────────────────────────────────────────────────────

/// Controllable lease backend.
///
/// By default every `acquire` succeeds. Flip [`deny_acquire`](Self::deny_acquire)
/// to simulate another node holding the firing, or
/// [`fail_acquire`](Self::fail_acquire) to simulate a backend outage.
#[derive(Default)]
pub struct MockLease {
    deny: AtomicBool,
    fail: AtomicBool,
    acquired: Mutex<Vec<String>>,
    released: Mutex<Vec<String>>,
}

impl MockLease {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Simulate contention — `acquire` returns `Ok(false)`.
    pub fn deny_acquire(&self) {
        self.deny.store(true, Ordering::SeqCst);
    }

    /// Simulate an outage — `acquire` returns a backend error.
    pub fn fail_acquire(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    /// Back to the default always-succeed behavior.
    pub fn succeed(&self) {
        self.deny.store(false, Ordering::SeqCst);
        self.fail.store(false, Ordering::SeqCst);
    }

    /// Every key successfully acquired, in order.
    pub fn acquired_keys(&self) -> Vec<String> {
        self.acquired.lock().unwrap().clone()
    }

    pub fn released_keys(&self) -> Vec<String> {
        self.released.lock().unwrap().clone()
    }
}

#[async_trait]
impl LeaseBackend for MockLease {
    async fn acquire(&self, key: &str, _ttl: Duration) -> Result<bool, CronError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(CronError::Backend("mock lease outage".into()));
        }
        if self.deny.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.acquired.lock().unwrap().push(key.to_string());
        Ok(true)
    }

    async fn release(&self, key: &str) -> Result<bool, CronError> {
        self.released.lock().unwrap().push(key.to_string());
        Ok(true)
    }
}

// ── RecordingCallback ─────────────────────────────────────────────────────────

/// Records every firing handed to the callback.
#[derive(Clone, Default)]
pub struct RecordingCallback {
    invocations: Arc<Mutex<Vec<Firing>>>,
}

impl RecordingCallback {
    pub fn new() -> Self {
        Self::default()
    }

    /// The callback to register a job with.
    pub fn callback(&self) -> JobCallback {
        let invocations = Arc::clone(&self.invocations);
        Arc::new(move |firing| {
            invocations.lock().unwrap().push(firing);
        })
    }

    pub fn invocations(&self) -> Vec<Firing> {
        self.invocations.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.invocations.lock().unwrap().len()
    }

    /// Idempotency keys seen, in invocation order.
    pub fn idempotency_keys(&self) -> Vec<String> {
        self.invocations
            .lock()
            .unwrap()
            .iter()
            .map(|f| f.idempotency_key.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.invocations.lock().unwrap().clear();
    }
}
