//! The coordinator: periodic ticking, due-firing dispatch, startup recovery,
//! graceful shutdown.
//!
//! One background worker per process. Each tick enumerates firings per job
//! over `[now - lookback, now + lookahead]`, claims each due firing through
//! the lease backend, and invokes the job callback for the firings it won.
//!
//! The lease is deliberately **never released** after dispatch: the firing
//! remains inside the lookback window for subsequent ticks, and only the
//! still-held lease stops them from re-dispatching. Expiry (TTL, or
//! connection lifetime for advisory/named locks) is the exclusion mechanism.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::audit::DispatchStatus;
use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::expression::CronExpression;
use crate::keys;
use crate::registry::{Firing, Job, JobRegistry};
use crate::traits::{AuditBackend, LeaseBackend};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Idle,
    Running,
    Stopping,
}

pub struct Coordinator {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    config: SchedulerConfig,
    registry: Arc<JobRegistry>,
    lease: Option<Arc<dyn LeaseBackend>>,
    audit: Option<Arc<dyn AuditBackend>>,
    clock: Arc<dyn Clock>,
    node_id: String,
    state: Mutex<RunState>,
    stop: Notify,
}

impl Coordinator {
    pub fn new(
        config: SchedulerConfig,
        registry: Arc<JobRegistry>,
        lease: Option<Arc<dyn LeaseBackend>>,
        audit: Option<Arc<dyn AuditBackend>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                registry,
                lease,
                audit,
                clock,
                node_id: Uuid::new_v4().to_string(),
                state: Mutex::new(RunState::Idle),
                stop: Notify::new(),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    pub fn running(&self) -> bool {
        *self.inner.state.lock().unwrap() == RunState::Running
    }

    /// Spawn the background worker. No-op (returns false) unless idle.
    pub fn start(&self) -> bool {
        {
            let mut state = self.inner.state.lock().unwrap();
            if *state != RunState::Idle {
                return false;
            }
            *state = RunState::Running;
        }

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            tracing::info!(
                node_id = %inner.node_id,
                job_count = inner.registry.len(),
                "Coordinator starting"
            );
            if inner.config.enable_dispatch_recovery {
                inner.recover().await;
            }
            loop {
                inner.tick().await;

                if *inner.state.lock().unwrap() == RunState::Stopping {
                    break;
                }
                tokio::select! {
                    _ = inner.stop.notified() => break,
                    _ = tokio::time::sleep(inner.config.tick_interval) => {}
                }
            }
            *inner.state.lock().unwrap() = RunState::Idle;
            tracing::info!(node_id = %inner.node_id, "Coordinator stopped");
        });
        *self.worker.lock().unwrap() = Some(handle);
        true
    }

    /// Signal the worker and wait up to `timeout` for it to exit.
    ///
    /// Returns false on timeout; the worker is not killed and still exits
    /// after its current tick. Idempotent — stopping an idle coordinator
    /// returns true.
    pub async fn stop(&self, timeout: Duration) -> bool {
        {
            let mut state = self.inner.state.lock().unwrap();
            if *state == RunState::Idle {
                return true;
            }
            *state = RunState::Stopping;
        }
        self.inner.stop.notify_one();

        let handle = self.worker.lock().unwrap().take();
        let Some(handle) = handle else {
            return true;
        };
        match tokio::time::timeout(timeout, handle).await {
            Ok(_) => true,
            Err(_) => {
                tracing::warn!(
                    node_id = %self.inner.node_id,
                    timeout_ms = timeout.as_millis(),
                    "Worker did not exit within the stop timeout"
                );
                false
            }
        }
    }

    /// Run a single tick synchronously — primarily for tests.
    pub async fn tick_once(&self) {
        self.inner.tick().await;
    }

    /// Run the recovery pass synchronously — primarily for tests.
    pub async fn recover_once(&self) {
        self.inner.recover().await;
    }
}

impl Inner {
    async fn tick(&self) {
        let now = self.clock.now_utc();
        let window_start = now - to_chrono(self.config.window_lookback);
        let window_end = now + to_chrono(self.config.window_lookahead);

        for job in self.registry.all() {
            let expr = match CronExpression::parse(&job.expression) {
                Ok(expr) => expr,
                Err(e) => {
                    tracing::warn!(job_key = %job.key, error = %e, "Skipping job for this tick");
                    continue;
                }
            };

            for firing in expr.firings(self.config.time_zone, window_start, window_end) {
                if firing > now {
                    // Inside the lookahead: enumerated, dispatched on a later tick.
                    continue;
                }
                self.dispatch(&job, firing).await;
            }
        }
    }

    async fn recover(&self) {
        if !self.config.recovery_startup_jitter.is_zero() {
            let jitter = self
                .config
                .recovery_startup_jitter
                .mul_f64(rand::random::<f64>());
            tracing::debug!(
                node_id = %self.node_id,
                jitter_ms = jitter.as_millis(),
                "Delaying dispatch recovery"
            );
            tokio::time::sleep(jitter).await;
        }

        let now = self.clock.now_utc();
        let window_start = now - to_chrono(self.config.recovery_window);
        tracing::info!(
            node_id = %self.node_id,
            window_start = %window_start,
            "Running dispatch recovery"
        );

        for job in self.registry.all() {
            let expr = match CronExpression::parse(&job.expression) {
                Ok(expr) => expr,
                Err(e) => {
                    tracing::warn!(job_key = %job.key, error = %e, "Skipping job during recovery");
                    continue;
                }
            };

            for firing in expr.firings(self.config.time_zone, window_start, now) {
                if self.already_dispatched(&job.key, firing).await {
                    continue;
                }
                self.dispatch(&job, firing).await;
            }
        }

        if let Some(audit) = self.audit_if_enabled() {
            match audit.cleanup(self.config.recovery_window).await {
                Ok(removed) => {
                    tracing::debug!(removed, "Trimmed stale dispatch records");
                }
                Err(e) => {
                    tracing::error!(error = %e, "Dispatch record cleanup failed, continuing");
                }
            }
        }
    }

    /// Claim the firing and invoke the callback. Every failure mode is
    /// contained here: backend errors count as "not acquired", callback
    /// panics are caught and logged, audit failures are swallowed.
    async fn dispatch(&self, job: &Job, firing_instant: DateTime<Utc>) {
        let lock_key = keys::lock_key(&self.config.namespace, &job.key, firing_instant);

        let acquired = match &self.lease {
            Some(lease) => match lease.acquire(&lock_key, self.config.lease_ttl).await {
                Ok(acquired) => acquired,
                Err(e) => {
                    tracing::error!(
                        lock_key = %lock_key,
                        error = %e,
                        "Lease backend error, treating as not acquired"
                    );
                    false
                }
            },
            // No lease backend: single-process mode, every acquire succeeds.
            None => true,
        };
        if !acquired {
            tracing::debug!(lock_key = %lock_key, "Firing already claimed elsewhere");
            return;
        }

        let firing = Firing {
            firing_instant,
            idempotency_key: keys::idempotency_key(
                &self.config.namespace,
                &job.key,
                firing_instant,
            ),
        };
        tracing::debug!(
            job_key = %job.key,
            firing_instant = %firing_instant,
            idempotency_key = %firing.idempotency_key,
            "Dispatching firing"
        );

        let callback = Arc::clone(&job.callback);
        let status = match std::panic::catch_unwind(AssertUnwindSafe(|| callback(firing))) {
            Ok(()) => DispatchStatus::Dispatched,
            Err(panic) => {
                tracing::error!(
                    job_key = %job.key,
                    firing_instant = %firing_instant,
                    panic = %panic_message(&panic),
                    "Job callback panicked"
                );
                DispatchStatus::Failed
            }
        };

        if let Some(audit) = self.audit_if_enabled() {
            if let Err(e) = audit
                .log(&job.key, firing_instant, &self.node_id, status)
                .await
            {
                tracing::error!(
                    job_key = %job.key,
                    firing_instant = %firing_instant,
                    error = %e,
                    "Failed to record dispatch, continuing"
                );
            }
        }
    }

    async fn already_dispatched(&self, job_key: &str, firing_instant: DateTime<Utc>) -> bool {
        let Some(audit) = self.audit_if_enabled() else {
            return false;
        };
        match audit.dispatched(job_key, firing_instant).await {
            Ok(dispatched) => dispatched,
            Err(e) => {
                // Attempt the dispatch anyway; the lease still guards it.
                tracing::error!(
                    job_key = %job_key,
                    error = %e,
                    "Audit lookup failed, treating firing as not yet dispatched"
                );
                false
            }
        }
    }

    fn audit_if_enabled(&self) -> Option<&Arc<dyn AuditBackend>> {
        if self.config.enable_audit {
            self.audit.as_ref()
        } else {
            None
        }
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
