//! The host-facing scheduler value.
//!
//! A [`Scheduler`] bundles configuration, the job registry, optional
//! backends, and the coordinator lifecycle behind one explicit value the
//! host constructs at boot — there is no process-wide singleton.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::clock::{Clock, SystemClock};
use crate::config::SchedulerConfig;
use crate::coordinator::Coordinator;
use crate::error::CronError;
use crate::keys;
use crate::registry::{Firing, Job, JobRegistry};
use crate::traits::{AuditBackend, LeaseBackend};

pub struct Scheduler {
    config: SchedulerConfig,
    registry: Arc<JobRegistry>,
    lease: Option<Arc<dyn LeaseBackend>>,
    audit: Option<Arc<dyn AuditBackend>>,
    clock: Arc<dyn Clock>,
    coordinator: Option<Coordinator>,
}

impl Scheduler {
    /// Validates `config` up front; an invalid configuration never gets as
    /// far as ticking.
    pub fn new(config: SchedulerConfig) -> Result<Self, CronError> {
        config.validate()?;
        Ok(Self {
            config,
            registry: Arc::new(JobRegistry::new()),
            lease: None,
            audit: None,
            clock: Arc::new(SystemClock),
            coordinator: None,
        })
    }

    /// Wire a distributed lease backend. Without one, every acquisition
    /// trivially succeeds — fine for a single scheduler node, wrong for a
    /// fleet. Wire backends before `start`; a running coordinator keeps the
    /// wiring it was built with until the next restart.
    pub fn set_lease_backend(&mut self, lease: Arc<dyn LeaseBackend>) -> &mut Self {
        self.lease = Some(lease);
        self.discard_idle_coordinator();
        self
    }

    /// Wire an audit backend. It only takes effect when
    /// `config.enable_audit` is true.
    pub fn set_audit_backend(&mut self, audit: Arc<dyn AuditBackend>) -> &mut Self {
        self.audit = Some(audit);
        self.discard_idle_coordinator();
        self
    }

    /// Swap the time source — tests inject a fixed clock here.
    pub fn set_clock(&mut self, clock: Arc<dyn Clock>) -> &mut Self {
        self.clock = clock;
        self.discard_idle_coordinator();
        self
    }

    /// Rewiring must never orphan a live worker: the coordinator is only
    /// rebuilt while it is not running.
    fn discard_idle_coordinator(&mut self) {
        if self
            .coordinator
            .as_ref()
            .is_some_and(|coordinator| !coordinator.running())
        {
            self.coordinator = None;
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    // ── registration ──────────────────────────────────────────────────────────

    /// Register a job. The expression is validated lazily, per tick, so a
    /// bad expression is logged and skipped rather than poisoning boot.
    pub fn register<F>(&self, key: &str, expression: &str, callback: F) -> Result<(), CronError>
    where
        F: Fn(Firing) + Send + Sync + 'static,
    {
        self.registry.add(Job {
            key: key.to_string(),
            expression: expression.to_string(),
            callback: Arc::new(callback),
        })
    }

    /// Remove a job. Returns true when something was removed.
    pub fn unregister(&self, key: &str) -> bool {
        self.registry.remove(key).is_some()
    }

    pub fn registered(&self, key: &str) -> bool {
        self.registry.contains(key)
    }

    pub fn registered_jobs(&self) -> Vec<String> {
        self.registry.keys()
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    // ── lifecycle ─────────────────────────────────────────────────────────────

    /// Start the background coordinator. No-op when already running.
    pub fn start(&mut self) -> bool {
        self.ensure_coordinator().start()
    }

    /// Signal shutdown and wait up to `timeout`. Returns false when the
    /// worker failed to exit in time (it is not killed).
    pub async fn stop(&self, timeout: Duration) -> bool {
        match &self.coordinator {
            Some(coordinator) => coordinator.stop(timeout).await,
            None => true,
        }
    }

    /// `stop` followed by `start`, re-running recovery.
    pub async fn restart(&mut self, timeout: Duration) -> bool {
        if !self.stop(timeout).await {
            return false;
        }
        self.start()
    }

    pub fn running(&self) -> bool {
        self.coordinator
            .as_ref()
            .is_some_and(|coordinator| coordinator.running())
    }

    /// Run one tick synchronously, without starting the background worker.
    pub async fn tick_once(&mut self) {
        self.ensure_coordinator().tick_once().await;
    }

    // ── query ─────────────────────────────────────────────────────────────────

    /// Whether an audit record exists for this firing. Always false when
    /// audit is disabled.
    pub async fn dispatched(
        &self,
        key: &str,
        firing_instant: DateTime<Utc>,
    ) -> Result<bool, CronError> {
        match self.audit_registry() {
            Some(audit) => audit.dispatched(key, firing_instant).await,
            None => Ok(false),
        }
    }

    /// The audit backend — exposed only when `enable_audit` is set.
    pub fn audit_registry(&self) -> Option<&Arc<dyn AuditBackend>> {
        if self.config.enable_audit {
            self.audit.as_ref()
        } else {
            None
        }
    }

    /// The idempotency key this scheduler derives for a firing, for hosts
    /// that pre-compute downstream dedup state.
    pub fn idempotency_key(&self, key: &str, firing_instant: DateTime<Utc>) -> String {
        keys::idempotency_key(&self.config.namespace, key, firing_instant)
    }

    fn ensure_coordinator(&mut self) -> &Coordinator {
        let Self {
            coordinator,
            config,
            registry,
            lease,
            audit,
            clock,
        } = self;
        coordinator.get_or_insert_with(|| {
            Coordinator::new(
                config.clone(),
                Arc::clone(registry),
                lease.clone(),
                audit.clone(),
                Arc::clone(clock),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{DispatchStatus, InMemoryAudit};
    use crate::clock::FixedClock;
    use crate::lease::InMemoryLease;
    use crate::mocks::RecordingCallback;
    use chrono_tz::Tz;

    fn utc(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn test_config() -> SchedulerConfig {
        SchedulerConfig {
            recovery_startup_jitter: Duration::ZERO,
            ..SchedulerConfig::default()
        }
    }

    #[test]
    fn new_rejects_invalid_config() {
        let config = SchedulerConfig {
            namespace: "".to_string(),
            ..SchedulerConfig::default()
        };
        assert!(matches!(
            Scheduler::new(config),
            Err(CronError::Configuration(_))
        ));
    }

    #[test]
    fn registration_surface() {
        let scheduler = Scheduler::new(test_config()).unwrap();
        scheduler.register("a", "* * * * *", |_| {}).unwrap();
        scheduler.register("b", "@daily", |_| {}).unwrap();

        assert!(scheduler.registered("a"));
        assert_eq!(scheduler.registered_jobs(), vec!["a", "b"]);

        let err = scheduler.register("a", "* * * * *", |_| {}).unwrap_err();
        assert!(matches!(err, CronError::Registration(_)));

        assert!(scheduler.unregister("a"));
        assert!(!scheduler.unregister("a"));
        assert!(!scheduler.registered("a"));
    }

    #[tokio::test]
    async fn tick_once_dispatches_without_background_worker() {
        let recorder = RecordingCallback::new();
        let mut scheduler = Scheduler::new(test_config()).unwrap();
        scheduler.set_clock(Arc::new(FixedClock::at(utc("2025-01-01T00:00:30Z"))));

        let callback = recorder.callback();
        scheduler
            .register("m", "* * * * *", move |firing| callback(firing))
            .unwrap();

        scheduler.tick_once().await;
        assert!(!scheduler.running());
        assert_eq!(
            recorder.idempotency_keys(),
            vec!["railscron-m-1735689540", "railscron-m-1735689600"]
        );
    }

    #[tokio::test]
    async fn start_and_stop_round_trip() {
        let recorder = RecordingCallback::new();
        let mut scheduler = Scheduler::new(SchedulerConfig {
            tick_interval: Duration::from_millis(10),
            enable_dispatch_recovery: false,
            ..test_config()
        })
        .unwrap();
        scheduler.set_clock(Arc::new(FixedClock::at(utc("2025-01-01T00:00:30Z"))));
        let lease_clock = FixedClock::at(utc("2025-01-01T00:00:30Z"));
        scheduler.set_lease_backend(Arc::new(InMemoryLease::with_clock(Arc::new(lease_clock))));

        let callback = recorder.callback();
        scheduler
            .register("m", "* * * * *", move |firing| callback(firing))
            .unwrap();

        assert!(scheduler.start());
        assert!(scheduler.running());
        assert!(!scheduler.start());

        assert!(scheduler.stop(Duration::from_secs(5)).await);
        assert!(!scheduler.running());

        // With the lease in place each firing dispatched exactly once even
        // though multiple ticks ran.
        assert_eq!(recorder.count(), 2);
    }

    #[tokio::test]
    async fn restart_runs_again() {
        let mut scheduler = Scheduler::new(SchedulerConfig {
            tick_interval: Duration::from_millis(10),
            enable_dispatch_recovery: false,
            ..test_config()
        })
        .unwrap();
        scheduler.register("m", "* * * * *", |_| {}).unwrap();

        assert!(scheduler.start());
        assert!(scheduler.restart(Duration::from_secs(5)).await);
        assert!(scheduler.running());
        assert!(scheduler.stop(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn dispatched_consults_audit_only_when_enabled() {
        let clock = FixedClock::at(utc("2025-01-01T00:00:30Z"));
        let audit = Arc::new(InMemoryAudit::with_clock(Arc::new(clock.clone())));
        audit
            .log(
                "j",
                utc("2025-01-01T00:00:00Z"),
                "n",
                DispatchStatus::Dispatched,
            )
            .await
            .unwrap();

        // Disabled: backend configured but hidden.
        let mut scheduler = Scheduler::new(test_config()).unwrap();
        scheduler.set_audit_backend(audit.clone() as Arc<dyn AuditBackend>);
        assert!(scheduler.audit_registry().is_none());
        assert!(!scheduler
            .dispatched("j", utc("2025-01-01T00:00:00Z"))
            .await
            .unwrap());

        // Enabled: visible and queryable.
        let mut scheduler = Scheduler::new(SchedulerConfig {
            enable_audit: true,
            ..test_config()
        })
        .unwrap();
        scheduler.set_audit_backend(audit as Arc<dyn AuditBackend>);
        assert!(scheduler.audit_registry().is_some());
        assert!(scheduler
            .dispatched("j", utc("2025-01-01T00:00:00Z"))
            .await
            .unwrap());
        assert!(!scheduler
            .dispatched("j", utc("2025-01-01T00:01:00Z"))
            .await
            .unwrap());
    }

    #[test]
    fn idempotency_key_uses_the_configured_namespace() {
        let scheduler = Scheduler::new(SchedulerConfig {
            namespace: "acme".to_string(),
            ..test_config()
        })
        .unwrap();
        assert_eq!(
            scheduler.idempotency_key("m", utc("2025-01-01T00:00:00Z")),
            "acme-m-1735689600"
        );
    }

    #[tokio::test]
    async fn time_zone_governs_evaluation() {
        // 08:00 in New York during winter is 13:00 UTC.
        let recorder = RecordingCallback::new();
        let mut scheduler = Scheduler::new(SchedulerConfig {
            time_zone: Tz::America__New_York,
            window_lookback: Duration::from_secs(60),
            ..test_config()
        })
        .unwrap();
        scheduler.set_clock(Arc::new(FixedClock::at(utc("2025-01-15T13:00:30Z"))));

        let callback = recorder.callback();
        scheduler
            .register("morning", "0 8 * * *", move |firing| callback(firing))
            .unwrap();

        scheduler.tick_once().await;
        let firings = recorder.invocations();
        assert_eq!(firings.len(), 1);
        assert_eq!(firings[0].firing_instant, utc("2025-01-15T13:00:00Z"));
    }
}
