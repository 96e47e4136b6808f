//! Scheduler configuration.

use std::time::Duration;

use chrono_tz::Tz;

use crate::error::CronError;

/// Typed options with validation. Backends and the clock are wired on the
/// [`Scheduler`](crate::Scheduler) so this stays plain cloneable data.
///
/// The lookback/lookahead/jitter "must be ≥ 0" rules hold by construction —
/// [`Duration`] cannot be negative.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Coordinator loop period.
    pub tick_interval: Duration,
    /// How far into the past a tick still considers firings dispatchable.
    pub window_lookback: Duration,
    /// How far into the future firings are enumerated (not dispatched early).
    pub window_lookahead: Duration,
    /// Lease lifetime. Must exceed the longest expected callback latency, or
    /// a second node can re-dispatch a firing.
    pub lease_ttl: Duration,
    /// Prefix for lock keys and idempotency keys.
    pub namespace: String,
    /// Record dispatches in the audit backend and expose it to queries.
    pub enable_audit: bool,
    /// Replay missed firings once at startup.
    pub enable_dispatch_recovery: bool,
    /// How far back startup recovery replays missed firings.
    pub recovery_window: Duration,
    /// Upper bound of the uniform random sleep before recovery, to
    /// desynchronize fleet-wide restarts.
    pub recovery_startup_jitter: Duration,
    /// Zone in which cron expressions are evaluated. Firing instants are
    /// keyed as Unix seconds, so changing the zone never invalidates
    /// historical keys or audit rows.
    pub time_zone: Tz,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(5),
            window_lookback: Duration::from_secs(120),
            window_lookahead: Duration::ZERO,
            lease_ttl: Duration::from_secs(60),
            namespace: "railscron".to_string(),
            enable_audit: false,
            enable_dispatch_recovery: true,
            recovery_window: Duration::from_secs(86_400),
            recovery_startup_jitter: Duration::from_secs(5),
            time_zone: Tz::UTC,
        }
    }
}

impl SchedulerConfig {
    /// Every violated rule, as human-readable messages. Empty means valid.
    pub fn violations(&self) -> Vec<String> {
        let mut violations = Vec::new();
        if self.tick_interval.is_zero() {
            violations.push("tick_interval must be greater than zero".to_string());
        }
        if self.lease_ttl.is_zero() {
            violations.push("lease_ttl must be greater than zero".to_string());
        }
        if self.namespace.trim().is_empty() {
            violations.push("namespace must not be empty".to_string());
        }
        if self.recovery_window.is_zero() {
            violations.push("recovery_window must be greater than zero".to_string());
        }
        violations
    }

    /// Fails with all violations joined into one [`CronError::Configuration`].
    pub fn validate(&self) -> Result<(), CronError> {
        let violations = self.violations();
        if violations.is_empty() {
            Ok(())
        } else {
            Err(CronError::Configuration(violations.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = SchedulerConfig::default();
        assert!(config.violations().is_empty());
        config.validate().unwrap();

        assert_eq!(config.tick_interval, Duration::from_secs(5));
        assert_eq!(config.window_lookback, Duration::from_secs(120));
        assert_eq!(config.window_lookahead, Duration::ZERO);
        assert_eq!(config.lease_ttl, Duration::from_secs(60));
        assert_eq!(config.namespace, "railscron");
        assert!(!config.enable_audit);
        assert!(config.enable_dispatch_recovery);
        assert_eq!(config.recovery_window, Duration::from_secs(86_400));
        assert_eq!(config.recovery_startup_jitter, Duration::from_secs(5));
        assert_eq!(config.time_zone, Tz::UTC);
    }

    #[test]
    fn violations_are_collected_not_short_circuited() {
        let config = SchedulerConfig {
            tick_interval: Duration::ZERO,
            lease_ttl: Duration::ZERO,
            namespace: " ".to_string(),
            recovery_window: Duration::ZERO,
            ..SchedulerConfig::default()
        };
        assert_eq!(config.violations().len(), 4);

        let err = config.validate().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("tick_interval"));
        assert!(msg.contains("lease_ttl"));
        assert!(msg.contains("namespace"));
        assert!(msg.contains("recovery_window"));
    }

    #[test]
    fn named_time_zone_is_accepted() {
        let config = SchedulerConfig {
            time_zone: chrono_tz::America::New_York,
            ..SchedulerConfig::default()
        };
        config.validate().unwrap();
    }
}
