//! # railscron
//!
//! Distributed cron coordination kernel.
//!
//! railscron guarantees that every registered recurring job fires **exactly
//! once per scheduled instant across a fleet of nodes**, even while nodes
//! crash, restart, or tick in parallel. It does not run the work itself:
//! each firing invokes a host-supplied callback that is expected to enqueue
//! the work into whatever worker system the application already uses and
//! return quickly.
//!
//! ## Features
//!
//! - 5-field cron expressions with lists, ranges, steps, month/weekday names,
//!   and `@hourly`/`@daily`/`@weekly`/`@monthly`/`@yearly` aliases.
//! - DST-correct evaluation in a configurable time zone: instants erased by a
//!   spring-forward gap never fire; instants repeated by a fall-back fire once.
//! - Pluggable distributed lease backends — in-memory, Redis `SET NX PX`,
//!   Postgres advisory locks, MySQL named locks, or a plain SQL row table —
//!   provide mutual exclusion keyed on `(job, firing instant)`.
//! - Optional dispatch audit registry (in-memory, Redis, SQL) recording which
//!   firings were dispatched, for deduplication and startup recovery.
//! - Missed-run recovery on startup: firings that should have happened during
//!   downtime are replayed within a bounded window, jittered across the fleet.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use railscron::{Scheduler, SchedulerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), railscron::CronError> {
//!     let mut scheduler = Scheduler::new(SchedulerConfig::default())?;
//!
//!     scheduler.register("reports.daily", "0 8 * * *", |firing| {
//!         // Hand the work to your queue; dedupe downstream on the
//!         // idempotency key if your lease TTL can be exceeded.
//!         println!(
//!             "enqueue report generation for {} ({})",
//!             firing.firing_instant, firing.idempotency_key
//!         );
//!     })?;
//!
//!     scheduler.start();
//!     tokio::signal::ctrl_c().await.ok();
//!     scheduler.stop(std::time::Duration::from_secs(10)).await;
//!     Ok(())
//! }
//! ```
//!
//! ## Exactly-once
//!
//! The lease is intentionally **not released** after a successful dispatch:
//! the same firing stays inside the lookback window for several more ticks,
//! and only the unexpired lease prevents a re-dispatch. Exclusion therefore
//! rests on the TTL (or, for connection-scoped SQL locks, on the connection
//! lifetime). Pick `lease_ttl` comfortably above your worst-case callback
//! latency; the idempotency key exists for downstream defense when you can't.

pub mod audit;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod expression;
pub mod keys;
pub mod lease;
pub mod registry;
pub mod scheduler;
pub mod traits;

#[cfg(feature = "redis-backend")]
pub mod redis_impls;
#[cfg(feature = "sql-backend")]
pub mod sql_impls;

#[cfg(any(test, feature = "test-support"))]
pub mod mocks;

pub use audit::{DispatchRecord, DispatchStatus, InMemoryAudit};
pub use clock::{Clock, SystemClock};
pub use config::SchedulerConfig;
pub use coordinator::Coordinator;
pub use error::CronError;
pub use expression::CronExpression;
pub use lease::{with_lease, InMemoryLease};
pub use registry::{Firing, Job, JobCallback, JobRegistry};
pub use scheduler::Scheduler;
pub use traits::{AuditBackend, LeaseBackend};

#[cfg(feature = "redis-backend")]
pub use redis_impls::{RedisAudit, RedisLease};
#[cfg(feature = "sql-backend")]
pub use sql_impls::{MySqlNamedLease, PgAdvisoryLease, SqlAudit, SqlRowLease};
