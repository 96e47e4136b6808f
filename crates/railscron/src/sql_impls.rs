//! SQL-backed leases and audit registry.
//!
//! Three lease flavors with very different failure semantics:
//!
//! - [`PgAdvisoryLease`] — `pg_try_advisory_lock` on a dedicated pooled
//!   connection. No TTL: the lease lives until the owning connection closes.
//! - [`MySqlNamedLease`] — `GET_LOCK(name, 0)`, also connection-scoped.
//! - [`SqlRowLease`] — a plain unique-keyed row with an explicit
//!   `expires_at`, portable to anything that enforces unique constraints.
//!
//! Plus [`SqlAudit`], the `rails_cron_dispatches` table.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::pool::PoolConnection;
use sqlx::{MySql, MySqlPool, PgPool, Postgres};

use crate::audit::{DispatchRecord, DispatchStatus};
use crate::clock::{Clock, SystemClock};
use crate::error::CronError;
use crate::traits::{AuditBackend, LeaseBackend};

/// MySQL caps lock names at 64 bytes.
const MAX_NAMED_LOCK_LEN: usize = 64;

/// Map a lock key to the signed 64-bit id Postgres advisory locks want.
/// First 8 bytes of SHA-256, big endian — stable across processes.
fn advisory_lock_id(key: &str) -> i64 {
    let digest = Sha256::digest(key.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

/// Shorten a lock key to a valid MySQL lock name.
///
/// Keys at or under the limit pass through untouched. Longer keys become
/// `prefix:first-16-hex-of-sha256`, keeping names deterministic and
/// collision-resistant while staying human-skimmable.
fn named_lock_name(key: &str) -> String {
    if key.len() <= MAX_NAMED_LOCK_LEN {
        return key.to_string();
    }
    let digest = Sha256::digest(key.as_bytes());
    let hash: String = digest[..8].iter().map(|b| format!("{b:02x}")).collect();

    let mut cut = MAX_NAMED_LOCK_LEN - hash.len() - 1;
    while !key.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}:{hash}", &key[..cut])
}

fn chrono_duration(d: Duration) -> Result<chrono::Duration, CronError> {
    chrono::Duration::from_std(d)
        .map_err(|e| CronError::Backend(format!("duration out of range: {e}")))
}

// ── Postgres advisory lock ────────────────────────────────────────────────────

/// One dedicated session holding all of a backend's locks, plus the set of
/// keys it holds. Advisory and named locks are reentrant within a session,
/// so the held set — not the database — answers "do *we* already own this?".
struct LockSession<DB: sqlx::Database> {
    conn: Option<PoolConnection<DB>>,
    held: std::collections::HashSet<String>,
}

impl<DB: sqlx::Database> LockSession<DB> {
    fn new() -> Self {
        Self {
            conn: None,
            held: std::collections::HashSet::new(),
        }
    }

    /// Drop a broken connection; every lock it held is gone with it.
    fn reset(&mut self) {
        self.conn = None;
        self.held.clear();
    }
}

/// Advisory-lock lease. The TTL parameter is ignored: the database keeps the
/// locks for as long as the backend's session lives, which is exactly the
/// guarantee a crashed node needs (its connection dies, its locks free).
pub struct PgAdvisoryLease {
    pool: PgPool,
    session: tokio::sync::Mutex<LockSession<Postgres>>,
}

impl PgAdvisoryLease {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            session: tokio::sync::Mutex::new(LockSession::new()),
        }
    }
}

#[async_trait]
impl LeaseBackend for PgAdvisoryLease {
    async fn acquire(&self, key: &str, _ttl: Duration) -> Result<bool, CronError> {
        let mut session = self.session.lock().await;
        if session.held.contains(key) {
            // This process already owns the firing; a session-reentrant
            // re-lock must not look like a fresh claim.
            return Ok(false);
        }
        if session.conn.is_none() {
            session.conn = Some(self.pool.acquire().await?);
        }
        let Some(conn) = session.conn.as_mut() else {
            return Ok(false);
        };

        let locked: Result<bool, sqlx::Error> =
            sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
                .bind(advisory_lock_id(key))
                .fetch_one(&mut **conn)
                .await;
        match locked {
            Ok(true) => {
                session.held.insert(key.to_string());
                Ok(true)
            }
            Ok(false) => Ok(false),
            Err(e) => {
                session.reset();
                Err(e.into())
            }
        }
    }

    async fn release(&self, key: &str) -> Result<bool, CronError> {
        let mut session = self.session.lock().await;
        if !session.held.remove(key) {
            return Ok(false);
        }
        let Some(conn) = session.conn.as_mut() else {
            return Ok(false);
        };
        let unlocked: Result<bool, sqlx::Error> =
            sqlx::query_scalar("SELECT pg_advisory_unlock($1)")
                .bind(advisory_lock_id(key))
                .fetch_one(&mut **conn)
                .await;
        match unlocked {
            Ok(unlocked) => Ok(unlocked),
            Err(e) => {
                session.reset();
                Err(e.into())
            }
        }
    }
}

// ── MySQL named lock ──────────────────────────────────────────────────────────

/// `GET_LOCK` lease. Connection-scoped like the advisory variant; the TTL
/// parameter is ignored.
pub struct MySqlNamedLease {
    pool: MySqlPool,
    session: tokio::sync::Mutex<LockSession<MySql>>,
}

impl MySqlNamedLease {
    pub fn new(pool: MySqlPool) -> Self {
        Self {
            pool,
            session: tokio::sync::Mutex::new(LockSession::new()),
        }
    }
}

#[async_trait]
impl LeaseBackend for MySqlNamedLease {
    async fn acquire(&self, key: &str, _ttl: Duration) -> Result<bool, CronError> {
        let mut session = self.session.lock().await;
        if session.held.contains(key) {
            return Ok(false);
        }
        if session.conn.is_none() {
            session.conn = Some(self.pool.acquire().await?);
        }
        let Some(conn) = session.conn.as_mut() else {
            return Ok(false);
        };

        // Zero timeout: contention means someone else owns the firing.
        let got: Result<Option<i64>, sqlx::Error> = sqlx::query_scalar("SELECT GET_LOCK(?, 0)")
            .bind(named_lock_name(key))
            .fetch_one(&mut **conn)
            .await;
        match got {
            Ok(Some(1)) => {
                session.held.insert(key.to_string());
                Ok(true)
            }
            Ok(_) => Ok(false),
            Err(e) => {
                session.reset();
                Err(e.into())
            }
        }
    }

    async fn release(&self, key: &str) -> Result<bool, CronError> {
        let mut session = self.session.lock().await;
        if !session.held.remove(key) {
            return Ok(false);
        }
        let Some(conn) = session.conn.as_mut() else {
            return Ok(false);
        };
        let released: Result<Option<i64>, sqlx::Error> =
            sqlx::query_scalar("SELECT RELEASE_LOCK(?)")
                .bind(named_lock_name(key))
                .fetch_one(&mut **conn)
                .await;
        match released {
            Ok(released) => Ok(released == Some(1)),
            Err(e) => {
                session.reset();
                Err(e.into())
            }
        }
    }
}

// ── Row-based lease ───────────────────────────────────────────────────────────

/// Lease as a row in `rails_cron_locks` with a unique key and an explicit
/// `expires_at`. Acquire inserts; a unique-constraint conflict prunes expired
/// rows and retries the insert once.
pub struct SqlRowLease {
    pool: PgPool,
    clock: Arc<dyn Clock>,
}

impl SqlRowLease {
    pub fn new(pool: PgPool) -> Self {
        Self::with_clock(pool, Arc::new(SystemClock))
    }

    pub fn with_clock(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    /// Create the locks table when absent. Production deployments should
    /// manage this with their own migrations.
    pub async fn ensure_schema(&self) -> Result<(), CronError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS rails_cron_locks (
                id          BIGSERIAL PRIMARY KEY,
                key         TEXT NOT NULL UNIQUE,
                acquired_at TIMESTAMPTZ NOT NULL,
                expires_at  TIMESTAMPTZ NOT NULL,
                created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS index_rails_cron_locks_on_expires_at \
             ON rails_cron_locks (expires_at)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .is_some_and(|db| db.is_unique_violation())
}

#[async_trait]
impl LeaseBackend for SqlRowLease {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<bool, CronError> {
        let now = self.clock.now_utc();
        let expires_at = now + chrono_duration(ttl)?;

        for attempt in 0..2 {
            let inserted = sqlx::query(
                "INSERT INTO rails_cron_locks (key, acquired_at, expires_at, created_at, updated_at) \
                 VALUES ($1, $2, $3, $2, $2)",
            )
            .bind(key)
            .bind(now)
            .bind(expires_at)
            .execute(&self.pool)
            .await;

            match inserted {
                Ok(_) => return Ok(true),
                Err(e) if is_unique_violation(&e) => {
                    if attempt > 0 {
                        return Ok(false);
                    }
                    // A row exists; free the key if its lease already lapsed
                    // (expiry at exactly `now` counts as lapsed), then retry.
                    sqlx::query("DELETE FROM rails_cron_locks WHERE key = $1 AND expires_at <= $2")
                        .bind(key)
                        .bind(now)
                        .execute(&self.pool)
                        .await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(false)
    }

    async fn release(&self, key: &str) -> Result<bool, CronError> {
        let deleted = sqlx::query("DELETE FROM rails_cron_locks WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(deleted.rows_affected() > 0)
    }
}

// ── Audit table ───────────────────────────────────────────────────────────────

#[derive(sqlx::FromRow)]
struct DispatchRow {
    key: String,
    fire_time: DateTime<Utc>,
    dispatched_at: DateTime<Utc>,
    node_id: String,
    status: String,
}

impl From<DispatchRow> for DispatchRecord {
    fn from(row: DispatchRow) -> Self {
        Self {
            job_key: row.key,
            firing_instant: row.fire_time,
            dispatched_at: row.dispatched_at,
            node_id: row.node_id,
            status: DispatchStatus::parse(&row.status).unwrap_or(DispatchStatus::Failed),
        }
    }
}

/// Dispatch history in `rails_cron_dispatches`, unique on `(key, fire_time)`.
pub struct SqlAudit {
    pool: PgPool,
    clock: Arc<dyn Clock>,
}

impl SqlAudit {
    pub fn new(pool: PgPool) -> Self {
        Self::with_clock(pool, Arc::new(SystemClock))
    }

    pub fn with_clock(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    /// Create the dispatches table when absent. Production deployments should
    /// manage this with their own migrations.
    pub async fn ensure_schema(&self) -> Result<(), CronError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS rails_cron_dispatches (
                id            BIGSERIAL PRIMARY KEY,
                key           TEXT NOT NULL,
                fire_time     TIMESTAMPTZ NOT NULL,
                dispatched_at TIMESTAMPTZ NOT NULL,
                node_id       TEXT NOT NULL,
                status        TEXT NOT NULL,
                created_at    TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at    TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        for index in [
            "CREATE UNIQUE INDEX IF NOT EXISTS index_rails_cron_dispatches_on_key_and_fire_time \
             ON rails_cron_dispatches (key, fire_time)",
            "CREATE INDEX IF NOT EXISTS index_rails_cron_dispatches_on_dispatched_at \
             ON rails_cron_dispatches (dispatched_at)",
            "CREATE INDEX IF NOT EXISTS index_rails_cron_dispatches_on_status \
             ON rails_cron_dispatches (status)",
        ] {
            sqlx::query(index).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn find_by_key(&self, job_key: &str) -> Result<Vec<DispatchRecord>, CronError> {
        let rows: Vec<DispatchRow> = sqlx::query_as(
            "SELECT key, fire_time, dispatched_at, node_id, status \
             FROM rails_cron_dispatches WHERE key = $1 ORDER BY fire_time",
        )
        .bind(job_key)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn find_by_node(&self, node_id: &str) -> Result<Vec<DispatchRecord>, CronError> {
        let rows: Vec<DispatchRow> = sqlx::query_as(
            "SELECT key, fire_time, dispatched_at, node_id, status \
             FROM rails_cron_dispatches WHERE node_id = $1 ORDER BY fire_time",
        )
        .bind(node_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn find_by_status(
        &self,
        status: DispatchStatus,
    ) -> Result<Vec<DispatchRecord>, CronError> {
        let rows: Vec<DispatchRow> = sqlx::query_as(
            "SELECT key, fire_time, dispatched_at, node_id, status \
             FROM rails_cron_dispatches WHERE status = $1 ORDER BY fire_time",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}

#[async_trait]
impl AuditBackend for SqlAudit {
    async fn log(
        &self,
        job_key: &str,
        firing_instant: DateTime<Utc>,
        node_id: &str,
        status: DispatchStatus,
    ) -> Result<(), CronError> {
        let now = self.clock.now_utc();
        // The unique index makes double-logging a no-op, which is what the
        // exactly-once bookkeeping wants: first writer wins.
        sqlx::query(
            "INSERT INTO rails_cron_dispatches \
             (key, fire_time, dispatched_at, node_id, status, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $3, $3) \
             ON CONFLICT (key, fire_time) DO NOTHING",
        )
        .bind(job_key)
        .bind(firing_instant)
        .bind(now)
        .bind(node_id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find(
        &self,
        job_key: &str,
        firing_instant: DateTime<Utc>,
    ) -> Result<Option<DispatchRecord>, CronError> {
        let row: Option<DispatchRow> = sqlx::query_as(
            "SELECT key, fire_time, dispatched_at, node_id, status \
             FROM rails_cron_dispatches WHERE key = $1 AND fire_time = $2",
        )
        .bind(job_key)
        .bind(firing_instant)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn cleanup(&self, older_than: Duration) -> Result<u64, CronError> {
        let cutoff = self.clock.now_utc() - chrono_duration(older_than)?;
        let deleted = sqlx::query("DELETE FROM rails_cron_dispatches WHERE fire_time < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(deleted.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advisory_ids_are_stable_and_distinct() {
        let a = advisory_lock_id("railscron:dispatch:j:1735689600");
        assert_eq!(a, advisory_lock_id("railscron:dispatch:j:1735689600"));
        assert_ne!(a, advisory_lock_id("railscron:dispatch:j:1735689660"));
    }

    #[test]
    fn short_named_lock_passes_through() {
        assert_eq!(named_lock_name("ns:dispatch:j:1"), "ns:dispatch:j:1");
    }

    #[test]
    fn long_named_lock_is_shortened_deterministically() {
        let key = format!("ns:dispatch:{}:1735689600", "x".repeat(100));
        let name = named_lock_name(&key);
        assert!(name.len() <= MAX_NAMED_LOCK_LEN);
        assert_eq!(name, named_lock_name(&key));
        // Keeps a recognizable prefix and a 16-hex-char tail.
        assert!(name.starts_with("ns:dispatch:xxx"));
        let (_, tail) = name.rsplit_once(':').unwrap();
        assert_eq!(tail.len(), 16);
        assert!(tail.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn distinct_long_keys_get_distinct_names() {
        let a = format!("ns:dispatch:{}:1", "a".repeat(100));
        let b = format!("ns:dispatch:{}:1", "b".repeat(100));
        assert_ne!(named_lock_name(&a), named_lock_name(&b));
    }
}
