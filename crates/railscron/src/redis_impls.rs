//! Redis-backed lease and audit registry.
//!
//! The lease is the classic `SET key token NX PX ttl` pattern: Redis enforces
//! both atomicity and expiry. Release happens through a compare-and-delete
//! Lua script keyed on a random per-acquisition token, so one process can
//! never drop a lease another process holds.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use uuid::Uuid;

use crate::audit::{DispatchRecord, DispatchStatus};
use crate::clock::{Clock, SystemClock};
use crate::error::CronError;
use crate::traits::{AuditBackend, LeaseBackend};

const RELEASE_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end
"#;

pub struct RedisLease {
    conn: MultiplexedConnection,
    /// Tokens for leases this process acquired, keyed by lock key. The
    /// scheduler never releases dispatch leases, so entries are pruned once
    /// the server-side TTL has passed and a release could no longer match.
    tokens: Mutex<HashMap<String, HeldToken>>,
}

struct HeldToken {
    token: String,
    expires_at: std::time::Instant,
}

impl RedisLease {
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    pub async fn connect(url: &str) -> Result<Self, CronError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self::new(conn))
    }
}

#[async_trait]
impl LeaseBackend for RedisLease {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<bool, CronError> {
        let token = Uuid::new_v4().to_string();
        let mut conn = self.conn.clone();

        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;

        if reply.is_some() {
            let now = std::time::Instant::now();
            let mut tokens = self.tokens.lock().unwrap();
            tokens.retain(|_, held| held.expires_at > now);
            tokens.insert(
                key.to_string(),
                HeldToken {
                    token,
                    expires_at: now + ttl,
                },
            );
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn release(&self, key: &str) -> Result<bool, CronError> {
        let token = self
            .tokens
            .lock()
            .unwrap()
            .remove(key)
            .map(|held| held.token);
        let Some(token) = token else {
            return Ok(false);
        };

        let mut conn = self.conn.clone();
        let deleted: i64 = Script::new(RELEASE_SCRIPT)
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }
}

/// Default record TTL: expiry replaces explicit cleanup.
const DEFAULT_RECORD_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// One Redis key per dispatch record, JSON value, expiring after
/// `record_ttl`: `{namespace}:cron_dispatch:{job_key}:{unix_seconds}`.
pub struct RedisAudit {
    conn: MultiplexedConnection,
    namespace: String,
    record_ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl RedisAudit {
    pub fn new(conn: MultiplexedConnection, namespace: impl Into<String>) -> Self {
        Self {
            conn,
            namespace: namespace.into(),
            record_ttl: DEFAULT_RECORD_TTL,
            clock: Arc::new(SystemClock),
        }
    }

    pub async fn connect(url: &str, namespace: impl Into<String>) -> Result<Self, CronError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self::new(conn, namespace))
    }

    pub fn record_ttl(mut self, ttl: Duration) -> Self {
        self.record_ttl = ttl;
        self
    }

    fn record_key(&self, job_key: &str, firing_instant: DateTime<Utc>) -> String {
        record_key(&self.namespace, job_key, firing_instant)
    }
}

fn record_key(namespace: &str, job_key: &str, firing_instant: DateTime<Utc>) -> String {
    format!(
        "{namespace}:cron_dispatch:{job_key}:{}",
        firing_instant.timestamp()
    )
}

#[async_trait]
impl AuditBackend for RedisAudit {
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
        let json = serde_json::to_string(&record)
            .map_err(|e| CronError::Backend(format!("failed to serialize dispatch record: {e}")))?;

        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(
                self.record_key(job_key, firing_instant),
                json,
                self.record_ttl.as_secs(),
            )
            .await?;
        Ok(())
    }

    async fn find(
        &self,
        job_key: &str,
        firing_instant: DateTime<Utc>,
    ) -> Result<Option<DispatchRecord>, CronError> {
        let mut conn = self.conn.clone();
        let json: Option<String> = conn.get(self.record_key(job_key, firing_instant)).await?;
        match json {
            Some(json) => {
                let record = serde_json::from_str(&json).map_err(|e| {
                    CronError::Backend(format!("corrupt dispatch record in redis: {e}"))
                })?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn dispatched(
        &self,
        job_key: &str,
        firing_instant: DateTime<Utc>,
    ) -> Result<bool, CronError> {
        let mut conn = self.conn.clone();
        Ok(conn
            .exists(self.record_key(job_key, firing_instant))
            .await?)
    }

    // cleanup: default no-op — record TTLs expire on their own.
}
