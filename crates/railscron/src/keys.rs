//! Deterministic lock-key and idempotency-key derivation.
//!
//! Both keys embed the firing instant as Unix seconds, so they are stable
//! across time-zone reconfiguration: historical audit rows and downstream
//! dedup state stay valid when the evaluation zone changes.

use chrono::{DateTime, Utc};

pub const LOCK_KEY_TAG: &str = "dispatch";

/// Mutual-exclusion key for one firing of one job:
/// `{namespace}:dispatch:{job_key}:{unix_seconds}`.
pub fn lock_key(namespace: &str, job_key: &str, firing_instant: DateTime<Utc>) -> String {
    format!(
        "{namespace}:{LOCK_KEY_TAG}:{job_key}:{}",
        firing_instant.timestamp()
    )
}

/// Key handed to the user callback for downstream deduplication:
/// `{namespace}-{job_key}-{unix_seconds}`.
pub fn idempotency_key(namespace: &str, job_key: &str, firing_instant: DateTime<Utc>) -> String {
    format!("{namespace}-{job_key}-{}", firing_instant.timestamp())
}

/// A lock key decomposed back into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLockKey {
    pub namespace: String,
    pub job_key: String,
    pub unix_seconds: i64,
}

/// Parse a lock key produced by [`lock_key`].
///
/// Job keys may themselves contain `:`, so the trailing numeric field is the
/// timestamp and everything between the `dispatch` tag and that field is the
/// job key.
pub fn parse_lock_key(key: &str) -> Option<ParsedLockKey> {
    let (head, ts) = key.rsplit_once(':')?;
    let unix_seconds: i64 = ts.parse().ok()?;
    let (namespace, job_key) = head.split_once(':')?;
    let job_key = job_key.strip_prefix(LOCK_KEY_TAG)?.strip_prefix(':')?;
    if namespace.is_empty() || job_key.is_empty() {
        return None;
    }
    Some(ParsedLockKey {
        namespace: namespace.to_string(),
        job_key: job_key.to_string(),
        unix_seconds,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn instant(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn lock_key_shape() {
        assert_eq!(
            lock_key("railscron", "m", instant(1735689600)),
            "railscron:dispatch:m:1735689600"
        );
    }

    #[test]
    fn idempotency_key_shape() {
        assert_eq!(
            idempotency_key("railscron", "m", instant(1735689540)),
            "railscron-m-1735689540"
        );
    }

    #[test]
    fn keys_are_zone_independent() {
        // Same instant expressed in different zones hashes identically.
        let utc = instant(1735689600);
        let ny = utc.with_timezone(&chrono_tz::America::New_York);
        assert_eq!(
            idempotency_key("ns", "j", utc),
            idempotency_key("ns", "j", ny.with_timezone(&Utc)),
        );
    }

    #[test]
    fn keys_differ_per_second() {
        assert_ne!(
            idempotency_key("ns", "j", instant(100)),
            idempotency_key("ns", "j", instant(101)),
        );
    }

    #[test]
    fn parse_round_trips() {
        let key = lock_key("railscron", "billing.invoices", instant(1735689600));
        let parsed = parse_lock_key(&key).unwrap();
        assert_eq!(parsed.namespace, "railscron");
        assert_eq!(parsed.job_key, "billing.invoices");
        assert_eq!(parsed.unix_seconds, 1735689600);
    }

    #[test]
    fn parse_job_key_containing_colons() {
        let key = lock_key("ns", "tenant:42:report", instant(7));
        let parsed = parse_lock_key(&key).unwrap();
        assert_eq!(parsed.job_key, "tenant:42:report");
        assert_eq!(parsed.unix_seconds, 7);
    }

    #[test]
    fn parse_rejects_malformed_keys() {
        assert!(parse_lock_key("no-separators").is_none());
        assert!(parse_lock_key("ns:dispatch:job:not-a-number").is_none());
        assert!(parse_lock_key("ns:other:job:123").is_none());
        assert!(parse_lock_key("ns:dispatch::123").is_none());
    }
}
