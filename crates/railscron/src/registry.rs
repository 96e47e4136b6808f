//! In-process job registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use crate::error::CronError;

/// What a callback receives for one firing.
#[derive(Debug, Clone)]
pub struct Firing {
    pub firing_instant: DateTime<Utc>,
    /// `{namespace}-{job_key}-{unix_seconds}` — stable across re-dispatch
    /// attempts, for downstream deduplication.
    pub idempotency_key: String,
}

/// Callbacks run on the coordinator worker and are expected to enqueue work
/// elsewhere and return quickly.
pub type JobCallback = Arc<dyn Fn(Firing) + Send + Sync>;

/// Immutable once registered. Holds the raw expression string; parsing
/// happens per tick so one job's bad expression never poisons registration
/// of the rest.
#[derive(Clone)]
pub struct Job {
    pub key: String,
    pub expression: String,
    pub callback: JobCallback,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("key", &self.key)
            .field("expression", &self.expression)
            .finish_non_exhaustive()
    }
}

/// Thread-safe `job_key -> Job` map.
///
/// Iteration is snapshot-then-yield: the snapshot is taken under the lock,
/// the yielding happens without it, so callbacks may mutate the registry
/// without deadlocking.
#[derive(Default)]
pub struct JobRegistry {
    jobs: Mutex<HashMap<String, Job>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job. Rejects empty keys, empty expressions, and keys that
    /// are already present.
    pub fn add(&self, job: Job) -> Result<(), CronError> {
        if job.key.trim().is_empty() {
            return Err(CronError::Registration("job key must not be empty".into()));
        }
        if job.expression.trim().is_empty() {
            return Err(CronError::Registration(format!(
                "job '{}' has an empty cron expression",
                job.key
            )));
        }

        let mut jobs = self.jobs.lock().unwrap();
        if jobs.contains_key(&job.key) {
            return Err(CronError::Registration(format!(
                "job '{}' is already registered",
                job.key
            )));
        }
        jobs.insert(job.key.clone(), job);
        Ok(())
    }

    /// Remove and return a job. `None` if absent.
    pub fn remove(&self, key: &str) -> Option<Job> {
        self.jobs.lock().unwrap().remove(key)
    }

    pub fn find(&self, key: &str) -> Option<Job> {
        self.jobs.lock().unwrap().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.jobs.lock().unwrap().contains_key(key)
    }

    /// Snapshot of all jobs, sorted by key for deterministic iteration order.
    pub fn all(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.lock().unwrap().values().cloned().collect();
        jobs.sort_by(|a, b| a.key.cmp(&b.key));
        jobs
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.jobs.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.jobs.lock().unwrap().clear();
    }

    /// Visit a snapshot of the registry. The lock is not held while `f` runs.
    pub fn each<F: FnMut(&Job)>(&self, mut f: F) {
        for job in self.all() {
            f(&job);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(key: &str) -> Job {
        Job {
            key: key.to_string(),
            expression: "* * * * *".to_string(),
            callback: Arc::new(|_| {}),
        }
    }

    #[test]
    fn add_and_find() {
        let registry = JobRegistry::new();
        registry.add(job("a")).unwrap();

        assert!(registry.contains("a"));
        assert_eq!(registry.find("a").unwrap().expression, "* * * * *");
        assert!(registry.find("missing").is_none());
    }

    #[test]
    fn duplicate_key_is_rejected() {
        let registry = JobRegistry::new();
        registry.add(job("a")).unwrap();

        let err = registry.add(job("a")).unwrap_err();
        assert!(matches!(err, CronError::Registration(_)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn empty_key_and_expression_are_rejected() {
        let registry = JobRegistry::new();
        assert!(registry.add(job("  ")).is_err());

        let mut no_expr = job("b");
        no_expr.expression = "".to_string();
        assert!(registry.add(no_expr).is_err());
    }

    #[test]
    fn remove_returns_the_job() {
        let registry = JobRegistry::new();
        registry.add(job("a")).unwrap();

        assert_eq!(registry.remove("a").unwrap().key, "a");
        assert!(registry.remove("a").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn all_is_a_sorted_snapshot() {
        let registry = JobRegistry::new();
        registry.add(job("b")).unwrap();
        registry.add(job("a")).unwrap();
        registry.add(job("c")).unwrap();

        let keys: Vec<String> = registry.all().into_iter().map(|j| j.key).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
        assert_eq!(registry.keys(), vec!["a", "b", "c"]);
    }

    #[test]
    fn each_allows_mutation_from_the_callback() {
        let registry = Arc::new(JobRegistry::new());
        registry.add(job("a")).unwrap();
        registry.add(job("b")).unwrap();

        // Unregistering from inside the visitor must not deadlock.
        let inner = Arc::clone(&registry);
        registry.each(|j| {
            inner.remove(&j.key);
        });
        assert!(registry.is_empty());
    }

    #[test]
    fn clear_empties_the_registry() {
        let registry = JobRegistry::new();
        registry.add(job("a")).unwrap();
        registry.clear();
        assert!(registry.is_empty());
    }
}
