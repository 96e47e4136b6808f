#[derive(Debug)]
pub enum CronError {
    /// Invalid configuration detected by [`SchedulerConfig::validate`](crate::SchedulerConfig::validate).
    Configuration(String),
    /// A cron expression failed to parse. The coordinator logs this and skips
    /// the job for the tick; other jobs are unaffected.
    InvalidExpression { expr: String, reason: String },
    /// A lease or audit backend failed (Redis timeout, SQL error, …). The
    /// coordinator treats this as "did not acquire" / "did not log".
    Backend(String),
    /// Rejected job registration (duplicate key, empty key or expression).
    Registration(String),
}

impl std::fmt::Display for CronError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Configuration(msg) => write!(f, "Configuration error: {msg}"),
            Self::InvalidExpression { expr, reason } => {
                write!(f, "Invalid cron expression '{expr}': {reason}")
            }
            Self::Backend(msg) => write!(f, "Backend error: {msg}"),
            Self::Registration(msg) => write!(f, "Registration error: {msg}"),
        }
    }
}

impl std::error::Error for CronError {}

#[cfg(feature = "redis-backend")]
impl From<redis::RedisError> for CronError {
    fn from(e: redis::RedisError) -> Self {
        Self::Backend(e.to_string())
    }
}

#[cfg(feature = "sql-backend")]
impl From<sqlx::Error> for CronError {
    fn from(e: sqlx::Error) -> Self {
        Self::Backend(e.to_string())
    }
}
