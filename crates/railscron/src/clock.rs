use chrono::{DateTime, Utc};

/// Source of "now" for every component that reads time.
///
/// One trait, one operation — swap in [`FixedClock`] to make coordinator and
/// lease-expiry behavior fully deterministic in tests.
pub trait Clock: Send + Sync {
    fn now_utc(&self) -> DateTime<Utc>;
}

/// Zero-sized type — delegates to `Utc::now()`.
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Settable clock for tests. Clones share the same underlying instant.
#[cfg(any(test, feature = "test-support"))]
#[derive(Clone)]
pub struct FixedClock {
    now: std::sync::Arc<std::sync::Mutex<DateTime<Utc>>>,
}

#[cfg(any(test, feature = "test-support"))]
impl FixedClock {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now: std::sync::Arc::new(std::sync::Mutex::new(now)),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap() = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap();
        *now = *now + by;
    }
}

#[cfg(any(test, feature = "test-support"))]
impl Clock for FixedClock {
    fn now_utc(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_returns_current_time() {
        let before = Utc::now();
        let now = SystemClock.now_utc();
        let after = Utc::now();
        assert!(before <= now && now <= after);
    }

    #[test]
    fn fixed_clock_is_settable_and_shared() {
        let t0 = Utc::now();
        let clock = FixedClock::at(t0);
        let other = clock.clone();

        clock.advance(chrono::Duration::seconds(30));
        assert_eq!(other.now_utc(), t0 + chrono::Duration::seconds(30));

        other.set(t0);
        assert_eq!(clock.now_utc(), t0);
    }
}
