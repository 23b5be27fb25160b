//! Clock & Timers
//!
//! The only source of "time has passed" for the rest of the core. Every other
//! component depends on `Arc<dyn Clock>` rather than calling `Utc::now()` or
//! `tokio::time::sleep` directly, so scheduler and quota back-off behavior can
//! be driven deterministically in tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Abstract wall-clock + timer source.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;

    /// Suspend the caller until `deadline` is reached (or already past).
    async fn sleep_until(&self, deadline: DateTime<Utc>);

    /// Suspend the caller for `duration`.
    async fn sleep(&self, duration: Duration) {
        self.sleep_until(self.now() + chrono::Duration::from_std(duration).unwrap_or_default())
            .await;
    }
}

/// Real clock backed by the system time and `tokio::time`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep_until(&self, deadline: DateTime<Utc>) {
        let now = Utc::now();
        if deadline <= now {
            return;
        }
        let remaining = (deadline - now)
            .to_std()
            .unwrap_or(Duration::from_secs(0));
        tokio::time::sleep(remaining).await;
    }
}

/// Manually-advanced clock for deterministic tests.
///
/// `sleep_until` resolves as soon as `advance`/`set` moves `now()` past the
/// requested deadline — there is no dependency on wall-clock time at all.
pub struct TestClock {
    now_millis: AtomicI64,
    notify: Notify,
}

impl TestClock {
    /// Create a test clock starting at the given time.
    pub fn new(start: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self {
            now_millis: AtomicI64::new(start.timestamp_millis()),
            notify: Notify::new(),
        })
    }

    /// Move the clock forward by `duration` and wake any sleepers.
    pub fn advance(&self, duration: Duration) {
        self.now_millis
            .fetch_add(duration.as_millis() as i64, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Jump the clock to an absolute time and wake any sleepers.
    pub fn set(&self, time: DateTime<Utc>) {
        self.now_millis.store(time.timestamp_millis(), Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

#[async_trait]
impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.now_millis.load(Ordering::SeqCst))
            .unwrap_or_else(Utc::now)
    }

    async fn sleep_until(&self, deadline: DateTime<Utc>) {
        loop {
            if self.now() >= deadline {
                return;
            }
            self.notify.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test]
    async fn system_clock_sleep_until_past_deadline_returns_immediately() {
        let clock = SystemClock;
        let past = clock.now() - chrono::Duration::seconds(10);
        clock.sleep_until(past).await; // must not hang
    }

    #[tokio::test]
    async fn test_clock_advance_wakes_sleeper() {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let clock = TestClock::new(start);
        let deadline = start + chrono::Duration::minutes(15);

        let clock2 = clock.clone();
        let waiter = tokio::spawn(async move {
            clock2.sleep_until(deadline).await;
        });

        tokio::task::yield_now().await;
        clock.advance(Duration::from_secs(15 * 60));
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("sleeper should have woken")
            .unwrap();
    }

    #[tokio::test]
    async fn test_clock_set_jumps_to_absolute_time() {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let clock = TestClock::new(start);
        let later = start + chrono::Duration::hours(1);
        clock.set(later);
        assert_eq!(clock.now(), later);
    }
}
