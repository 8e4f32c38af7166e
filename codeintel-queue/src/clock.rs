//! Injectable time source.
//!
//! Every component reads time through [`Clock`] instead of calling
//! `Utc::now()` directly, so timeouts, heartbeat ages and requeue delays can be
//! driven deterministically from tests with [`ManualClock`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::watch;

use crate::error::StoreError;

#[async_trait]
pub trait Clock: Send + Sync {
    /// Current time.
    fn now(&self) -> DateTime<Utc>;

    /// Resolve once `duration` has elapsed on this clock.
    async fn sleep(&self, duration: Duration);
}

/// Wall-clock time backed by tokio timers.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// A clock that only moves when told to.
///
/// Sleepers wake as soon as [`ManualClock::advance`] moves the current time
/// past their deadline.
#[derive(Debug)]
pub struct ManualClock {
    current: watch::Sender<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        let (current, _) = watch::channel(start);
        Self { current }
    }

    pub fn advance(&self, duration: Duration) {
        let delta = to_chrono(duration);
        self.current.send_modify(|now| *now += delta);
    }

    pub fn set(&self, time: DateTime<Utc>) {
        self.current.send_replace(time);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current.borrow()
    }

    async fn sleep(&self, duration: Duration) {
        let Some(deadline) = self.now().checked_add_signed(to_chrono(duration)) else {
            // Past the end of representable time: never wakes.
            return std::future::pending().await;
        };
        let mut rx = self.current.subscribe();
        // The sender lives as long as the clock, so this only fails if the
        // clock is dropped mid-sleep.
        let _ = rx.wait_for(|now| *now >= deadline).await;
    }
}

/// Convert a std duration, saturating at chrono's maximum.
pub fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

/// `base + duration`, or an error when the result is not a representable time.
pub fn checked_after(base: DateTime<Utc>, duration: Duration) -> Result<DateTime<Utc>, StoreError> {
    base.checked_add_signed(to_chrono(duration))
        .ok_or_else(|| StoreError::TimeOutOfRange(format!("{base} + {duration:?}")))
}

/// `base - duration`, or an error when the result is not a representable time.
pub fn checked_before(base: DateTime<Utc>, duration: Duration) -> Result<DateTime<Utc>, StoreError> {
    base.checked_sub_signed(to_chrono(duration))
        .ok_or_else(|| StoreError::TimeOutOfRange(format!("{base} - {duration:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_manual_clock_advance() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        clock.advance(Duration::from_secs(90));
        assert_eq!(clock.now() - start, chrono::Duration::seconds(90));
    }

    #[tokio::test]
    async fn test_manual_clock_sleep_wakes_on_advance() {
        let clock = Arc::new(ManualClock::default());
        let sleeper = {
            let clock = clock.clone();
            tokio::spawn(async move { clock.sleep(Duration::from_secs(10)).await })
        };

        tokio::task::yield_now().await;
        clock.advance(Duration::from_secs(5));
        tokio::task::yield_now().await;
        assert!(!sleeper.is_finished());

        clock.advance(Duration::from_secs(5));
        tokio::time::timeout(Duration::from_secs(1), sleeper)
            .await
            .expect("sleeper should wake")
            .unwrap();
    }

    #[test]
    fn test_checked_offsets_reject_overflow() {
        let now = Utc::now();
        assert_eq!(
            checked_after(now, Duration::from_secs(60)).unwrap(),
            now + chrono::Duration::seconds(60)
        );
        assert!(matches!(
            checked_after(now, Duration::from_secs(u64::MAX)),
            Err(StoreError::TimeOutOfRange(_))
        ));
        assert!(matches!(
            checked_before(now, Duration::from_secs(u64::MAX)),
            Err(StoreError::TimeOutOfRange(_))
        ));
    }
}
