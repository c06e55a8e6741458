//! Clocks and the deterministic periodic-task abstraction.
//!
//! Components never read the wall clock themselves. They take a
//! [`NaiveDateTime`] from an injected [`Clock`] and ask a [`Ticker`] whether
//! their periodic work is due, which lets tests drive ticks by advancing a
//! [`ManualClock`].

use std::sync::Mutex;

use chrono::{Duration, Local, NaiveDateTime};

/// Source of local wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

/// Reads the system's local time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<NaiveDateTime>,
}

impl ManualClock {
    pub fn new(start: NaiveDateTime) -> Self {
        Self { now: Mutex::new(start) }
    }

    pub fn set(&self, now: NaiveDateTime) {
        let mut guard = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *guard = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *guard += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> NaiveDateTime {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A periodic task's schedule.
///
/// A stopped ticker never fires. `start` arms it; `poll` returns `true` at
/// most once per elapsed period and re-arms relative to the poll time, so a
/// late poll does not cause a burst of catch-up ticks.
/// Longest period a [`Ticker`] accepts. Longer periods are clamped.
pub const MAX_PERIOD_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Debug, Clone)]
pub struct Ticker {
    period: Duration,
    next_due: Option<NaiveDateTime>,
}

impl Ticker {
    pub fn new(period: Duration) -> Self {
        Self { period, next_due: None }
    }

    /// Period in whole seconds, clamped to [`MAX_PERIOD_SECS`].
    pub fn from_secs(secs: u64) -> Self {
        Self::new(Duration::seconds(secs.min(MAX_PERIOD_SECS) as i64))
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn is_running(&self) -> bool {
        self.next_due.is_some()
    }

    pub fn next_due(&self) -> Option<NaiveDateTime> {
        self.next_due
    }

    /// Arm the ticker so the first tick fires on the first poll at or after `now`.
    pub fn start_immediate(&mut self, now: NaiveDateTime) {
        self.next_due = Some(now);
    }

    /// Arm the ticker so the first tick fires one period after `now`.
    pub fn start_delayed(&mut self, now: NaiveDateTime) {
        self.next_due = Some(now + self.period);
    }

    /// Disarm. Stopping a stopped ticker is a no-op.
    pub fn stop(&mut self) {
        self.next_due = None;
    }

    /// Change the period. A running ticker is re-armed one new period from `now`.
    pub fn reschedule(&mut self, period: Duration, now: NaiveDateTime) {
        self.period = period;
        if self.next_due.is_some() {
            self.next_due = Some(now + period);
        }
    }

    /// Returns `true` if a tick is due at `now`, and schedules the next one.
    pub fn poll(&mut self, now: NaiveDateTime) -> bool {
        match self.next_due {
            Some(due) if now >= due => {
                self.next_due = Some(now + self.period);
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn t0() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 6)
            .and_then(|d| d.and_hms_opt(8, 0, 0))
            .unwrap()
    }

    #[test]
    fn test_oversized_period_is_clamped() {
        let mut ticker = Ticker::from_secs(u64::MAX);
        assert_eq!(ticker.period(), Duration::days(7));
        ticker.start_delayed(t0());
        assert!(!ticker.poll(t0() + Duration::days(6)));
        assert!(ticker.poll(t0() + Duration::days(7)));
    }

    #[test]
    fn test_stopped_ticker_never_fires() {
        let mut ticker = Ticker::from_secs(60);
        assert!(!ticker.poll(t0()));
        assert!(!ticker.poll(t0() + Duration::hours(5)));
    }

    #[test]
    fn test_immediate_then_periodic() {
        let mut ticker = Ticker::from_secs(60);
        ticker.start_immediate(t0());
        assert!(ticker.poll(t0()));
        assert!(!ticker.poll(t0() + Duration::seconds(59)));
        assert!(ticker.poll(t0() + Duration::seconds(60)));
        assert!(!ticker.poll(t0() + Duration::seconds(61)));
    }

    #[test]
    fn test_delayed_start() {
        let mut ticker = Ticker::from_secs(300);
        ticker.start_delayed(t0());
        assert!(!ticker.poll(t0()));
        assert!(ticker.poll(t0() + Duration::seconds(300)));
    }

    #[test]
    fn test_late_poll_does_not_burst() {
        let mut ticker = Ticker::from_secs(60);
        ticker.start_immediate(t0());
        assert!(ticker.poll(t0() + Duration::minutes(10)));
        assert!(!ticker.poll(t0() + Duration::minutes(10) + Duration::seconds(1)));
    }

    #[test]
    fn test_stop_is_idempotent() {
        let mut ticker = Ticker::from_secs(60);
        ticker.start_immediate(t0());
        ticker.stop();
        ticker.stop();
        assert!(!ticker.is_running());
        assert!(!ticker.poll(t0() + Duration::hours(1)));
    }

    #[test]
    fn test_reschedule_running() {
        let mut ticker = Ticker::from_secs(300);
        ticker.start_delayed(t0());
        ticker.reschedule(Duration::seconds(600), t0());
        assert!(!ticker.poll(t0() + Duration::seconds(300)));
        assert!(ticker.poll(t0() + Duration::seconds(600)));
    }

    #[test]
    fn test_manual_clock_advance() {
        let clock = ManualClock::new(t0());
        clock.advance(Duration::minutes(5));
        assert_eq!(clock.now(), t0() + Duration::minutes(5));
    }
}
