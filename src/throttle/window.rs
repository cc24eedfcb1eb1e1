//! Fixed-window request counter.

use std::time::Duration;
use tokio::time::Instant;

/// Counts requests in fixed windows of `period`. The window start only ever moves
/// forward by whole periods, so resets land exactly every `period`.
#[derive(Debug, Clone)]
pub struct RateWindow {
    limit: u32,
    period: Duration,
    count: u32,
    window_start: Instant,
}

impl RateWindow {
    pub fn new(limit: u32, period: Duration) -> Self {
        Self::starting_at(limit, period, Instant::now())
    }

    pub fn starting_at(limit: u32, period: Duration, start: Instant) -> Self {
        Self {
            limit: limit.max(1),
            period: period.max(Duration::from_millis(1)),
            count: 0,
            window_start: start,
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn set_limit(&mut self, limit: u32) {
        self.limit = limit.max(1);
    }

    /// Advance the window if `now` has passed its end. The counter is zeroed in the
    /// same step, so callers holding `&mut self` never observe a stale count.
    pub fn roll(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < self.period {
            return;
        }
        let periods = elapsed.as_nanos() / self.period.as_nanos();
        let advance = self.period.as_nanos().saturating_mul(periods);
        self.window_start += Duration::from_nanos(advance.min(u64::MAX as u128) as u64);
        self.count = 0;
    }

    /// Time left until `count < limit` holds, or `None` if a request may go now.
    pub fn blocked_for(&mut self, now: Instant) -> Option<Duration> {
        self.roll(now);
        if self.count < self.limit {
            None
        } else {
            Some((self.window_start + self.period).saturating_duration_since(now))
        }
    }

    pub fn record(&mut self, now: Instant) {
        self.roll(now);
        self.count = self.count.saturating_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eleventh_request_blocked_until_reset() {
        let start = Instant::now();
        let mut window = RateWindow::starting_at(10, Duration::from_secs(60), start);

        for _ in 0..10 {
            assert!(window.blocked_for(start).is_none());
            window.record(start);
        }
        let wait = window.blocked_for(start + Duration::from_secs(5));
        assert_eq!(wait, Some(Duration::from_secs(55)));

        let after = start + Duration::from_secs(60);
        assert!(window.blocked_for(after).is_none());
        assert_eq!(window.count(), 0);
    }

    #[test]
    fn test_window_start_advances_by_whole_periods() {
        let start = Instant::now();
        let mut window = RateWindow::starting_at(1, Duration::from_secs(10), start);
        window.record(start);

        // 25s later we are 5s into the third window
        let now = start + Duration::from_secs(25);
        window.record(now);
        assert_eq!(window.count(), 1);
        assert_eq!(window.blocked_for(now), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_limit_floor_is_one() {
        let mut window = RateWindow::new(0, Duration::from_secs(1));
        assert_eq!(window.limit(), 1);
        window.set_limit(0);
        assert_eq!(window.limit(), 1);
    }
}
