//! Billing time windows

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Half-open billing window: access runs from `start` until `end` passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    /// Window start
    pub start: DateTime<Utc>,
    /// Window end (paid-through / trial-through instant)
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    /// Create a window from explicit bounds
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Window starting at `start` and running for `days` days
    pub fn for_days(start: DateTime<Utc>, days: i64) -> Self {
        Self {
            start,
            end: start + Duration::days(days),
        }
    }

    /// True while `now` has not reached `end`
    pub fn is_current(&self, now: DateTime<Utc>) -> bool {
        now < self.end
    }

    /// True once `now` has passed `end`
    pub fn has_passed(&self, now: DateTime<Utc>) -> bool {
        now >= self.end
    }

    /// Whole days left until `end`, never negative
    pub fn days_remaining(&self, now: DateTime<Utc>) -> i64 {
        (self.end - now).num_days().max(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_for_days() {
        let start = Utc::now();
        let window = TimeWindow::for_days(start, 30);

        assert!(window.is_current(start));
        assert!(window.is_current(start + Duration::days(29)));
        assert!(window.has_passed(start + Duration::days(30)));
    }

    #[test]
    fn test_days_remaining_floors_at_zero() {
        let start = Utc::now() - Duration::days(10);
        let window = TimeWindow::for_days(start, 7);

        assert_eq!(window.days_remaining(Utc::now()), 0);
    }

    #[test]
    fn test_days_remaining_counts_down() {
        let now = Utc::now();
        let window = TimeWindow::for_days(now, 30);

        assert_eq!(window.days_remaining(now + Duration::days(10)), 20);
    }
}
