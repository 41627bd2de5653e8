//! Platform Configuration

use chrono::Duration;
use studio_common::RetryPolicy;

/// Tunables for the entitlement platform
#[derive(Debug, Clone)]
pub struct EntitlementConfig {
    /// Length of the evaluation window granted at first authentication
    pub trial_days: i64,
    /// How long past-due accounts keep access after the paid-through date
    pub grace_period: Duration,
    /// Clock skew tolerated before a provider event counts as stale
    pub skew_tolerance: Duration,
    /// Reconcile attempts before surfacing a conflict
    pub max_reconcile_attempts: u32,
    /// Bound on waiting for the per-account lock
    pub lock_timeout: std::time::Duration,
    /// How old a record may be and still be trusted during provider outages
    pub max_record_staleness: Duration,
    /// How long processed-event records are kept before pruning
    pub ledger_retention: Duration,
    /// Backoff for transient storage failures
    pub retry: RetryPolicy,
}

impl Default for EntitlementConfig {
    fn default() -> Self {
        Self {
            trial_days: 7,
            grace_period: Duration::days(14),
            skew_tolerance: Duration::minutes(5),
            max_reconcile_attempts: 3,
            lock_timeout: std::time::Duration::from_secs(5),
            max_record_staleness: Duration::days(30),
            ledger_retention: Duration::days(90),
            retry: RetryPolicy::default(),
        }
    }
}

impl EntitlementConfig {
    /// Override the trial length
    pub fn with_trial_days(mut self, days: i64) -> Self {
        self.trial_days = days;
        self
    }

    /// Override the past-due grace period
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    /// Override the per-account lock wait bound
    pub fn with_lock_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Override the outage trust horizon
    pub fn with_max_record_staleness(mut self, staleness: Duration) -> Self {
        self.max_record_staleness = staleness;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EntitlementConfig::default();

        assert_eq!(config.trial_days, 7);
        assert_eq!(config.grace_period, Duration::days(14));
        assert_eq!(config.max_reconcile_attempts, 3);
    }

    #[test]
    fn test_builders() {
        let config = EntitlementConfig::default()
            .with_trial_days(14)
            .with_grace_period(Duration::days(3));

        assert_eq!(config.trial_days, 14);
        assert_eq!(config.grace_period, Duration::days(3));
    }
}
