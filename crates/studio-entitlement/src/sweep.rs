//! Expiry Sweeper
//!
//! Scheduled pass expiring every account whose access horizon has passed:
//! lapsed trials, canceled subscriptions past the paid-through date, and
//! past-due subscriptions past the grace period. The scheduler that
//! triggers `run_once` is external.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use studio_common::AccountId;

use crate::config::EntitlementConfig;
use crate::engine::ReconciliationEngine;
use crate::model::{ProviderEvent, Tier};
use crate::store::EntitlementStore;
use crate::EntitlementError;

/// Result of one sweep pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// When the pass ran
    pub ran_at: DateTime<Utc>,
    /// Accounts the store reported as due
    pub scanned: usize,
    /// Accounts transitioned to expired
    pub expired: usize,
    /// Accounts whose reconcile failed, with the error text
    pub failures: Vec<(AccountId, String)>,
}

/// Scheduled expiry pass over the entitlement store
pub struct ExpirySweeper {
    config: EntitlementConfig,
    store: Arc<dyn EntitlementStore>,
    engine: Arc<ReconciliationEngine>,
    last_report: RwLock<Option<SweepReport>>,
}

impl ExpirySweeper {
    /// Sweeper funneling due accounts through the engine
    pub fn new(
        config: EntitlementConfig,
        store: Arc<dyn EntitlementStore>,
        engine: Arc<ReconciliationEngine>,
    ) -> Self {
        Self {
            config,
            store,
            engine,
            last_report: RwLock::new(None),
        }
    }

    /// Run one pass at `now`.
    ///
    /// Per-account failures are collected in the report and never abort
    /// the rest of the pass.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<SweepReport, EntitlementError> {
        let due = self
            .store
            .accounts_due_for_sweep(now, self.config.grace_period)
            .await?;

        let mut report = SweepReport {
            ran_at: now,
            scanned: due.len(),
            expired: 0,
            failures: Vec::new(),
        };

        for account_id in due {
            match self
                .engine
                .reconcile(ProviderEvent::expiry_sweep(account_id, now))
                .await
            {
                Ok(outcome) if outcome.tier == Tier::Expired => report.expired += 1,
                Ok(_) => {} // another writer got there first; nothing to do
                Err(err) => {
                    tracing::warn!("sweep failed for account {}: {}", account_id, err);
                    report.failures.push((account_id, err.to_string()));
                }
            }
        }

        tracing::info!(
            "expiry sweep: {} due, {} expired, {} failed",
            report.scanned,
            report.expired,
            report.failures.len()
        );
        *self.last_report.write() = Some(report.clone());
        Ok(report)
    }

    /// Report of the most recent pass, if one ran
    pub fn last_report(&self) -> Option<SweepReport> {
        self.last_report.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abuse::AbuseDetector;
    use crate::ledger::IdempotencyLedger;
    use crate::model::AccountEntitlement;
    use crate::notify::EntitlementNotifier;
    use crate::serializer::AccountSerializer;
    use crate::store::MemoryEntitlementStore;
    use chrono::Duration;
    use studio_common::TimeWindow;
    use uuid::Uuid;

    fn sweeper_over(store: Arc<MemoryEntitlementStore>) -> ExpirySweeper {
        let config = EntitlementConfig::default();
        let engine = Arc::new(ReconciliationEngine::new(
            config.clone(),
            store.clone(),
            Arc::new(IdempotencyLedger::new()),
            Arc::new(AccountSerializer::new(config.lock_timeout)),
            Arc::new(AbuseDetector::new()),
            Arc::new(EntitlementNotifier::new()),
        ));
        ExpirySweeper::new(config, store, engine)
    }

    async fn seed(store: &MemoryEntitlementStore, record: AccountEntitlement) {
        store.compare_and_put(record, 0).await.unwrap();
    }

    fn canceled_past_horizon(now: DateTime<Utc>) -> AccountEntitlement {
        let mut record = AccountEntitlement::new_trial(Uuid::new_v4(), now, 7);
        record.tier = Tier::CanceledActive;
        record.trial_window = None;
        record.external_subscription_ref = Some("sub_1".into());
        record.subscription_window = Some(TimeWindow::for_days(now - Duration::days(45), 30));
        record.version = 1;
        record
    }

    #[tokio::test]
    async fn test_sweep_expires_due_accounts_only() {
        let store = Arc::new(MemoryEntitlementStore::new());
        let now = Utc::now();

        let due = canceled_past_horizon(now);
        let due_id = due.account_id;
        seed(&store, due).await;

        let mut current = AccountEntitlement::new_trial(Uuid::new_v4(), now, 7);
        current.version = 1;
        let current_id = current.account_id;
        seed(&store, current).await;

        let sweeper = sweeper_over(store.clone());
        let report = sweeper.run_once(now).await.unwrap();

        assert_eq!(report.scanned, 1);
        assert_eq!(report.expired, 1);
        assert!(report.failures.is_empty());

        assert_eq!(store.load(due_id).await.unwrap().unwrap().tier, Tier::Expired);
        assert_eq!(store.load(current_id).await.unwrap().unwrap().tier, Tier::Trial);
    }

    #[tokio::test]
    async fn test_sweep_with_nothing_due() {
        let store = Arc::new(MemoryEntitlementStore::new());
        let now = Utc::now();

        let mut record = AccountEntitlement::new_trial(Uuid::new_v4(), now, 7);
        record.version = 1;
        seed(&store, record).await;

        let sweeper = sweeper_over(store);
        let report = sweeper.run_once(now).await.unwrap();

        assert_eq!(report.scanned, 0);
        assert_eq!(report.expired, 0);
    }

    #[tokio::test]
    async fn test_last_report_is_retained() {
        let store = Arc::new(MemoryEntitlementStore::new());
        let now = Utc::now();
        seed(&store, canceled_past_horizon(now)).await;

        let sweeper = sweeper_over(store);
        assert!(sweeper.last_report().is_none());

        let report = sweeper.run_once(now).await.unwrap();
        assert_eq!(sweeper.last_report(), Some(report));
    }

    #[tokio::test]
    async fn test_past_due_expires_only_after_grace() {
        let store = Arc::new(MemoryEntitlementStore::new());
        let now = Utc::now();

        // paid-through 20 days ago, past the 14-day grace
        let mut lapsed = canceled_past_horizon(now);
        lapsed.tier = Tier::PastDue;
        lapsed.subscription_window = Some(TimeWindow::for_days(now - Duration::days(50), 30));
        let lapsed_id = lapsed.account_id;
        seed(&store, lapsed).await;

        // paid-through 5 days ago, still inside grace
        let mut graced = canceled_past_horizon(now);
        graced.tier = Tier::PastDue;
        graced.subscription_window = Some(TimeWindow::for_days(now - Duration::days(35), 30));
        let graced_id = graced.account_id;
        seed(&store, graced).await;

        let sweeper = sweeper_over(store.clone());
        let report = sweeper.run_once(now).await.unwrap();

        assert_eq!(report.scanned, 1);
        assert_eq!(report.expired, 1);
        assert_eq!(store.load(lapsed_id).await.unwrap().unwrap().tier, Tier::Expired);
        assert_eq!(store.load(graced_id).await.unwrap().unwrap().tier, Tier::PastDue);
    }
}
