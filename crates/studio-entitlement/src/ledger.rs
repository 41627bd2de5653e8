//! Idempotency Ledger
//!
//! Records which provider deliveries have already been applied so repeats
//! return the originally computed outcome without touching state.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use studio_common::{AccountId, EventId};
use thiserror::Error;

use crate::model::EntitlementOutcome;

/// Record of one applied provider event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedEvent {
    /// Provider delivery id
    pub event_id: EventId,
    /// Account the event was applied to
    pub account_id: AccountId,
    /// When the event was applied
    pub applied_at: DateTime<Utc>,
    /// Record version after application
    pub resulting_version: u64,
    /// Outcome computed on first application, replayed on redelivery
    pub outcome: EntitlementOutcome,
}

/// Ledger error
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The event id is already recorded
    #[error("event already processed: {0}")]
    AlreadyProcessed(EventId),
}

/// Applied-event registry keyed by provider delivery id
pub struct IdempotencyLedger {
    entries: DashMap<EventId, ProcessedEvent>,
}

impl IdempotencyLedger {
    /// Empty ledger
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Whether the event id has already been applied
    pub fn has_processed(&self, event_id: &EventId) -> bool {
        self.entries.contains_key(event_id)
    }

    /// Stored outcome for a previously applied event
    pub fn outcome_for(&self, event_id: &EventId) -> Option<EntitlementOutcome> {
        self.entries.get(event_id).map(|e| e.outcome.clone())
    }

    /// Record an applied event.
    ///
    /// Fails with [`LedgerError::AlreadyProcessed`] when the id is taken;
    /// callers that checked first may treat that as a benign race.
    pub fn mark_processed(&self, record: ProcessedEvent) -> Result<(), LedgerError> {
        match self.entries.entry(record.event_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(LedgerError::AlreadyProcessed(record.event_id))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                tracing::debug!(
                    "ledger: recorded event {} for account {} at version {}",
                    record.event_id,
                    record.account_id,
                    record.resulting_version
                );
                slot.insert(record);
                Ok(())
            }
        }
    }

    /// Drop entries applied before `cutoff`; returns how many were removed
    pub fn prune(&self, cutoff: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, record| record.applied_at >= cutoff);
        before - self.entries.len()
    }

    /// Number of recorded events
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing has been recorded
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for IdempotencyLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AccessReason, Tier};
    use chrono::Duration;
    use uuid::Uuid;

    fn processed(event_id: &str, applied_at: DateTime<Utc>) -> ProcessedEvent {
        let account_id = Uuid::new_v4();
        ProcessedEvent {
            event_id: event_id.to_string(),
            account_id,
            applied_at,
            resulting_version: 1,
            outcome: EntitlementOutcome {
                account_id,
                tier: Tier::Active,
                subscription_window: None,
                days_remaining: Some(30),
                version: 1,
                degraded: false,
                access_granted: true,
                reason: AccessReason::Subscribed,
            },
        }
    }

    #[test]
    fn test_mark_and_replay() {
        let ledger = IdempotencyLedger::new();
        let record = processed("evt_1", Utc::now());

        assert!(!ledger.has_processed(&"evt_1".to_string()));
        ledger.mark_processed(record.clone()).unwrap();

        assert!(ledger.has_processed(&"evt_1".to_string()));
        assert_eq!(ledger.outcome_for(&"evt_1".to_string()), Some(record.outcome));
    }

    #[test]
    fn test_duplicate_mark_rejected() {
        let ledger = IdempotencyLedger::new();
        ledger.mark_processed(processed("evt_1", Utc::now())).unwrap();

        let err = ledger.mark_processed(processed("evt_1", Utc::now()));
        assert!(matches!(err, Err(LedgerError::AlreadyProcessed(_))));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_prune_respects_cutoff() {
        let ledger = IdempotencyLedger::new();
        let now = Utc::now();
        ledger.mark_processed(processed("evt_old", now - Duration::days(120))).unwrap();
        ledger.mark_processed(processed("evt_new", now)).unwrap();

        let removed = ledger.prune(now - Duration::days(90));

        assert_eq!(removed, 1);
        assert!(!ledger.has_processed(&"evt_old".to_string()));
        assert!(ledger.has_processed(&"evt_new".to_string()));
    }
}
