//! Reconciliation Engine
//!
//! Turns an inbound billing event, a manual reactivation request, or a
//! scheduled sweep into a new entitlement record. Sole writer of the
//! entitlement store. Idempotent per delivery id, serialized per account,
//! and defended against out-of-order delivery by the provider timestamp.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use studio_common::{retry_transient, AccountId};

use crate::abuse::AbuseDetector;
use crate::config::EntitlementConfig;
use crate::ledger::{IdempotencyLedger, LedgerError, ProcessedEvent};
use crate::model::{AccountEntitlement, EntitlementOutcome, EventKind, ProviderEvent, Tier};
use crate::notify::{EntitlementChanged, EntitlementNotifier};
use crate::serializer::AccountSerializer;
use crate::store::{EntitlementStore, StoreError};
use crate::EntitlementError;

/// Entitlement state-machine driver
pub struct ReconciliationEngine {
    config: EntitlementConfig,
    store: Arc<dyn EntitlementStore>,
    ledger: Arc<IdempotencyLedger>,
    serializer: Arc<AccountSerializer>,
    abuse: Arc<AbuseDetector>,
    notifier: Arc<EntitlementNotifier>,
}

impl ReconciliationEngine {
    /// Engine over the given collaborators
    pub fn new(
        config: EntitlementConfig,
        store: Arc<dyn EntitlementStore>,
        ledger: Arc<IdempotencyLedger>,
        serializer: Arc<AccountSerializer>,
        abuse: Arc<AbuseDetector>,
        notifier: Arc<EntitlementNotifier>,
    ) -> Self {
        Self {
            config,
            store,
            ledger,
            serializer,
            abuse,
            notifier,
        }
    }

    /// Reconcile one event into the account's entitlement record.
    ///
    /// A redelivered event id replays the outcome computed on first
    /// application without touching state. Everything else runs inside the
    /// account's exclusive section: load, transition, versioned commit,
    /// ledger write, advisory abuse observation, change notification.
    pub async fn reconcile(
        &self,
        event: ProviderEvent,
    ) -> Result<EntitlementOutcome, EntitlementError> {
        if let Some(event_id) = &event.event_id {
            if let Some(outcome) = self.ledger.outcome_for(event_id) {
                tracing::debug!("event {} already applied, replaying outcome", event_id);
                return Ok(outcome);
            }
        }

        let account_id = event.account_id;
        self.serializer
            .with_lock(account_id, || self.reconcile_locked(event))
            .await?
    }

    /// Create the default trial record at first authentication; idempotent.
    pub async fn ensure_account(
        &self,
        account_id: AccountId,
    ) -> Result<EntitlementOutcome, EntitlementError> {
        self.serializer
            .with_lock(account_id, || async move {
                let now = Utc::now();
                let grace = self.config.grace_period;

                if let Some(existing) = self.load_with_retry(account_id).await? {
                    return Ok(existing.evaluate(now, grace, false));
                }

                let mut record =
                    AccountEntitlement::new_trial(account_id, now, self.config.trial_days);
                record.version = 1;

                let put = retry_transient(self.config.retry, StoreError::is_transient, || {
                    self.store.compare_and_put(record.clone(), 0)
                })
                .await;

                match put {
                    Ok(()) => {
                        tracing::info!(
                            "account {} bootstrapped with a {}-day trial",
                            account_id,
                            self.config.trial_days
                        );
                        self.notifier.publish(EntitlementChanged {
                            account_id,
                            version: record.version,
                            tier: record.tier,
                        });
                        Ok(record.evaluate(now, grace, false))
                    }
                    Err(StoreError::VersionConflict { .. }) => {
                        // another caller bootstrapped first; serve what won
                        let existing = self.load_with_retry(account_id).await?.ok_or_else(|| {
                            EntitlementError::Store("record missing after create race".into())
                        })?;
                        Ok(existing.evaluate(now, grace, false))
                    }
                    Err(StoreError::Unavailable(msg)) => Err(EntitlementError::Store(msg)),
                }
            })
            .await?
    }

    /// Privileged operator path: grant unconditional access.
    ///
    /// Bypasses the state-machine table but still serializes per account
    /// and commits through the versioned store.
    pub async fn set_admin_override(
        &self,
        account_id: AccountId,
    ) -> Result<EntitlementOutcome, EntitlementError> {
        self.serializer
            .with_lock(account_id, || async move {
                let now = Utc::now();
                let grace = self.config.grace_period;
                let current = self
                    .load_with_retry(account_id)
                    .await?
                    .ok_or(EntitlementError::AccountNotFound(account_id))?;

                if current.tier == Tier::Admin {
                    return Ok(current.evaluate(now, grace, false));
                }

                let mut next = current.clone();
                next.tier = Tier::Admin;
                next.version = current.version + 1;
                next.last_reconciled_at = now;
                self.commit(&next, current.version).await?;

                tracing::info!("admin override set for account {} (v{})", account_id, next.version);
                Ok(next.evaluate(now, grace, false))
            })
            .await?
    }

    /// Privileged operator path: drop the admin override.
    ///
    /// The restored tier is derived from the stored windows and never
    /// invents paid access.
    pub async fn clear_admin_override(
        &self,
        account_id: AccountId,
    ) -> Result<EntitlementOutcome, EntitlementError> {
        self.serializer
            .with_lock(account_id, || async move {
                let now = Utc::now();
                let grace = self.config.grace_period;
                let current = self
                    .load_with_retry(account_id)
                    .await?
                    .ok_or(EntitlementError::AccountNotFound(account_id))?;

                if current.tier != Tier::Admin {
                    return Ok(current.evaluate(now, grace, false));
                }

                let mut next = current.clone();
                next.tier = restored_tier(&current, now);
                next.version = current.version + 1;
                next.last_reconciled_at = now;
                self.commit(&next, current.version).await?;

                tracing::info!(
                    "admin override cleared for account {}, restored to {:?} (v{})",
                    account_id,
                    next.tier,
                    next.version
                );
                Ok(next.evaluate(now, grace, false))
            })
            .await?
    }

    async fn reconcile_locked(
        &self,
        event: ProviderEvent,
    ) -> Result<EntitlementOutcome, EntitlementError> {
        let account_id = event.account_id;
        let grace = self.config.grace_period;

        // re-check under the lock: a concurrent delivery of the same event
        // may have applied it while this one waited
        if let Some(event_id) = &event.event_id {
            if let Some(outcome) = self.ledger.outcome_for(event_id) {
                tracing::debug!("event {} applied while waiting for the lock", event_id);
                return Ok(outcome);
            }
        }

        for attempt in 1..=self.config.max_reconcile_attempts {
            let now = Utc::now();
            let current = self.load_with_retry(account_id).await?.unwrap_or_else(|| {
                AccountEntitlement::new_trial(account_id, now, self.config.trial_days)
            });

            // out-of-order defense: never regress state for a late delivery
            if current.version > 0 && event.kind.from_provider() {
                let cutoff = current.last_reconciled_at - self.config.skew_tolerance;
                if event.occurred_at < cutoff {
                    tracing::warn!(
                        "stale {} event for account {}: occurred {} but last reconciled {}",
                        event.kind.name(),
                        account_id,
                        event.occurred_at,
                        current.last_reconciled_at
                    );
                    let outcome = current.evaluate(now, grace, false);
                    self.record_in_ledger(&event, current.version, &outcome, now);
                    return Ok(outcome);
                }
            }

            let mut next = match apply_transition(&current, &event.kind, now, grace)? {
                Some(next) => next,
                None => {
                    tracing::debug!(
                        "{} is a no-op for account {} in {:?}",
                        event.kind.name(),
                        account_id,
                        current.tier
                    );
                    let outcome = current.evaluate(now, grace, false);
                    self.record_in_ledger(&event, current.version, &outcome, now);
                    return Ok(outcome);
                }
            };

            next.version = current.version + 1;
            next.last_reconciled_at = now;

            let expected = current.version;
            let put = retry_transient(self.config.retry, StoreError::is_transient, || {
                self.store.compare_and_put(next.clone(), expected)
            })
            .await;

            match put {
                Ok(()) => {
                    tracing::info!(
                        "account {} {:?} -> {:?} via {} (v{})",
                        account_id,
                        current.tier,
                        next.tier,
                        event.kind.name(),
                        next.version
                    );
                    let outcome = next.evaluate(now, grace, false);
                    // ledger strictly after the committed write
                    self.record_in_ledger(&event, next.version, &outcome, now);
                    self.abuse.observe(&next, current.tier, next.tier, &event.kind, now);
                    self.notifier.publish(EntitlementChanged {
                        account_id,
                        version: next.version,
                        tier: next.tier,
                    });
                    return Ok(outcome);
                }
                Err(StoreError::VersionConflict { expected, actual }) => {
                    tracing::warn!(
                        "version conflict for account {} (expected {}, found {}), attempt {}/{}",
                        account_id,
                        expected,
                        actual,
                        attempt,
                        self.config.max_reconcile_attempts
                    );
                }
                Err(StoreError::Unavailable(msg)) => return Err(EntitlementError::Store(msg)),
            }
        }

        Err(EntitlementError::ReconciliationConflict {
            account_id,
            attempts: self.config.max_reconcile_attempts,
        })
    }

    async fn commit(
        &self,
        record: &AccountEntitlement,
        expected_version: u64,
    ) -> Result<(), EntitlementError> {
        retry_transient(self.config.retry, StoreError::is_transient, || {
            self.store.compare_and_put(record.clone(), expected_version)
        })
        .await?;
        self.notifier.publish(EntitlementChanged {
            account_id: record.account_id,
            version: record.version,
            tier: record.tier,
        });
        Ok(())
    }

    async fn load_with_retry(
        &self,
        account_id: AccountId,
    ) -> Result<Option<AccountEntitlement>, EntitlementError> {
        retry_transient(self.config.retry, StoreError::is_transient, || {
            self.store.load(account_id)
        })
        .await
        .map_err(EntitlementError::from)
    }

    fn record_in_ledger(
        &self,
        event: &ProviderEvent,
        resulting_version: u64,
        outcome: &EntitlementOutcome,
        now: DateTime<Utc>,
    ) {
        if let Some(event_id) = &event.event_id {
            let record = ProcessedEvent {
                event_id: event_id.clone(),
                account_id: event.account_id,
                applied_at: now,
                resulting_version,
                outcome: outcome.clone(),
            };
            if let Err(LedgerError::AlreadyProcessed(id)) = self.ledger.mark_processed(record) {
                tracing::debug!("ledger write for {} raced a concurrent delivery", id);
            }
        }
    }
}

/// Apply the state-machine table to one record.
///
/// `Ok(None)` means the pair is a no-op and the current record stands;
/// provider noise must neither invent access nor regress state. The
/// returned record still carries the old version; the engine bumps it
/// before committing.
fn apply_transition(
    current: &AccountEntitlement,
    kind: &EventKind,
    now: DateTime<Utc>,
    grace_period: Duration,
) -> Result<Option<AccountEntitlement>, EntitlementError> {
    // admin is absorbing with respect to provider events
    if current.tier == Tier::Admin && kind.from_provider() {
        return Err(EntitlementError::InvalidTransition {
            from: current.tier,
            event: kind.name(),
        });
    }

    let mut next = current.clone();
    match kind {
        EventKind::SubscriptionActivated {
            window,
            subscription_ref,
            instrument_fingerprint,
        } => match current.tier {
            Tier::Trial | Tier::Expired | Tier::Active => {
                next.tier = Tier::Active;
                next.trial_window = None;
                next.subscription_window = Some(*window);
                next.external_subscription_ref = Some(subscription_ref.clone());
                if instrument_fingerprint.is_some() {
                    next.instrument_fingerprint = instrument_fingerprint.clone();
                }
                Ok(Some(next))
            }
            _ => Ok(None),
        },
        EventKind::SubscriptionCanceled => match current.tier {
            Tier::Active => {
                // paid-through date stays as the access horizon; a window
                // that already lapsed goes straight to expired
                match current.subscription_window {
                    Some(window) if window.is_current(now) => next.tier = Tier::CanceledActive,
                    _ => next.tier = Tier::Expired,
                }
                Ok(Some(next))
            }
            _ => Ok(None),
        },
        EventKind::SubscriptionRenewed { window } => match current.tier {
            Tier::Active | Tier::PastDue => {
                next.tier = Tier::Active;
                next.subscription_window = Some(*window);
                Ok(Some(next))
            }
            _ => Ok(None),
        },
        EventKind::PaymentFailed => match current.tier {
            Tier::Active => {
                next.tier = Tier::PastDue;
                Ok(Some(next))
            }
            _ => Ok(None),
        },
        EventKind::ManualReactivation {
            subscription_ref,
            window,
        } => {
            let same_family =
                current.external_subscription_ref.as_deref() == Some(subscription_ref.as_str());
            if !same_family {
                return Err(EntitlementError::ReactivationNotEligible(current.account_id));
            }
            match current.tier {
                Tier::CanceledActive => {
                    next.tier = Tier::Active;
                    next.subscription_window = Some(*window);
                    Ok(Some(next))
                }
                _ => Ok(None),
            }
        }
        EventKind::ExpirySweep => {
            if current.sweep_due(now, grace_period) {
                next.tier = Tier::Expired;
                Ok(Some(next))
            } else {
                Ok(None)
            }
        }
    }
}

/// Tier an account returns to when its admin override is dropped
fn restored_tier(record: &AccountEntitlement, now: DateTime<Utc>) -> Tier {
    match (record.subscription_window, record.external_subscription_ref.as_ref()) {
        (Some(window), Some(_)) if window.is_current(now) => Tier::Active,
        _ => match record.trial_window {
            Some(window) if window.is_current(now) => Tier::Trial,
            _ => Tier::Expired,
        },
    }
}
