//! Abuse Detector
//!
//! Scores accounts for entitlement-manipulation patterns from the
//! transition history. Strictly advisory: signals raise a risk score for
//! out-of-band review, never alter a tier, and never block reconciliation.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use studio_common::AccountId;

use crate::model::{AccountEntitlement, EventKind, Tier};

/// Rolling window for cancel/reactivate cycling
const RAPID_CYCLE_WINDOW_DAYS: i64 = 7;
/// Rolling window for cancellation counting
const CANCEL_WINDOW_DAYS: i64 = 30;
/// Cancellations inside the window before a signal fires
const CANCEL_SIGNAL_THRESHOLD: usize = 3;

/// Signal weights, summed into the risk score
const RAPID_CYCLE_WEIGHT: u32 = 30;
const INSTRUMENT_REUSE_WEIGHT: u32 = 50;
const EXCESSIVE_CANCELLATION_WEIGHT: u32 = 60;
const ALIAS_REUSE_WEIGHT: u32 = 40;

/// Score bands for review labels
const SUSPICIOUS_SCORE: u32 = 50;
const FLAGGED_SCORE: u32 = 100;
const CRITICAL_SCORE: u32 = 150;

/// Manipulation pattern a signal describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbuseSignalKind {
    /// Cancel/reactivate cycling inside a short rolling window
    RapidCycle,
    /// Contact-identifier fragment shared across distinct accounts
    AliasReuse,
    /// Payment instrument shared across distinct accounts
    InstrumentReuse,
    /// Cancellation rate out of proportion to tenure
    ExcessiveCancellation,
}

/// One observed manipulation indicator, append-only per account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbuseSignal {
    /// Pattern observed
    pub kind: AbuseSignalKind,
    /// When it was observed
    pub observed_at: DateTime<Utc>,
    /// Contribution to the risk score
    pub weight: u32,
}

/// Advisory label derived from the accumulated score
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    /// Nothing noteworthy
    Normal,
    /// Worth a look during routine review
    Suspicious,
    /// Queued for review
    Flagged,
    /// Review before honoring further manual requests
    Critical,
}

#[derive(Debug, Clone, Copy)]
struct TransitionRecord {
    at: DateTime<Utc>,
    from: Tier,
    to: Tier,
}

#[derive(Debug)]
struct AccountHistory {
    first_seen: DateTime<Utc>,
    transitions: Vec<TransitionRecord>,
}

/// Transition-history scorer
pub struct AbuseDetector {
    history: DashMap<AccountId, AccountHistory>,
    signals: DashMap<AccountId, Vec<AbuseSignal>>,
    instruments: DashMap<String, HashSet<AccountId>>,
    aliases: DashMap<String, HashSet<AccountId>>,
}

impl AbuseDetector {
    /// Detector with empty history
    pub fn new() -> Self {
        Self {
            history: DashMap::new(),
            signals: DashMap::new(),
            instruments: DashMap::new(),
            aliases: DashMap::new(),
        }
    }

    /// Feed one committed transition into the history.
    ///
    /// Infallible and advisory; the engine calls this after the record is
    /// durable and ignores everything it concludes.
    pub fn observe(
        &self,
        record: &AccountEntitlement,
        from: Tier,
        to: Tier,
        kind: &EventKind,
        now: DateTime<Utc>,
    ) {
        let account_id = record.account_id;

        let mut history = self.history.entry(account_id).or_insert_with(|| AccountHistory {
            first_seen: now,
            transitions: Vec::new(),
        });
        history.transitions.push(TransitionRecord { at: now, from, to });

        let cycle_window = now - Duration::days(RAPID_CYCLE_WINDOW_DAYS);
        let cancel_window = now - Duration::days(CANCEL_WINDOW_DAYS);

        let prior_reactivations = history
            .transitions
            .iter()
            .filter(|t| t.at >= cycle_window && t.from == Tier::CanceledActive && t.to == Tier::Active)
            .count();
        let recent_cancels = history
            .transitions
            .iter()
            .filter(|t| t.at >= cancel_window && t.to == Tier::CanceledActive)
            .count();
        drop(history);

        if from == Tier::CanceledActive && to == Tier::Active && prior_reactivations > 1 {
            self.record_signal(account_id, AbuseSignalKind::RapidCycle, RAPID_CYCLE_WEIGHT, now);
        }

        if to == Tier::CanceledActive && recent_cancels >= CANCEL_SIGNAL_THRESHOLD {
            self.record_signal(
                account_id,
                AbuseSignalKind::ExcessiveCancellation,
                EXCESSIVE_CANCELLATION_WEIGHT,
                now,
            );
        }

        if let EventKind::SubscriptionActivated {
            instrument_fingerprint: Some(fingerprint),
            ..
        } = kind
        {
            self.note_instrument(account_id, fingerprint, now);
        }
    }

    /// Record a payment-instrument fingerprint for cross-account correlation
    pub fn note_instrument(&self, account_id: AccountId, fingerprint: &str, now: DateTime<Utc>) {
        let mut accounts = self
            .instruments
            .entry(fingerprint.to_string())
            .or_insert_with(HashSet::new);
        accounts.insert(account_id);
        let shared = accounts.len() > 1;
        drop(accounts);

        if shared {
            self.record_signal(
                account_id,
                AbuseSignalKind::InstrumentReuse,
                INSTRUMENT_REUSE_WEIGHT,
                now,
            );
        }
    }

    /// Record a contact-identifier fragment seen at signup or reactivation
    pub fn note_contact_alias(&self, account_id: AccountId, fragment: &str, now: DateTime<Utc>) {
        let mut accounts = self
            .aliases
            .entry(fragment.to_string())
            .or_insert_with(HashSet::new);
        accounts.insert(account_id);
        let shared = accounts.len() > 1;
        drop(accounts);

        if shared {
            self.record_signal(account_id, AbuseSignalKind::AliasReuse, ALIAS_REUSE_WEIGHT, now);
        }
    }

    fn record_signal(
        &self,
        account_id: AccountId,
        kind: AbuseSignalKind,
        weight: u32,
        now: DateTime<Utc>,
    ) {
        tracing::warn!(
            "abuse signal {:?} (weight {}) for account {}",
            kind,
            weight,
            account_id
        );
        self.signals.entry(account_id).or_default().push(AbuseSignal {
            kind,
            observed_at: now,
            weight,
        });
    }

    /// Accumulated risk score for the account
    pub fn risk_score(&self, account_id: AccountId) -> u32 {
        self.signals
            .get(&account_id)
            .map(|signals| signals.iter().map(|s| s.weight).sum())
            .unwrap_or(0)
    }

    /// Review label for the account's current score
    pub fn risk_level(&self, account_id: AccountId) -> RiskLevel {
        let score = self.risk_score(account_id);
        if score >= CRITICAL_SCORE {
            RiskLevel::Critical
        } else if score >= FLAGGED_SCORE {
            RiskLevel::Flagged
        } else if score >= SUSPICIOUS_SCORE {
            RiskLevel::Suspicious
        } else {
            RiskLevel::Normal
        }
    }

    /// Append-only signal log for the account
    pub fn signals(&self, account_id: AccountId) -> Vec<AbuseSignal> {
        self.signals
            .get(&account_id)
            .map(|signals| signals.clone())
            .unwrap_or_default()
    }
}

impl Default for AbuseDetector {
    fn default() -> Self {
        Self::new()
    }
}
