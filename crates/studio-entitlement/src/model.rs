//! Entitlement Data Model

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use studio_common::{AccountId, EventId, TimeWindow};

/// Access tier of an account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Free evaluation period before the first subscription
    Trial,
    /// Paying subscription in good standing
    Active,
    /// Cancellation scheduled; access runs until the paid-through date
    CanceledActive,
    /// Payment failed; access retained through the grace period
    PastDue,
    /// No current access; re-enterable via a new subscription
    Expired,
    /// Operator-granted unlimited access; provider events never touch it
    Admin,
}

impl Tier {
    /// Tiers that must carry an external subscription reference
    pub fn requires_subscription_ref(&self) -> bool {
        matches!(self, Self::Active | Self::CanceledActive | Self::PastDue)
    }
}

/// Authoritative entitlement record, one per account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountEntitlement {
    /// Account this record belongs to
    pub account_id: AccountId,
    /// Current access tier
    pub tier: Tier,
    /// Evaluation window; present only before the first subscription
    pub trial_window: Option<TimeWindow>,
    /// Paid window; `end` is the paid-through date
    pub subscription_window: Option<TimeWindow>,
    /// Provider-side subscription reference
    pub external_subscription_ref: Option<String>,
    /// Opaque payment-instrument fingerprint from the latest activation
    pub instrument_fingerprint: Option<String>,
    /// Instant of the last successful reconciliation
    pub last_reconciled_at: DateTime<Utc>,
    /// Optimistic-concurrency counter; bumped on every mutation
    pub version: u64,
}

impl AccountEntitlement {
    /// Fresh trial record for an account seen for the first time.
    ///
    /// Version 0 marks a record that has not been persisted yet; the first
    /// committed write stores it as version 1.
    pub fn new_trial(account_id: AccountId, now: DateTime<Utc>, trial_days: i64) -> Self {
        Self {
            account_id,
            tier: Tier::Trial,
            trial_window: Some(TimeWindow::for_days(now, trial_days)),
            subscription_window: None,
            external_subscription_ref: None,
            instrument_fingerprint: None,
            last_reconciled_at: now,
            version: 0,
        }
    }

    /// Days of access left, derived at read time. `None` for admin accounts.
    pub fn days_remaining(&self, now: DateTime<Utc>) -> Option<i64> {
        match self.tier {
            Tier::Admin => None,
            Tier::Trial => Some(
                self.trial_window
                    .map(|w| w.days_remaining(now))
                    .unwrap_or(0),
            ),
            _ => Some(
                self.subscription_window
                    .map(|w| w.days_remaining(now))
                    .unwrap_or(0),
            ),
        }
    }

    /// Whether a sweep run at `now` would expire this record
    pub fn sweep_due(&self, now: DateTime<Utc>, grace_period: Duration) -> bool {
        match self.tier {
            Tier::Trial => self
                .trial_window
                .map(|w| w.has_passed(now))
                .unwrap_or(true),
            Tier::CanceledActive => self
                .subscription_window
                .map(|w| w.has_passed(now))
                .unwrap_or(true),
            Tier::PastDue => self
                .subscription_window
                .map(|w| now >= w.end + grace_period)
                .unwrap_or(true),
            _ => false,
        }
    }

    /// Evaluate the record into the outcome served to callers
    pub fn evaluate(
        &self,
        now: DateTime<Utc>,
        grace_period: Duration,
        degraded: bool,
    ) -> EntitlementOutcome {
        let (access_granted, reason) = match self.tier {
            Tier::Admin => (true, AccessReason::AdminOverride),
            Tier::Trial => match self.trial_window {
                Some(w) if w.is_current(now) => (true, AccessReason::Trialing),
                _ => (false, AccessReason::TrialExpired),
            },
            Tier::Active => (true, AccessReason::Subscribed),
            Tier::CanceledActive => match self.subscription_window {
                Some(w) if w.is_current(now) => (true, AccessReason::CancelScheduled),
                _ => (false, AccessReason::SubscriptionLapsed),
            },
            Tier::PastDue => match self.subscription_window {
                Some(w) if now < w.end + grace_period => (true, AccessReason::GracePeriod),
                _ => (false, AccessReason::SubscriptionLapsed),
            },
            Tier::Expired => {
                let reason = if self.external_subscription_ref.is_some() {
                    AccessReason::SubscriptionLapsed
                } else {
                    AccessReason::TrialExpired
                };
                (false, reason)
            }
        };

        EntitlementOutcome {
            account_id: self.account_id,
            tier: self.tier,
            subscription_window: self.subscription_window,
            days_remaining: self.days_remaining(now),
            version: self.version,
            degraded,
            access_granted,
            reason,
        }
    }
}

/// Inbound event to reconcile
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEvent {
    /// Provider delivery id; absent for sweeps and manual requests
    pub event_id: Option<EventId>,
    /// Target account
    pub account_id: AccountId,
    /// Provider-side event timestamp, used by the out-of-order defense
    pub occurred_at: DateTime<Utc>,
    /// What happened
    pub kind: EventKind,
}

impl ProviderEvent {
    /// Sweep event for the scheduled expiry pass
    pub fn expiry_sweep(account_id: AccountId, now: DateTime<Utc>) -> Self {
        Self {
            event_id: None,
            account_id,
            occurred_at: now,
            kind: EventKind::ExpirySweep,
        }
    }
}

/// Billing-state change carried by a provider event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum EventKind {
    /// New or refreshed subscription
    SubscriptionActivated {
        /// Paid period from the provider
        window: TimeWindow,
        /// Provider subscription reference
        subscription_ref: String,
        /// Payment-instrument fingerprint, when the provider shares one
        instrument_fingerprint: Option<String>,
    },
    /// Cancellation scheduled at period end
    SubscriptionCanceled,
    /// Paid period extended
    SubscriptionRenewed {
        /// New paid period
        window: TimeWindow,
    },
    /// Invoice payment failed
    PaymentFailed,
    /// Account holder asked to undo a scheduled cancellation
    ManualReactivation {
        /// Reference the caller claims; must match the stored one
        subscription_ref: String,
        /// Paid period after reactivation
        window: TimeWindow,
    },
    /// Scheduled pass expiring records whose horizon passed
    ExpirySweep,
}

impl EventKind {
    /// Short name for logs and errors
    pub fn name(&self) -> &'static str {
        match self {
            Self::SubscriptionActivated { .. } => "subscription_activated",
            Self::SubscriptionCanceled => "subscription_canceled",
            Self::SubscriptionRenewed { .. } => "subscription_renewed",
            Self::PaymentFailed => "payment_failed",
            Self::ManualReactivation { .. } => "manual_reactivation",
            Self::ExpirySweep => "expiry_sweep",
        }
    }

    /// True for events minted by the provider rather than this system
    pub fn from_provider(&self) -> bool {
        !matches!(self, Self::ManualReactivation { .. } | Self::ExpirySweep)
    }
}

/// Resolved entitlement served to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitlementOutcome {
    /// Account the outcome describes
    pub account_id: AccountId,
    /// Current tier
    pub tier: Tier,
    /// Paid window, when one exists
    pub subscription_window: Option<TimeWindow>,
    /// Days of access left; `None` for admin accounts
    pub days_remaining: Option<i64>,
    /// Record version the outcome was computed from
    pub version: u64,
    /// True when resolved without a provider round-trip during an outage
    pub degraded: bool,
    /// Whether the application should grant access
    pub access_granted: bool,
    /// User-visible explanation for the current state
    pub reason: AccessReason,
}

/// Why access is granted or withheld
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessReason {
    /// Inside the evaluation window
    Trialing,
    /// Subscription in good standing
    Subscribed,
    /// Canceled but paid through a future date
    CancelScheduled,
    /// Payment failed; inside the grace period
    GracePeriod,
    /// Evaluation window over, never subscribed
    TrialExpired,
    /// Paid access ran out
    SubscriptionLapsed,
    /// Provider outage; trusting the last durable record
    ProviderUnreachable,
    /// Operator-granted access
    AdminOverride,
}
