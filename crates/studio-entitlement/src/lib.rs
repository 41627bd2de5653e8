//! FlowStudio Entitlement Reconciliation Core
//!
//! Grants or revokes application access from each account's billing state,
//! driven by an external payment provider that delivers events out of
//! order, duplicated, and in rapid succession.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      ACCESS PLATFORM                                    │
//! │                                                                         │
//! │  Provider Events ──► Idempotency Ledger ──► Per-Account Serializer      │
//! │  Manual Requests                                   │                    │
//! │  Expiry Sweeps                                     ▼                    │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                  RECONCILIATION ENGINE                           │   │
//! │  │   State Machine | Versioned Commits | Out-of-Order Defense       │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │         │                      │                      │                 │
//! │         ▼                      ▼                      ▼                 │
//! │  ┌──────────────┐  ┌────────────────────┐  ┌──────────────────┐        │
//! │  │ Entitlement  │  │  Abuse Detector    │  │ Change Broadcast │        │
//! │  │ State Store  │  │  (advisory only)   │  │    (sessions)    │        │
//! │  └──────────────┘  └────────────────────┘  └──────────────────┘        │
//! │         │                                                               │
//! │         ▼                                                               │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │   QUERY FAÇADE ──► Degraded-Mode Resolver (provider outages)    │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Readers are lock-free against the store's latest committed version; all
//! mutation funnels through the engine inside the account's exclusive
//! section, so one account's webhooks, manual requests, and sweeps
//! serialize while unrelated accounts proceed in parallel.

#![warn(missing_docs)]
#![allow(dead_code)]

pub mod abuse;
pub mod config;
pub mod degraded;
pub mod engine;
pub mod ledger;
pub mod model;
pub mod notify;
pub mod query;
pub mod serializer;
pub mod store;
pub mod sweep;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use studio_common::AccountId;
use thiserror::Error;

pub use abuse::{AbuseDetector, AbuseSignal, AbuseSignalKind, RiskLevel};
pub use config::EntitlementConfig;
pub use degraded::DegradedResolver;
pub use engine::ReconciliationEngine;
pub use ledger::{IdempotencyLedger, LedgerError, ProcessedEvent};
pub use model::{
    AccessReason, AccountEntitlement, EntitlementOutcome, EventKind, ProviderEvent, Tier,
};
pub use notify::{EntitlementChanged, EntitlementNotifier};
pub use query::{ProviderClient, ProviderError, ProviderSubscription, QueryFacade};
pub use serializer::{AccountSerializer, SerializerError};
pub use store::{EntitlementStore, MemoryEntitlementStore, StoreError};
pub use sweep::{ExpirySweeper, SweepReport};

/// Entitlement error taxonomy
#[derive(Debug, Error)]
pub enum EntitlementError {
    /// Provider event that would illegally alter the current tier
    #[error("{event} not allowed from tier {from:?}")]
    InvalidTransition {
        /// Tier the record is in
        from: Tier,
        /// Offending event
        event: &'static str,
    },

    /// Manual reactivation with a mismatched or absent subscription ref
    #[error("reactivation not eligible for account {0}")]
    ReactivationNotEligible(AccountId),

    /// Another writer committed between load and commit
    #[error("concurrent modification: expected version {expected}, found {actual}")]
    ConcurrentModification {
        /// Version the writer loaded
        expected: u64,
        /// Version actually committed
        actual: u64,
    },

    /// Optimistic-concurrency races exhausted the bounded retries
    #[error("reconciliation conflict for account {account_id} after {attempts} attempts")]
    ReconciliationConflict {
        /// Contended account
        account_id: AccountId,
        /// Attempts made before giving up
        attempts: u32,
    },

    /// Per-account lock wait exceeded the configured bound
    #[error("lock timeout for account {0}")]
    LockTimeout(AccountId),

    /// The calling task already holds this account's lock
    #[error("reentrant reconciliation denied for account {0}")]
    ReentrantLockDenied(AccountId),

    /// No entitlement record exists for the account
    #[error("no entitlement record for account {0}")]
    AccountNotFound(AccountId),

    /// Provider round-trip failed; verified reads degrade instead
    #[error("provider unreachable: {0}")]
    ProviderUnreachable(String),

    /// Storage failure that outlived the bounded retries
    #[error("storage failure: {0}")]
    Store(String),
}

impl From<SerializerError> for EntitlementError {
    fn from(err: SerializerError) -> Self {
        match err {
            SerializerError::LockTimeout(account_id) => Self::LockTimeout(account_id),
            SerializerError::ReentrantLockDenied(account_id) => {
                Self::ReentrantLockDenied(account_id)
            }
        }
    }
}

impl From<StoreError> for EntitlementError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::VersionConflict { expected, actual } => {
                Self::ConcurrentModification { expected, actual }
            }
            StoreError::Unavailable(msg) => Self::Store(msg),
        }
    }
}

/// Result alias for entitlement operations
pub type EntitlementResult<T> = Result<T, EntitlementError>;

/// Access Platform
///
/// Wires the ledger, serializer, store, engine, resolver, detector, read
/// façade, notifier, and sweeper into one handle for the API layer.
pub struct AccessPlatform {
    /// Shared configuration
    pub config: EntitlementConfig,
    /// Durable entitlement records
    pub store: Arc<dyn EntitlementStore>,
    /// Applied-event registry
    pub ledger: Arc<IdempotencyLedger>,
    /// Sole writer of entitlement state
    pub engine: Arc<ReconciliationEngine>,
    /// Outage fallback for verified reads
    pub resolver: Arc<DegradedResolver>,
    /// Advisory manipulation scoring
    pub abuse: Arc<AbuseDetector>,
    /// Read path
    pub query: Arc<QueryFacade>,
    /// Entitlement-change broadcast
    pub notifier: Arc<EntitlementNotifier>,
    /// Scheduled expiry pass
    pub sweeper: Arc<ExpirySweeper>,
}

impl AccessPlatform {
    /// Platform over an in-memory store with default configuration
    pub fn new(provider: Arc<dyn ProviderClient>) -> Self {
        Self::with_config(EntitlementConfig::default(), provider)
    }

    /// Platform over an in-memory store
    pub fn with_config(config: EntitlementConfig, provider: Arc<dyn ProviderClient>) -> Self {
        Self::with_store(config, Arc::new(MemoryEntitlementStore::new()), provider)
    }

    /// Platform over a caller-supplied durable store
    pub fn with_store(
        config: EntitlementConfig,
        store: Arc<dyn EntitlementStore>,
        provider: Arc<dyn ProviderClient>,
    ) -> Self {
        let ledger = Arc::new(IdempotencyLedger::new());
        let serializer = Arc::new(AccountSerializer::new(config.lock_timeout));
        let abuse = Arc::new(AbuseDetector::new());
        let notifier = Arc::new(EntitlementNotifier::new());
        let engine = Arc::new(ReconciliationEngine::new(
            config.clone(),
            store.clone(),
            ledger.clone(),
            serializer,
            abuse.clone(),
            notifier.clone(),
        ));
        let resolver = Arc::new(DegradedResolver::new(config.clone(), store.clone()));
        let query = Arc::new(QueryFacade::new(
            config.clone(),
            store.clone(),
            resolver.clone(),
            provider,
        ));
        let sweeper = Arc::new(ExpirySweeper::new(config.clone(), store.clone(), engine.clone()));

        Self {
            config,
            store,
            ledger,
            engine,
            resolver,
            abuse,
            query,
            notifier,
            sweeper,
        }
    }

    /// Reconcile one inbound event
    pub async fn reconcile(&self, event: ProviderEvent) -> EntitlementResult<EntitlementOutcome> {
        self.engine.reconcile(event).await
    }

    /// Bootstrap the default trial record at first authentication
    pub async fn ensure_account(&self, account_id: AccountId) -> EntitlementResult<EntitlementOutcome> {
        self.engine.ensure_account(account_id).await
    }

    /// Current entitlement for the account
    pub async fn get_entitlement(
        &self,
        account_id: AccountId,
        verified: bool,
    ) -> EntitlementResult<EntitlementOutcome> {
        self.query.get_entitlement(account_id, verified).await
    }

    /// Operator-only: grant unconditional access
    pub async fn set_admin_override(
        &self,
        account_id: AccountId,
    ) -> EntitlementResult<EntitlementOutcome> {
        self.engine.set_admin_override(account_id).await
    }

    /// Operator-only: drop the admin override
    pub async fn clear_admin_override(
        &self,
        account_id: AccountId,
    ) -> EntitlementResult<EntitlementOutcome> {
        self.engine.clear_admin_override(account_id).await
    }

    /// Run one expiry pass at `now`
    pub async fn run_expiry_sweep(&self, now: DateTime<Utc>) -> EntitlementResult<SweepReport> {
        self.sweeper.run_once(now).await
    }

    /// Subscribe to entitlement-change notifications
    pub fn subscribe_changes(&self) -> tokio::sync::broadcast::Receiver<EntitlementChanged> {
        self.notifier.subscribe()
    }

    /// Drop ledger entries older than the configured retention horizon
    pub fn prune_ledger(&self, now: DateTime<Utc>) -> usize {
        self.ledger.prune(now - self.config.ledger_retention)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use studio_common::TimeWindow;
    use uuid::Uuid;

    struct OfflineProvider;

    #[async_trait]
    impl ProviderClient for OfflineProvider {
        async fn fetch_subscription(
            &self,
            _subscription_ref: &str,
        ) -> Result<ProviderSubscription, ProviderError> {
            Err(ProviderError::Unreachable("dns failure".into()))
        }
    }

    #[tokio::test]
    async fn test_platform_lifecycle_with_provider_outage() {
        let platform = AccessPlatform::new(Arc::new(OfflineProvider));
        let account = Uuid::new_v4();
        let mut changes = platform.subscribe_changes();

        let trial = platform.ensure_account(account).await.unwrap();
        assert_eq!(trial.tier, Tier::Trial);
        assert!(trial.access_granted);

        let now = Utc::now();
        let active = platform
            .reconcile(ProviderEvent {
                event_id: Some("evt_1".into()),
                account_id: account,
                occurred_at: now,
                kind: EventKind::SubscriptionActivated {
                    window: TimeWindow::for_days(now, 30),
                    subscription_ref: "sub_1".into(),
                    instrument_fingerprint: Some("fp_1".into()),
                },
            })
            .await
            .unwrap();
        assert_eq!(active.tier, Tier::Active);
        assert!(active.days_remaining.unwrap() >= 29);

        // plain reads never consult the provider
        let plain = platform.get_entitlement(account, false).await.unwrap();
        assert!(!plain.degraded);
        assert!(plain.access_granted);

        // verified reads degrade gracefully while the provider is down
        let verified = platform.get_entitlement(account, true).await.unwrap();
        assert!(verified.degraded);
        assert!(verified.access_granted);
        assert_eq!(verified.tier, Tier::Active);
        assert_eq!(verified.reason, AccessReason::ProviderUnreachable);

        // both mutations were broadcast in commit order
        assert_eq!(changes.recv().await.unwrap().tier, Tier::Trial);
        assert_eq!(changes.recv().await.unwrap().tier, Tier::Active);
    }

    #[tokio::test]
    async fn test_platform_sweep_and_prune() {
        let platform = AccessPlatform::new(Arc::new(OfflineProvider));
        let account = Uuid::new_v4();

        platform.ensure_account(account).await.unwrap();
        platform
            .reconcile(ProviderEvent {
                event_id: Some("evt_1".into()),
                account_id: account,
                occurred_at: Utc::now(),
                kind: EventKind::SubscriptionActivated {
                    window: TimeWindow::for_days(Utc::now(), 30),
                    subscription_ref: "sub_1".into(),
                    instrument_fingerprint: None,
                },
            })
            .await
            .unwrap();

        let report = platform.run_expiry_sweep(Utc::now()).await.unwrap();
        assert_eq!(report.expired, 0);

        // nothing old enough to prune yet
        assert_eq!(platform.prune_ledger(Utc::now()), 0);
        assert_eq!(platform.ledger.len(), 1);
    }
}
