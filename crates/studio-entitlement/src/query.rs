//! Query Façade
//!
//! Read path served to many concurrent client sessions. Reads go straight
//! to the latest committed record and never touch the per-account
//! serializer. A verified read round-trips to the provider and falls back
//! to the degraded resolver when the provider is unreachable.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use studio_common::{AccountId, TimeWindow};
use thiserror::Error;

use crate::config::EntitlementConfig;
use crate::degraded::DegradedResolver;
use crate::model::EntitlementOutcome;
use crate::store::EntitlementStore;
use crate::EntitlementError;

/// Provider round-trip error
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Provider cannot be reached; triggers degraded resolution
    #[error("provider unreachable: {0}")]
    Unreachable(String),
    /// Provider no longer knows the subscription
    #[error("subscription not found: {0}")]
    NotFound(String),
}

/// Subscription state as the provider reports it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSubscription {
    /// Provider subscription reference
    pub subscription_ref: String,
    /// Current paid period
    pub current_period: TimeWindow,
    /// Whether cancellation is scheduled at period end
    pub cancel_at_period_end: bool,
}

/// Live verification boundary to the excluded transport layer
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Fetch the provider's view of a subscription
    async fn fetch_subscription(
        &self,
        subscription_ref: &str,
    ) -> Result<ProviderSubscription, ProviderError>;
}

/// Lock-free read path over the entitlement store
pub struct QueryFacade {
    config: EntitlementConfig,
    store: Arc<dyn EntitlementStore>,
    resolver: Arc<DegradedResolver>,
    provider: Arc<dyn ProviderClient>,
}

impl QueryFacade {
    /// Façade over the shared store and provider boundary
    pub fn new(
        config: EntitlementConfig,
        store: Arc<dyn EntitlementStore>,
        resolver: Arc<DegradedResolver>,
        provider: Arc<dyn ProviderClient>,
    ) -> Self {
        Self {
            config,
            store,
            resolver,
            provider,
        }
    }

    /// Current entitlement for the account.
    ///
    /// `verified` asks for a provider round-trip; when the provider is
    /// unreachable the degraded resolver answers instead of the call
    /// failing. The read path never writes and never blocks on the
    /// per-account serializer.
    pub async fn get_entitlement(
        &self,
        account_id: AccountId,
        verified: bool,
    ) -> Result<EntitlementOutcome, EntitlementError> {
        let record = self
            .store
            .load(account_id)
            .await?
            .ok_or(EntitlementError::AccountNotFound(account_id))?;

        let now = Utc::now();
        let grace = self.config.grace_period;

        if !verified {
            return Ok(record.evaluate(now, grace, false));
        }

        // nothing to verify without a subscription on file
        let subscription_ref = match record.external_subscription_ref.clone() {
            Some(subscription_ref) => subscription_ref,
            None => return Ok(record.evaluate(now, grace, false)),
        };

        match self.provider.fetch_subscription(&subscription_ref).await {
            Ok(provider_sub) => {
                if let Some(stored) = record.subscription_window {
                    let drift = provider_sub.current_period.end - stored.end;
                    if drift.abs() > self.config.skew_tolerance {
                        tracing::warn!(
                            "provider window for {} drifted from stored record by {} minutes; next event reconciles",
                            subscription_ref,
                            drift.num_minutes()
                        );
                    }
                }
                Ok(record.evaluate(now, grace, false))
            }
            Err(ProviderError::Unreachable(reason)) => {
                tracing::warn!(
                    "verified read for account {} degraded: {}",
                    account_id,
                    reason
                );
                self.resolver.resolve_on_failure(account_id).await
            }
            Err(ProviderError::NotFound(subscription_ref)) => {
                // the store is authoritative until an event says otherwise
                tracing::warn!(
                    "provider no longer knows subscription {}; serving stored record",
                    subscription_ref
                );
                Ok(record.evaluate(now, grace, false))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AccessReason, AccountEntitlement, Tier};
    use crate::store::MemoryEntitlementStore;
    use chrono::Duration;
    use uuid::Uuid;

    struct HealthyProvider;

    #[async_trait]
    impl ProviderClient for HealthyProvider {
        async fn fetch_subscription(
            &self,
            subscription_ref: &str,
        ) -> Result<ProviderSubscription, ProviderError> {
            Ok(ProviderSubscription {
                subscription_ref: subscription_ref.to_string(),
                current_period: TimeWindow::for_days(Utc::now() - Duration::days(20), 30),
                cancel_at_period_end: false,
            })
        }
    }

    struct DownProvider;

    #[async_trait]
    impl ProviderClient for DownProvider {
        async fn fetch_subscription(
            &self,
            _subscription_ref: &str,
        ) -> Result<ProviderSubscription, ProviderError> {
            Err(ProviderError::Unreachable("connect timeout".into()))
        }
    }

    fn active_record() -> AccountEntitlement {
        let now = Utc::now();
        let mut record = AccountEntitlement::new_trial(Uuid::new_v4(), now, 7);
        record.tier = Tier::Active;
        record.trial_window = None;
        record.external_subscription_ref = Some("sub_1".into());
        record.subscription_window = Some(TimeWindow::for_days(now - Duration::days(20), 30));
        record.version = 2;
        record
    }

    async fn facade_with(
        record: AccountEntitlement,
        provider: Arc<dyn ProviderClient>,
    ) -> QueryFacade {
        let config = EntitlementConfig::default();
        let store = Arc::new(MemoryEntitlementStore::new());
        store.compare_and_put(record, 0).await.unwrap();
        let resolver = Arc::new(DegradedResolver::new(config.clone(), store.clone()));
        QueryFacade::new(config, store, resolver, provider)
    }

    #[tokio::test]
    async fn test_plain_read_serves_stored_record() {
        let record = active_record();
        let account = record.account_id;
        let facade = facade_with(record, Arc::new(DownProvider)).await;

        // an unreachable provider is irrelevant to an unverified read
        let outcome = facade.get_entitlement(account, false).await.unwrap();

        assert!(!outcome.degraded);
        assert!(outcome.access_granted);
        assert_eq!(outcome.tier, Tier::Active);
        assert_eq!(outcome.days_remaining, Some(9));
    }

    #[tokio::test]
    async fn test_verified_read_with_healthy_provider() {
        let record = active_record();
        let account = record.account_id;
        let facade = facade_with(record, Arc::new(HealthyProvider)).await;

        let outcome = facade.get_entitlement(account, true).await.unwrap();

        assert!(!outcome.degraded);
        assert!(outcome.access_granted);
        assert_eq!(outcome.reason, AccessReason::Subscribed);
    }

    #[tokio::test]
    async fn test_verified_read_degrades_on_outage() {
        let record = active_record();
        let account = record.account_id;
        let facade = facade_with(record, Arc::new(DownProvider)).await;

        let outcome = facade.get_entitlement(account, true).await.unwrap();

        assert!(outcome.degraded);
        assert!(outcome.access_granted);
        assert_eq!(outcome.tier, Tier::Active);
        assert_eq!(outcome.reason, AccessReason::ProviderUnreachable);
    }

    #[tokio::test]
    async fn test_verified_read_without_subscription_skips_provider() {
        let now = Utc::now();
        let mut record = AccountEntitlement::new_trial(Uuid::new_v4(), now, 7);
        record.version = 1;
        let account = record.account_id;
        let facade = facade_with(record, Arc::new(DownProvider)).await;

        let outcome = facade.get_entitlement(account, true).await.unwrap();

        assert!(!outcome.degraded);
        assert_eq!(outcome.tier, Tier::Trial);
        assert_eq!(outcome.reason, AccessReason::Trialing);
    }

    #[tokio::test]
    async fn test_unknown_account() {
        let facade = facade_with(active_record(), Arc::new(HealthyProvider)).await;

        let err = facade.get_entitlement(Uuid::new_v4(), false).await;
        assert!(matches!(err, Err(EntitlementError::AccountNotFound(_))));
    }
}
