//! Degraded-Mode Resolver
//!
//! Decides entitlement from the last durable record when the provider
//! cannot be reached for a verified read. Read-only and advisory: paying
//! customers with a future paid-through date keep access, nobody gets
//! silently upgraded, and records past the trust horizon stop granting
//! access until the provider comes back.

use std::sync::Arc;

use chrono::Utc;
use studio_common::AccountId;

use crate::config::EntitlementConfig;
use crate::model::{AccessReason, EntitlementOutcome, Tier};
use crate::store::EntitlementStore;
use crate::EntitlementError;

/// Read-only outage fallback
pub struct DegradedResolver {
    config: EntitlementConfig,
    store: Arc<dyn EntitlementStore>,
}

impl DegradedResolver {
    /// Resolver over the shared store
    pub fn new(config: EntitlementConfig, store: Arc<dyn EntitlementStore>) -> Self {
        Self { config, store }
    }

    /// Resolve entitlement from the stored record during a provider outage.
    ///
    /// Every outcome is flagged `degraded`. Never writes.
    pub async fn resolve_on_failure(
        &self,
        account_id: AccountId,
    ) -> Result<EntitlementOutcome, EntitlementError> {
        let record = self
            .store
            .load(account_id)
            .await?
            .ok_or(EntitlementError::AccountNotFound(account_id))?;

        let now = Utc::now();
        let mut outcome = record.evaluate(now, self.config.grace_period, true);

        match record.tier {
            // paying tiers lean on the provider for verification; trust the
            // stored window only while the record is fresh enough
            Tier::Active | Tier::CanceledActive | Tier::PastDue => {
                if outcome.access_granted {
                    let age = now - record.last_reconciled_at;
                    if age <= self.config.max_record_staleness {
                        tracing::warn!(
                            "provider unreachable, trusting stored record for account {} (v{})",
                            account_id,
                            record.version
                        );
                        outcome.reason = AccessReason::ProviderUnreachable;
                    } else {
                        tracing::warn!(
                            "provider unreachable and record for account {} is {} days stale, withholding access",
                            account_id,
                            age.num_days()
                        );
                        outcome.access_granted = false;
                        outcome.reason = AccessReason::ProviderUnreachable;
                    }
                }
            }
            // trial, expired, and admin records never needed the provider
            _ => {}
        }

        Ok(outcome)
    }
}
