//! Entitlement State Store
//!
//! Durable record of each account's current entitlement, written only by
//! the reconciliation engine. The trait is the seam for a real durable
//! backend; [`MemoryEntitlementStore`] is the in-process stand-in.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use studio_common::AccountId;
use thiserror::Error;

use crate::model::AccountEntitlement;

/// Store error
#[derive(Debug, Error)]
pub enum StoreError {
    /// Another writer committed after the caller loaded the record
    #[error("version conflict: expected {expected}, found {actual}")]
    VersionConflict {
        /// Version the caller loaded
        expected: u64,
        /// Version actually committed
        actual: u64,
    },
    /// Transient backend failure, worth retrying
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Whether a retry could succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Durable entitlement record storage.
///
/// `compare_and_put` is the only write, preconditioned on the version the
/// writer loaded; `expected_version` 0 means create. Reads always return
/// the latest committed record.
#[async_trait]
pub trait EntitlementStore: Send + Sync {
    /// Latest committed record for the account, if one exists
    async fn load(&self, account_id: AccountId) -> Result<Option<AccountEntitlement>, StoreError>;

    /// Commit `record` if the stored version still equals `expected_version`
    async fn compare_and_put(
        &self,
        record: AccountEntitlement,
        expected_version: u64,
    ) -> Result<(), StoreError>;

    /// Accounts whose access horizon has passed and a sweep would expire
    async fn accounts_due_for_sweep(
        &self,
        now: DateTime<Utc>,
        grace_period: Duration,
    ) -> Result<Vec<AccountId>, StoreError>;

    /// Number of stored records
    async fn len(&self) -> Result<usize, StoreError>;
}

/// In-memory store keyed by account id
pub struct MemoryEntitlementStore {
    records: DashMap<AccountId, AccountEntitlement>,
}

impl MemoryEntitlementStore {
    /// Empty store
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }
}

impl Default for MemoryEntitlementStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EntitlementStore for MemoryEntitlementStore {
    async fn load(&self, account_id: AccountId) -> Result<Option<AccountEntitlement>, StoreError> {
        Ok(self.records.get(&account_id).map(|r| r.clone()))
    }

    async fn compare_and_put(
        &self,
        record: AccountEntitlement,
        expected_version: u64,
    ) -> Result<(), StoreError> {
        // the entry guard holds the shard lock, making the check-and-write atomic
        match self.records.entry(record.account_id) {
            dashmap::mapref::entry::Entry::Occupied(mut slot) => {
                let actual = slot.get().version;
                if actual != expected_version {
                    return Err(StoreError::VersionConflict {
                        expected: expected_version,
                        actual,
                    });
                }
                slot.insert(record);
                Ok(())
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                if expected_version != 0 {
                    return Err(StoreError::VersionConflict {
                        expected: expected_version,
                        actual: 0,
                    });
                }
                slot.insert(record);
                Ok(())
            }
        }
    }

    async fn accounts_due_for_sweep(
        &self,
        now: DateTime<Utc>,
        grace_period: Duration,
    ) -> Result<Vec<AccountId>, StoreError> {
        Ok(self
            .records
            .iter()
            .filter(|r| r.sweep_due(now, grace_period))
            .map(|r| r.account_id)
            .collect())
    }

    async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.records.len())
    }
}
