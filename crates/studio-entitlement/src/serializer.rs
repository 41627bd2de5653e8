//! Per-Account Serializer
//!
//! Grants mutual exclusion on reconciliation for one account at a time.
//! Unrelated accounts never serialize against each other.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use studio_common::AccountId;
use thiserror::Error;
use tokio::sync::Mutex;

/// Serializer error
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SerializerError {
    /// Lock wait exceeded the configured bound
    #[error("lock timeout for account {0}")]
    LockTimeout(AccountId),
    /// The calling task already holds this account's lock
    #[error("reentrant lock denied for account {0}")]
    ReentrantLockDenied(AccountId),
}

/// Keyed mutual exclusion over account ids
pub struct AccountSerializer {
    locks: DashMap<AccountId, Arc<Mutex<()>>>,
    holders: DashMap<AccountId, tokio::task::Id>,
    lock_timeout: Duration,
}

impl AccountSerializer {
    /// Serializer with the given lock-wait bound
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            locks: DashMap::new(),
            holders: DashMap::new(),
            lock_timeout,
        }
    }

    /// Run `f` inside the account's exclusive section.
    ///
    /// The lock is released on every exit path: success, error, and
    /// cancellation of the returned future. A task that re-enters for an
    /// account it already holds fails fast instead of deadlocking.
    pub async fn with_lock<T, F, Fut>(
        &self,
        account_id: AccountId,
        f: F,
    ) -> Result<T, SerializerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let current_task = tokio::task::try_id();

        if let Some(task_id) = current_task {
            let held_by_us = self
                .holders
                .get(&account_id)
                .map(|holder| *holder == task_id)
                .unwrap_or(false);
            if held_by_us {
                tracing::warn!("reentrant lock request for account {}", account_id);
                return Err(SerializerError::ReentrantLockDenied(account_id));
            }
        }

        let mutex = self
            .locks
            .entry(account_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let _guard = tokio::time::timeout(self.lock_timeout, mutex.lock())
            .await
            .map_err(|_| SerializerError::LockTimeout(account_id))?;

        let _holder = HolderGuard::record(&self.holders, account_id, current_task);

        Ok(f().await)
    }

    /// Number of accounts with a lock entry
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// True when no account has a lock entry
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Removes the holder entry when the exclusive section exits, including
/// on cancellation.
struct HolderGuard<'a> {
    holders: &'a DashMap<AccountId, tokio::task::Id>,
    account_id: Option<AccountId>,
}

impl<'a> HolderGuard<'a> {
    fn record(
        holders: &'a DashMap<AccountId, tokio::task::Id>,
        account_id: AccountId,
        task_id: Option<tokio::task::Id>,
    ) -> Self {
        match task_id {
            Some(task_id) => {
                holders.insert(account_id, task_id);
                Self {
                    holders,
                    account_id: Some(account_id),
                }
            }
            None => Self {
                holders,
                account_id: None,
            },
        }
    }
}

impl Drop for HolderGuard<'_> {
    fn drop(&mut self) {
        if let Some(account_id) = self.account_id {
            self.holders.remove(&account_id);
        }
    }
}
