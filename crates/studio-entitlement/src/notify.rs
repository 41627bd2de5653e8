//! Entitlement Change Notifications
//!
//! Broadcast channel other layers subscribe to for cross-session cache
//! invalidation. At-least-once from the consumer's point of view, no
//! ordering across sessions; a lagging or absent receiver never blocks
//! the engine.

use serde::{Deserialize, Serialize};
use studio_common::AccountId;
use tokio::sync::broadcast;

use crate::model::Tier;

/// Default buffered notifications per receiver
const DEFAULT_CAPACITY: usize = 256;

/// Published after every committed entitlement mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitlementChanged {
    /// Account whose record changed
    pub account_id: AccountId,
    /// Version of the committed record
    pub version: u64,
    /// Tier after the change
    pub tier: Tier,
}

/// Broadcast fan-out for entitlement changes
pub struct EntitlementNotifier {
    sender: broadcast::Sender<EntitlementChanged>,
}

impl EntitlementNotifier {
    /// Notifier with the default buffer
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Notifier buffering `capacity` notifications per receiver
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// New subscription receiving changes published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<EntitlementChanged> {
        self.sender.subscribe()
    }

    /// Publish a change; dropped silently when nobody is subscribed
    pub fn publish(&self, change: EntitlementChanged) {
        if self.sender.send(change).is_err() {
            tracing::trace!("entitlement change published with no subscribers");
        }
    }

    /// Number of live subscribers
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EntitlementNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_subscribers_receive_changes() {
        let notifier = EntitlementNotifier::new();
        let mut rx_a = notifier.subscribe();
        let mut rx_b = notifier.subscribe();

        let change = EntitlementChanged {
            account_id: Uuid::new_v4(),
            version: 3,
            tier: Tier::Active,
        };
        notifier.publish(change.clone());

        assert_eq!(rx_a.recv().await.unwrap(), change);
        assert_eq!(rx_b.recv().await.unwrap(), change);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_harmless() {
        let notifier = EntitlementNotifier::new();
        notifier.publish(EntitlementChanged {
            account_id: Uuid::new_v4(),
            version: 1,
            tier: Tier::Trial,
        });
        assert_eq!(notifier.receiver_count(), 0);
    }
}
