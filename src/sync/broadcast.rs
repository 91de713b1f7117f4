//! Realtime fan-out of accepted changes.
//!
//! One publish/subscribe channel per owner: every live session for that
//! owner, across all devices, subscribes to the same channel. Each message
//! carries the full change plus the submitting device id; echo suppression
//! is cooperative, a subscriber discards messages whose `exclude_device_id`
//! equals its own device id.
//!
//! Delivery is at-least-once with no deduplication and no backpressure:
//! publishing is fire-and-forget, a slow subscriber never blocks a
//! publisher, and a lagged receiver recovers via delta sync rather than
//! message replay.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::{broadcast, RwLock};

use crate::models::SyncEntity;

/// Per-channel buffer. A receiver that falls further behind than this sees
/// `RecvError::Lagged` and should fall back to a delta pull.
const CHANNEL_CAPACITY: usize = 256;

/// Envelope published for every accepted change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeNotice {
    #[serde(flatten)]
    pub change: SyncEntity,
    /// Device that submitted the change. Subscribers representing this
    /// device must discard the message.
    pub exclude_device_id: String,
}

/// Tracks the per-owner broadcast channels.
pub struct SyncHub {
    channels: RwLock<HashMap<String, broadcast::Sender<ChangeNotice>>>,
}

impl SyncHub {
    /// Creates a new sync hub.
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Subscribes to changes for an owner.
    ///
    /// The returned [`Subscription`] is the only thing keeping the
    /// subscription alive; drop it (or call `unsubscribe`) when the session
    /// ends.
    pub async fn subscribe(&self, owner_id: &str) -> Subscription {
        let mut channels = self.channels.write().await;

        let receiver = match channels.get(owner_id) {
            Some(sender) => sender.subscribe(),
            None => {
                let (sender, receiver) = broadcast::channel(CHANNEL_CAPACITY);
                channels.insert(owner_id.to_string(), sender);
                receiver
            }
        };

        Subscription { receiver }
    }

    /// Publishes an accepted change to every current subscriber of the
    /// owner's channel. Fire-and-forget; an owner with no live sessions is
    /// not an error.
    pub async fn publish(&self, owner_id: &str, change: SyncEntity, exclude_device_id: &str) {
        let notice = ChangeNotice {
            change,
            exclude_device_id: exclude_device_id.to_string(),
        };

        {
            let channels = self.channels.read().await;
            match channels.get(owner_id) {
                Some(sender) => {
                    if sender.send(notice).is_ok() {
                        return;
                    }
                }
                None => return,
            }
        }

        // Send failed: no receivers left. Prune the channel so closed
        // sessions do not accumulate senders on the shared bus.
        let mut channels = self.channels.write().await;
        if let Some(sender) = channels.get(owner_id) {
            if sender.receiver_count() == 0 {
                channels.remove(owner_id);
                tracing::debug!(owner_id, "pruned idle broadcast channel");
            }
        }
    }

    /// Number of live subscribers for an owner.
    pub async fn subscriber_count(&self, owner_id: &str) -> usize {
        let channels = self.channels.read().await;
        channels
            .get(owner_id)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }
}

impl Default for SyncHub {
    fn default() -> Self {
        Self::new()
    }
}

/// An open subscription to one owner's change channel.
///
/// Explicit teardown handle: there is no implicit cleanup besides dropping
/// it. Messages are delivered in publish order for this channel; there is
/// no ordering guarantee relative to other owners' channels.
pub struct Subscription {
    receiver: broadcast::Receiver<ChangeNotice>,
}

impl Subscription {
    /// Waits for the next published change.
    ///
    /// `Err(Lagged)` means this session fell behind the channel buffer and
    /// should recover with a delta pull.
    pub async fn recv(&mut self) -> Result<ChangeNotice, broadcast::error::RecvError> {
        self.receiver.recv().await
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Result<ChangeNotice, broadcast::error::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Tears the subscription down. Equivalent to dropping the handle.
    pub fn unsubscribe(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntityType, SyncAction};
    use chrono::Utc;
    use serde_json::json;

    fn change(id: &str, owner: &str) -> SyncEntity {
        SyncEntity {
            id: id.to_string(),
            entity_type: EntityType::Bookmark,
            action: SyncAction::Update,
            payload: json!({"title": "Foo"}),
            timestamp: Utc::now(),
            owner_id: owner.to_string(),
        }
    }

    #[tokio::test]
    async fn test_subscribe_and_publish() {
        let hub = SyncHub::new();
        let mut sub = hub.subscribe("user1").await;

        hub.publish("user1", change("b1", "user1"), "device-a").await;

        let notice = sub.try_recv().unwrap();
        assert_eq!(notice.change.id, "b1");
        assert_eq!(notice.exclude_device_id, "device-a");
    }

    #[tokio::test]
    async fn test_owners_are_isolated() {
        let hub = SyncHub::new();
        let mut sub1 = hub.subscribe("user1").await;
        let mut sub2 = hub.subscribe("user2").await;

        hub.publish("user1", change("b1", "user1"), "device-a").await;

        assert!(sub1.try_recv().is_ok());
        assert!(sub2.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_echo_suppression_contract() {
        let hub = SyncHub::new();

        // Two live sessions for the same owner, on devices X and Y
        let mut session_x = hub.subscribe("user1").await;
        let mut session_y = hub.subscribe("user1").await;

        hub.publish("user1", change("b1", "user1"), "device-x").await;

        // Both receive the message; X discards by filtering on the marker
        let seen_by_x = session_x.try_recv().unwrap();
        let seen_by_y = session_y.try_recv().unwrap();
        assert_eq!(seen_by_x.exclude_device_id, "device-x"); // X drops it
        assert_eq!(seen_by_y.change.id, "b1"); // Y applies it
        assert_ne!(seen_by_y.exclude_device_id, "device-y");
    }

    #[tokio::test]
    async fn test_publish_order_preserved() {
        let hub = SyncHub::new();
        let mut sub = hub.subscribe("user1").await;

        for i in 0..5 {
            hub.publish("user1", change(&format!("b{}", i), "user1"), "d")
                .await;
        }

        for i in 0..5 {
            let notice = sub.try_recv().unwrap();
            assert_eq!(notice.change.id, format!("b{}", i));
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_noop() {
        let hub = SyncHub::new();
        // Never subscribed
        hub.publish("user1", change("b1", "user1"), "d").await;
        assert_eq!(hub.subscriber_count("user1").await, 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_tears_down_and_channel_is_pruned() {
        let hub = SyncHub::new();
        let sub = hub.subscribe("user1").await;
        assert_eq!(hub.subscriber_count("user1").await, 1);

        sub.unsubscribe();
        assert_eq!(hub.subscriber_count("user1").await, 0);

        // Next publish finds no receivers and prunes the entry
        hub.publish("user1", change("b1", "user1"), "d").await;
        let channels = hub.channels.read().await;
        assert!(!channels.contains_key("user1"));
    }

    #[tokio::test]
    async fn test_notice_wire_shape() {
        let notice = ChangeNotice {
            change: change("b1", "user1"),
            exclude_device_id: "device-a".to_string(),
        };
        let json = serde_json::to_value(&notice).unwrap();
        // SyncEntity fields flattened alongside the exclusion marker
        assert_eq!(json["id"], "b1");
        assert_eq!(json["entityType"], "bookmark");
        assert_eq!(json["excludeDeviceId"], "device-a");
    }
}
