use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use ulid::Ulid;

const CHANNEL_CAPACITY: usize = 256;

/// One outbound message. The core's contract is "emitted", not "delivered" —
/// a separate delivery worker consumes these asynchronously.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub recipient_id: Ulid,
    pub title: String,
    pub body: String,
    pub metadata: serde_json::Value,
}

/// Broadcast hub for per-recipient notification fan-out.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Notification>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self { channels: DashMap::new() }
    }

    /// Subscribe to a recipient's notifications. Creates the channel if needed.
    pub fn subscribe(&self, recipient_id: Ulid) -> broadcast::Receiver<Notification> {
        let sender = self
            .channels
            .entry(recipient_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Emit a notification. Fire-and-forget: a missing or full channel is
    /// logged, never an error the caller sees.
    pub fn send(&self, notification: Notification) {
        metrics::counter!(crate::observability::NOTIFICATIONS_EMITTED_TOTAL).increment(1);
        match self.channels.get(&notification.recipient_id) {
            Some(sender) => {
                if sender.send(notification).is_err() {
                    tracing::debug!("notification dropped: no live subscribers");
                }
            }
            None => tracing::debug!(
                recipient = %notification.recipient_id,
                "notification emitted with no delivery channel"
            ),
        }
    }

    /// Remove a recipient's channel (e.g. account closed).
    pub fn remove(&self, recipient_id: &Ulid) {
        self.channels.remove(recipient_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(recipient_id: Ulid, title: &str) -> Notification {
        Notification {
            recipient_id,
            title: title.into(),
            body: "body".into(),
            metadata: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let rid = Ulid::new();
        let mut rx = hub.subscribe(rid);

        hub.send(note(rid, "reservation confirmed"));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.title, "reservation confirmed");
        assert_eq!(received.recipient_id, rid);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        // No subscriber — should not panic
        hub.send(note(Ulid::new(), "nobody home"));
    }

    #[tokio::test]
    async fn recipients_are_isolated() {
        let hub = NotifyHub::new();
        let alice = Ulid::new();
        let bob = Ulid::new();
        let mut alice_rx = hub.subscribe(alice);
        let mut bob_rx = hub.subscribe(bob);

        hub.send(note(alice, "for alice"));

        assert_eq!(alice_rx.recv().await.unwrap().title, "for alice");
        assert!(bob_rx.try_recv().is_err());
    }
}
