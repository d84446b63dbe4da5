//! Event types for the Parley event system
//!
//! Provides the store-side event definitions and the EventBus that backs
//! live insert feeds and the server's SSE stream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::message::Message;
use crate::owner::{AnonymousId, UserId};

/// Parley store events
///
/// Events are broadcast via EventBus and can be serialized for SSE transmission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ParleyEvent {
    /// A message row was inserted
    ///
    /// Triggers:
    /// - Live insert feeds whose filter matches the row owner
    /// - SSE: push to connected clients
    MessageInserted {
        message: Message,
        timestamp: DateTime<Utc>,
    },

    /// Anonymous history was reassigned to a user
    ///
    /// Not part of the insert feed; clients re-snapshot to observe it.
    OwnershipReassigned {
        anonymous_id: AnonymousId,
        user_id: UserId,
        /// Number of rows moved
        moved: u64,
        timestamp: DateTime<Utc>,
    },
}

impl ParleyEvent {
    /// Get the event type as a string, used as the SSE event name
    pub fn event_type(&self) -> &str {
        match self {
            ParleyEvent::MessageInserted { .. } => "MessageInserted",
            ParleyEvent::OwnershipReassigned { .. } => "OwnershipReassigned",
        }
    }
}

/// Central event distribution bus
///
/// Uses tokio::broadcast internally, providing:
/// - Non-blocking publish (slow subscribers don't block producers)
/// - Multiple concurrent subscribers
/// - Lagged message detection for slow subscribers
///
/// # Examples
///
/// ```
/// use parley_common::events::EventBus;
///
/// let bus = EventBus::new(256);
/// let _rx = bus.subscribe();
/// assert_eq!(bus.subscriber_count(), 1);
/// ```
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ParleyEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// * `capacity` - Number of events buffered before slow receivers lag
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    ///
    /// Events emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<ParleyEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: ParleyEvent,
    ) -> Result<usize, broadcast::error::SendError<ParleyEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: ParleyEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{CorrelationHandle, MessageContent};
    use crate::owner::OwnerRef;

    fn inserted() -> ParleyEvent {
        ParleyEvent::MessageInserted {
            message: Message::ai(
                OwnerRef::Anonymous(AnonymousId::generate()),
                CorrelationHandle::generate(),
                MessageContent::AiReply { text: "ok".into() },
                Utc::now(),
            ),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_eventbus_new() {
        let bus = EventBus::new(100);
        assert_eq!(bus.capacity(), 100);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_eventbus_emit_without_subscribers_fails() {
        let bus = EventBus::new(4);
        assert!(bus.emit(inserted()).is_err());
        // lossy variant never panics
        bus.emit_lossy(inserted());
    }

    #[test]
    fn test_eventbus_multiple_subscribers() {
        let bus = EventBus::new(10);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.emit(inserted()).expect("emit should succeed");

        assert_eq!(rx1.try_recv().unwrap().event_type(), "MessageInserted");
        assert_eq!(rx2.try_recv().unwrap().event_type(), "MessageInserted");
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = ParleyEvent::OwnershipReassigned {
            anonymous_id: AnonymousId::generate(),
            user_id: UserId::new("u1").unwrap(),
            moved: 3,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "OwnershipReassigned");
        assert_eq!(json["moved"], 3);
    }
}
