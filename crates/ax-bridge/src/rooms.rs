use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::protocol::RoomMessage;

/// Per-connection send-queue capacity. A subscriber that falls this far
/// behind starts losing messages rather than back-pressuring broadcasters.
const ROOM_CHANNEL_CAPACITY: usize = 256;

/// Room name for an organization.
pub fn org_room(org_id: &str) -> String {
    format!("org:{org_id}")
}

struct HubInner {
    rooms: Mutex<HashMap<String, Vec<flume::Sender<Arc<RoomMessage>>>>>,
    closed: AtomicBool,
}

/// A room-scoped broadcast hub built on flume channels.
///
/// Each call to [`subscribe`](RoomHub::subscribe) registers a bounded
/// receiver on one room. Publishes fan out to that room's subscribers
/// only; disconnected receivers are pruned on the next publish. The hub is
/// cheap to clone. [`close`](RoomHub::close) runs at teardown: it drops
/// every sender so socket loops observe the disconnect and finish.
#[derive(Clone)]
pub struct RoomHub {
    inner: Arc<HubInner>,
}

impl RoomHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                rooms: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Register a new subscriber on `room` and return its receiving end.
    ///
    /// After [`close`](RoomHub::close) the returned receiver is already
    /// disconnected, so late connections fall straight through their
    /// receive loops.
    pub fn subscribe(&self, room: &str) -> flume::Receiver<Arc<RoomMessage>> {
        let (tx, rx) = flume::bounded(ROOM_CHANNEL_CAPACITY);
        if self.inner.closed.load(Ordering::Acquire) {
            return rx; // tx drops here, leaving the receiver disconnected
        }
        let mut rooms = self.inner.rooms.lock().expect("RoomHub lock poisoned");
        rooms.entry(room.to_string()).or_default().push(tx);
        rx
    }

    /// Publish a message to all subscribers of `room`.
    ///
    /// Slow consumers with a full queue miss this message; dropped
    /// receivers are removed. Empty rooms are cleaned up.
    pub fn publish(&self, room: &str, msg: RoomMessage) {
        if self.inner.closed.load(Ordering::Acquire) {
            return;
        }
        let msg = Arc::new(msg);
        let mut rooms = self.inner.rooms.lock().expect("RoomHub lock poisoned");
        let Some(senders) = rooms.get_mut(room) else {
            return;
        };
        senders.retain(|tx| match tx.try_send(Arc::clone(&msg)) {
            Ok(()) => true,
            Err(flume::TrySendError::Full(_)) => {
                debug!(room, "dropping message for slow room subscriber");
                true
            }
            Err(flume::TrySendError::Disconnected(_)) => false,
        });
        if senders.is_empty() {
            rooms.remove(room);
        }
    }

    /// Publish to an organization's room.
    pub fn publish_to_org(&self, org_id: &str, msg: RoomMessage) {
        self.publish(&org_room(org_id), msg);
    }

    /// Number of live subscribers in `room`.
    pub fn subscriber_count(&self, room: &str) -> usize {
        let rooms = self.inner.rooms.lock().expect("RoomHub lock poisoned");
        rooms.get(room).map(|s| s.len()).unwrap_or(0)
    }

    /// Tear the hub down: refuse new publishes/subscriptions and drop
    /// every sender so connected sockets see the disconnect and close.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let mut rooms = self.inner.rooms.lock().expect("RoomHub lock poisoned");
        let subscribers: usize = rooms.values().map(Vec::len).sum();
        rooms.clear();
        info!(subscribers, "room hub closed");
    }
}

impl Default for RoomHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_msg(task: &str) -> RoomMessage {
        RoomMessage::ExecutionLog {
            task_id: task.into(),
            log: "line\n".into(),
        }
    }

    #[test]
    fn messages_stay_inside_their_room() {
        let hub = RoomHub::new();
        let rx_a = hub.subscribe(&org_room("a"));
        let rx_b = hub.subscribe(&org_room("b"));

        hub.publish_to_org("a", log_msg("t1"));

        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn same_publisher_order_is_preserved() {
        let hub = RoomHub::new();
        let rx = hub.subscribe(&org_room("a"));

        for i in 0..10 {
            hub.publish_to_org("a", log_msg(&format!("t{i}")));
        }
        for i in 0..10 {
            let msg = rx.try_recv().unwrap();
            match &*msg {
                RoomMessage::ExecutionLog { task_id, .. } => {
                    assert_eq!(task_id, &format!("t{i}"));
                }
                other => panic!("unexpected message {other:?}"),
            }
        }
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let hub = RoomHub::new();
        let rx = hub.subscribe(&org_room("a"));
        assert_eq!(hub.subscriber_count(&org_room("a")), 1);

        drop(rx);
        hub.publish_to_org("a", log_msg("t1"));
        assert_eq!(hub.subscriber_count(&org_room("a")), 0);
    }

    #[test]
    fn slow_consumer_loses_messages_but_stays_subscribed() {
        let hub = RoomHub::new();
        let rx = hub.subscribe(&org_room("a"));

        for i in 0..(ROOM_CHANNEL_CAPACITY + 50) {
            hub.publish_to_org("a", log_msg(&format!("t{i}")));
        }

        // The queue is capped; the subscriber is still registered.
        assert_eq!(rx.len(), ROOM_CHANNEL_CAPACITY);
        assert_eq!(hub.subscriber_count(&org_room("a")), 1);
    }

    #[test]
    fn close_disconnects_existing_and_future_subscribers() {
        let hub = RoomHub::new();
        let rx = hub.subscribe(&org_room("a"));

        hub.close();

        // Existing receivers observe the disconnect.
        assert!(matches!(rx.try_recv(), Err(flume::TryRecvError::Disconnected)));

        // Publishes after close are dropped silently.
        hub.publish_to_org("a", log_msg("t1"));
        assert_eq!(hub.subscriber_count(&org_room("a")), 0);

        // Late subscribers come back already disconnected.
        let late = hub.subscribe(&org_room("a"));
        assert!(matches!(
            late.try_recv(),
            Err(flume::TryRecvError::Disconnected)
        ));
    }
}
