use dashmap::DashMap;
use tokio::sync::broadcast;

use plexus_core::{QueryEvent, SessionId};

/// Per-session fan-out of query events.
pub struct EventHub {
    channels: DashMap<SessionId, broadcast::Sender<QueryEvent>>,
    capacity: usize,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity,
        }
    }

    pub fn subscribe(&self, session_id: &SessionId) -> broadcast::Receiver<QueryEvent> {
        self.channels
            .entry(session_id.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Deliver to the event's session. Returns how many subscribers saw it.
    pub fn publish(&self, event: QueryEvent) -> usize {
        let session_id = event.session_id().clone();
        let delivered = match self.channels.get(&session_id) {
            Some(tx) => tx.send(event).unwrap_or(0),
            None => return 0,
        };
        if delivered == 0 {
            self.channels
                .remove_if(&session_id, |_, tx| tx.receiver_count() == 0);
        }
        delivered
    }

    /// Close the session's channel; subscribers observe the end of stream.
    pub fn close(&self, session_id: &SessionId) {
        self.channels.remove(session_id);
    }

    pub fn subscriber_count(&self, session_id: &SessionId) -> usize {
        self.channels
            .get(session_id)
            .map_or(0, |tx| tx.receiver_count())
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn done(s: &str) -> QueryEvent {
        QueryEvent::Done {
            session_id: SessionId::from_raw(s),
        }
    }

    #[tokio::test]
    async fn routes_by_session() {
        let hub = EventHub::default();
        let mut a = hub.subscribe(&SessionId::from_raw("a"));
        let mut b = hub.subscribe(&SessionId::from_raw("b"));

        assert_eq!(hub.publish(done("a")), 1);
        assert_eq!(a.recv().await.unwrap(), done("a"));
        assert!(b.try_recv().is_err());
        assert_eq!(hub.publish(done("nobody")), 0);
    }

    #[tokio::test]
    async fn abandoned_channels_are_dropped() {
        let hub = EventHub::default();
        let sid = SessionId::from_raw("a");
        drop(hub.subscribe(&sid));
        assert_eq!(hub.publish(done("a")), 0);
        assert_eq!(hub.subscriber_count(&sid), 0);
        assert!(hub.channels.is_empty());
    }

    #[tokio::test]
    async fn close_ends_subscriber_streams() {
        let hub = EventHub::default();
        let sid = SessionId::from_raw("a");
        let mut rx = hub.subscribe(&sid);
        hub.close(&sid);
        assert!(matches!(rx.recv().await, Err(broadcast::error::RecvError::Closed)));
    }
}
