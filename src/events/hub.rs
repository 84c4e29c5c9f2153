//! Subscriber set and event fan-out
//!
//! Each connected client owns a bounded queue drained by its connection
//! task. `publish()` serialises the event once and offers it to every queue
//! without blocking: a closed queue means the connection is gone and the
//! subscriber is removed; a full queue drops that event for that subscriber
//! only.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::protocol::Event;

/// Events buffered per subscriber before new ones are dropped
pub const SUBSCRIBER_QUEUE_DEPTH: usize = 64;

/// Failure to hand an event to one subscriber
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscriberWriteError {
    #[error("subscriber {0} disconnected")]
    Disconnected(Uuid),
    #[error("subscriber {0} is not keeping up")]
    QueueFull(Uuid),
}

/// A registered subscriber
struct Subscriber {
    peer: SocketAddr,
    queue: mpsc::Sender<Arc<str>>,
    dropped: u64,
}

impl Subscriber {
    fn offer(&mut self, id: Uuid, payload: &Arc<str>) -> Result<(), SubscriberWriteError> {
        match self.queue.try_send(payload.clone()) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped += 1;
                Err(SubscriberWriteError::QueueFull(id))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SubscriberWriteError::Disconnected(id)),
        }
    }
}

/// Receiving half handed to a connection task
pub struct Subscription {
    pub id: Uuid,
    pub events: mpsc::Receiver<Arc<str>>,
}

/// The set of connected subscribers
#[derive(Default)]
pub struct EventHub {
    subscribers: Mutex<HashMap<Uuid, Subscriber>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber
    pub fn subscribe(&self, peer: SocketAddr) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_DEPTH);
        let id = Uuid::new_v4();
        self.subscribers.lock().insert(
            id,
            Subscriber {
                peer,
                queue: tx,
                dropped: 0,
            },
        );
        tracing::info!(subscriber = %id, peer = %peer, "Subscriber added");
        Subscription { id, events: rx }
    }

    /// Remove a subscriber; returns how many remain
    pub fn unsubscribe(&self, id: Uuid) -> usize {
        let mut subscribers = self.subscribers.lock();
        if let Some(removed) = subscribers.remove(&id) {
            tracing::info!(
                subscriber = %id,
                peer = %removed.peer,
                dropped = removed.dropped,
                "Subscriber removed"
            );
        }
        subscribers.len()
    }

    /// Fan an event out to every subscriber
    ///
    /// Returns the number of subscribers the event was queued for.
    pub fn publish(&self, event: &Event) -> usize {
        let payload: Arc<str> = match event.to_json() {
            Ok(json) => json.into(),
            Err(e) => {
                tracing::error!("Failed to serialize event: {}", e);
                return 0;
            }
        };

        let mut delivered = 0;
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|id, subscriber| match subscriber.offer(*id, &payload) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(SubscriberWriteError::QueueFull(_)) => {
                if subscriber.dropped == 1 || subscriber.dropped % 100 == 0 {
                    tracing::warn!(
                        subscriber = %id,
                        dropped = subscriber.dropped,
                        "Subscriber lagging, dropping events"
                    );
                }
                true
            }
            Err(e @ SubscriberWriteError::Disconnected(_)) => {
                tracing::info!(peer = %subscriber.peer, "{}", e);
                false
            }
        });
        delivered
    }

    /// Number of connected subscribers
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.subscribers.lock().len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.subscribers.lock().is_empty()
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, id: Uuid) -> bool {
        self.subscribers.lock().contains_key(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 40000))
    }

    #[test]
    fn test_publish_reaches_every_subscriber() {
        let hub = EventHub::new();
        let mut a = hub.subscribe(peer());
        let mut b = hub.subscribe(peer());

        assert_eq!(hub.publish(&Event::Fps(30.0)), 2);
        assert_eq!(&*a.events.try_recv().unwrap(), r#"{"type":"fps","data":30.0}"#);
        assert_eq!(&*b.events.try_recv().unwrap(), r#"{"type":"fps","data":30.0}"#);
    }

    #[test]
    fn test_disconnected_subscriber_is_removed_without_blocking_others() {
        let hub = EventHub::new();
        let mut first = hub.subscribe(peer());
        let gone = hub.subscribe(peer());
        let mut last = hub.subscribe(peer());
        let gone_id = gone.id;
        drop(gone);

        assert_eq!(hub.publish(&Event::Fps(1.0)), 2);
        assert!(!hub.contains(gone_id));
        assert_eq!(hub.len(), 2);
        assert!(first.events.try_recv().is_ok());
        assert!(last.events.try_recv().is_ok());
    }

    #[test]
    fn test_full_queue_drops_event_but_keeps_subscriber() {
        let hub = EventHub::new();
        let stalled = hub.subscribe(peer());
        let mut live = hub.subscribe(peer());

        for _ in 0..SUBSCRIBER_QUEUE_DEPTH {
            hub.publish(&Event::Fps(1.0));
            live.events.try_recv().unwrap();
        }
        assert_eq!(hub.publish(&Event::Fps(2.0)), 1);
        assert!(hub.contains(stalled.id));
        assert!(live.events.try_recv().is_ok());
    }

    #[test]
    fn test_unsubscribe_reports_remaining() {
        let hub = EventHub::new();
        let a = hub.subscribe(peer());
        let b = hub.subscribe(peer());
        assert_eq!(hub.unsubscribe(a.id), 1);
        assert_eq!(hub.unsubscribe(a.id), 1);
        assert_eq!(hub.unsubscribe(b.id), 0);
        assert!(hub.is_empty());
        assert_eq!(hub.publish(&Event::Fps(1.0)), 0);
    }
}
