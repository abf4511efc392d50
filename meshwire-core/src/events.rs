use std::sync::Mutex;

use futures::channel::mpsc;

use crate::{Connection, PeerId, utils::lock};

/// Lifecycle notifications for upgraded connections.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Emitted once an upgrade succeeded.
    Opened {
        remote_peer: PeerId,
        connection: Connection,
    },
    /// Emitted exactly once per connection, whichever side closed it.
    Closed {
        remote_peer: PeerId,
        connection: Connection,
    },
}

/// Fan-out of events to any number of subscribers.
///
/// Subscribers whose receiver was dropped are pruned on the next emit.
#[derive(Debug)]
pub struct EventBus<E> {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<E>>>,
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        EventBus {
            subscribers: Mutex::new(Vec::new()),
        }
    }
}

impl<E: Clone> EventBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<E> {
        let (tx, rx) = mpsc::unbounded();
        lock(&self.subscribers).push(tx);
        rx
    }

    pub fn emit(&self, event: E) {
        lock(&self.subscribers).retain(|tx| tx.unbounded_send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    #[tokio::test]
    async fn every_subscriber_sees_each_event() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.emit(1u8);
        bus.emit(2u8);
        assert_eq!(a.next().await, Some(1));
        assert_eq!(a.next().await, Some(2));
        assert_eq!(b.next().await, Some(1));
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        drop(bus.subscribe());
        let _kept = bus.subscribe();
        bus.emit(());
        assert_eq!(lock(&bus.subscribers).len(), 1);
    }
}
