use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use futures::{StreamExt, channel::mpsc, future};
use meshwire_core::{Connection, ConnectionEvent, ConnectionStatus, EventBus, PeerId};

/// Peer-level notifications derived from connection lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    /// The first connection to a peer was opened.
    PeerConnect(PeerId),
    /// The last connection to a peer was closed.
    PeerDisconnect(PeerId),
}

struct Inner {
    connections: Mutex<HashMap<PeerId, Vec<Connection>>>,
    max_connections: usize,
    events: EventBus<HostEvent>,
}

/// Tracks open connections per peer and enforces a connection limit.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(max_connections: usize) -> Self {
        ConnectionManager {
            inner: Arc::new(Inner {
                connections: Mutex::new(HashMap::new()),
                max_connections,
                events: EventBus::new(),
            }),
        }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<HostEvent> {
        self.inner.events.subscribe()
    }

    /// Open connections to `peer`, or to everyone when `peer` is `None`.
    pub fn connections(&self, peer: Option<&PeerId>) -> Vec<Connection> {
        let connections = self.lock();
        match peer {
            Some(peer) => connections.get(peer).cloned().unwrap_or_default(),
            None => connections.values().flatten().cloned().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Starts tracking `connection`. Returns `false` if the limit is reached.
    ///
    /// Adding a connection twice is a no-op.
    pub fn add(&self, connection: &Connection) -> bool {
        let peer = connection.remote_peer();
        let first = {
            let mut connections = self.lock();
            let known = connections
                .get(&peer)
                .is_some_and(|list| list.iter().any(|c| c.id() == connection.id()));
            // Status flips to closed before the closed event goes out, so a
            // connection seen closed here has already been removed.
            if known || connection.status() == ConnectionStatus::Closed {
                return true;
            }
            let total: usize = connections.values().map(Vec::len).sum();
            if total >= self.inner.max_connections {
                return false;
            }
            let list = connections.entry(peer).or_default();
            list.push(connection.clone());
            list.len() == 1
        };
        tracing::debug!(peer=%peer, id=%connection.id(), "Tracking connection");
        if first {
            self.inner.events.emit(HostEvent::PeerConnect(peer));
        }
        true
    }

    pub fn remove(&self, connection: &Connection) {
        let peer = connection.remote_peer();
        let last = {
            let mut connections = self.lock();
            let Some(list) = connections.get_mut(&peer) else {
                return;
            };
            let before = list.len();
            list.retain(|c| c.id() != connection.id());
            if list.len() == before {
                return;
            }
            if list.is_empty() {
                connections.remove(&peer);
                true
            } else {
                false
            }
        };
        tracing::debug!(peer=%peer, id=%connection.id(), "Stopped tracking connection");
        if last {
            self.inner.events.emit(HostEvent::PeerDisconnect(peer));
        }
    }

    /// Tracks `connection`, closing it when the limit is reached.
    pub async fn admit(&self, connection: Connection) -> bool {
        if self.add(&connection) {
            return true;
        }
        tracing::warn!(
            peer=%connection.remote_peer(),
            max=self.inner.max_connections,
            "Connection limit reached, closing connection"
        );
        connection.close().await;
        false
    }

    /// Applies connection events until the sender side goes away.
    pub async fn run(self, mut events: mpsc::UnboundedReceiver<ConnectionEvent>) {
        while let Some(event) = events.next().await {
            match event {
                ConnectionEvent::Opened { connection, .. } => {
                    if !self.add(&connection) {
                        let manager = self.clone();
                        tokio::spawn(async move {
                            manager.admit(connection).await;
                        });
                    }
                }
                ConnectionEvent::Closed { connection, .. } => self.remove(&connection),
            }
        }
    }

    /// Closes every tracked connection and waits for all of them.
    pub async fn close_all(&self) {
        let connections = self.connections(None);
        future::join_all(connections.into_iter().map(|connection| async move {
            connection.close().await;
            self.remove(&connection);
        }))
        .await;
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PeerId, Vec<Connection>>> {
        self.inner
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("connections", &self.len())
            .field("max_connections", &self.inner.max_connections)
            .finish()
    }
}
