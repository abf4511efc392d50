use std::{
    collections::BTreeMap,
    fmt,
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, SystemTime},
};

use futures::{
    AsyncWriteExt, FutureExt,
    channel::{mpsc, oneshot},
    future::{BoxFuture, Shared},
};
use meshwire_stream_select::{DialerSelectFuture, ListenerSelectFuture, NegotiationError};

use crate::{
    Error, PeerId,
    abort::{AbortSignal, abortable},
    events::{ConnectionEvent, EventBus},
    executor::Executor,
    muxing::{StreamMuxerBox, SubstreamBox},
    registrar::{IncomingStream, Registrar},
    utils::{self, BoxedStream, lock},
};

mod driver;
mod implicit;
mod stream;

pub use stream::{Direction, Stream, StreamId, StreamInfo};

use driver::{Command, Driver};
use implicit::{ImplicitIo, IoSlot};
use stream::StreamShared;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Dialer,
    Listener,
}

impl std::ops::Not for Endpoint {
    type Output = Endpoint;

    fn not(self) -> Self::Output {
        match self {
            Endpoint::Dialer => Endpoint::Listener,
            Endpoint::Listener => Endpoint::Dialer,
        }
    }
}

impl Endpoint {
    pub fn is_dialer(self) -> bool {
        matches!(self, Endpoint::Dialer)
    }

    pub fn is_listener(self) -> bool {
        matches!(self, Endpoint::Listener)
    }
}

/// Process-wide unique connection identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ConnectionId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Opening,
    Open,
    Closing,
    Closed,
}

/// When a connection passed each stage of its life.
#[derive(Debug, Copy, Clone)]
pub struct Timeline {
    pub open: SystemTime,
    pub upgraded: Option<SystemTime>,
    pub close: Option<SystemTime>,
}

impl Timeline {
    pub fn new() -> Self {
        Timeline {
            open: SystemTime::now(),
            upgraded: None,
            close: None,
        }
    }
}

impl Default for Timeline {
    fn default() -> Self {
        Self::new()
    }
}

/// The transport-facing half of an upgraded connection.
pub(crate) enum Multiplexing {
    Muxed {
        protocol: String,
        muxer: StreamMuxerBox,
    },
    /// No muxer was configured; the secured duplex is the only stream.
    Implicit(BoxedStream),
}

/// Everything [`Connection::new`] needs besides the transport.
pub(crate) struct ConnectionConfig {
    pub(crate) endpoint: Endpoint,
    pub(crate) local_peer: PeerId,
    pub(crate) remote_peer: PeerId,
    pub(crate) local_addr: SocketAddr,
    pub(crate) remote_addr: SocketAddr,
    pub(crate) encryption: String,
    pub(crate) timeline: Timeline,
}

/// Handles shared by every connection created by one upgrader.
#[derive(Clone)]
pub(crate) struct ConnectionContext {
    pub(crate) registrar: Registrar,
    pub(crate) executor: Arc<dyn Executor>,
    pub(crate) events: Arc<EventBus<ConnectionEvent>>,
    pub(crate) negotiation_timeout: Duration,
}

/// Options for [`Connection::new_stream_with_options`].
#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    pub signal: Option<AbortSignal>,
}

enum Link {
    Muxed {
        commands: mpsc::UnboundedSender<Command>,
        driver_done: Shared<oneshot::Receiver<()>>,
    },
    Implicit { slot: IoSlot, taken: AtomicBool },
}

struct StreamEntry {
    direction: Direction,
    protocol: Option<String>,
    opened: SystemTime,
    shared: Arc<StreamShared>,
}

pub(crate) struct ConnectionInner {
    id: ConnectionId,
    config: ConnectionConfig,
    multiplexer: Option<String>,
    status: Mutex<ConnectionStatus>,
    close_time: Mutex<Option<SystemTime>>,
    streams: Mutex<BTreeMap<StreamId, StreamEntry>>,
    next_stream_id: AtomicU64,
    link: Link,
    shutdown: Mutex<Option<Shared<BoxFuture<'static, ()>>>>,
    finalized: AtomicBool,
    context: ConnectionContext,
}

/// An upgraded connection to a remote peer.
///
/// Cloning yields another handle to the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    pub(crate) fn new(
        config: ConnectionConfig,
        multiplexing: Multiplexing,
        context: ConnectionContext,
    ) -> Connection {
        let (link, multiplexer, driver) = match multiplexing {
            Multiplexing::Muxed { protocol, muxer } => {
                let (commands, receiver) = mpsc::unbounded();
                let (done_tx, done_rx) = oneshot::channel();
                let link = Link::Muxed {
                    commands,
                    driver_done: done_rx.shared(),
                };
                (link, Some(protocol), Some((muxer, receiver, done_tx)))
            }
            Multiplexing::Implicit(stream) => {
                let link = Link::Implicit {
                    slot: Arc::new(Mutex::new(Some(stream))),
                    taken: AtomicBool::new(false),
                };
                (link, None, None)
            }
        };

        let inner = Arc::new(ConnectionInner {
            id: ConnectionId::next(),
            config,
            multiplexer,
            status: Mutex::new(ConnectionStatus::Opening),
            close_time: Mutex::new(None),
            streams: Mutex::new(BTreeMap::new()),
            next_stream_id: AtomicU64::new(0),
            link,
            shutdown: Mutex::new(None),
            finalized: AtomicBool::new(false),
            context,
        });

        *lock(&inner.status) = ConnectionStatus::Open;
        if let Some((muxer, receiver, done)) = driver {
            let driver = Driver::new(muxer, receiver, inner.clone());
            inner.context.executor.exec(driver.run(done).boxed());
        }

        Connection { inner }
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn endpoint(&self) -> Endpoint {
        self.inner.config.endpoint
    }

    pub fn local_peer(&self) -> PeerId {
        self.inner.config.local_peer
    }

    pub fn remote_peer(&self) -> PeerId {
        self.inner.config.remote_peer
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.config.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.config.remote_addr
    }

    /// Protocol id of the encrypter that secured this connection.
    pub fn encryption(&self) -> &str {
        &self.inner.config.encryption
    }

    /// Protocol id of the muxer, `None` for an unmultiplexed connection.
    pub fn multiplexer(&self) -> Option<&str> {
        self.inner.multiplexer.as_deref()
    }

    pub fn status(&self) -> ConnectionStatus {
        *lock(&self.inner.status)
    }

    pub fn timeline(&self) -> Timeline {
        Timeline {
            close: *lock(&self.inner.close_time),
            ..self.inner.config.timeline
        }
    }

    /// A snapshot of the currently open streams, ordered by id.
    pub fn streams(&self) -> Vec<StreamInfo> {
        lock(&self.inner.streams)
            .iter()
            .map(|(id, entry)| StreamInfo {
                id: *id,
                direction: entry.direction,
                protocol: entry.protocol.clone(),
                opened: entry.opened,
            })
            .collect()
    }

    /// Opens a stream and negotiates the first protocol of `protocols` the
    /// remote supports.
    pub async fn new_stream<I, P>(&self, protocols: I) -> Result<Stream, Error>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<str>,
    {
        self.new_stream_with_options(protocols, StreamOptions::default())
            .await
    }

    pub async fn new_stream_with_options<I, P>(
        &self,
        protocols: I,
        options: StreamOptions,
    ) -> Result<Stream, Error>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<str>,
    {
        let protocols: Vec<String> = protocols
            .into_iter()
            .map(|p| p.as_ref().to_owned())
            .collect();
        abortable(self.open_stream(protocols), options.signal.as_ref()).await
    }

    async fn open_stream(&self, protocols: Vec<String>) -> Result<Stream, Error> {
        let Link::Muxed { commands, .. } = &self.inner.link else {
            return Err(Error::MuxerUnavailable);
        };
        if self.status() != ConnectionStatus::Open {
            return Err(Error::ConnectionEnded);
        }

        let (tx, rx) = oneshot::channel();
        commands
            .unbounded_send(Command::Open(tx))
            .map_err(|_| Error::ConnectionEnded)?;
        let substream = rx.await.map_err(|_| Error::ConnectionEnded)??;

        let negotiation = DialerSelectFuture::new(substream, protocols);
        let (protocol, io) =
            match utils::timeout(negotiation, self.inner.context.negotiation_timeout).await? {
                Ok(selected) => selected,
                Err(NegotiationError::Failed) => {
                    tracing::debug!(
                        peer=%self.remote_peer(),
                        "No requested protocol is supported, resetting stream"
                    );
                    return Err(Error::UnsupportedProtocol);
                }
                Err(e) => return Err(e.into()),
            };
        tracing::trace!(peer=%self.remote_peer(), protocol=%protocol, "Opened outbound stream");

        self.inner
            .register_stream(Direction::Outbound, Some(protocol), Box::new(io))
            .ok_or(Error::ConnectionEnded)
    }

    /// Takes the secured duplex of an unmultiplexed connection as its only
    /// stream. Returns `None` if there is a muxer or it was already taken.
    pub fn take_implicit_stream(&self) -> Option<Stream> {
        let Link::Implicit { slot, taken } = &self.inner.link else {
            return None;
        };
        if taken.swap(true, Ordering::SeqCst) {
            return None;
        }
        let io = ImplicitIo::new(slot.clone(), Arc::downgrade(&self.inner));
        self.inner
            .register_stream(Direction::Outbound, None, Box::new(io))
    }

    /// Closes the connection gracefully.
    ///
    /// Open streams are reset and the muxer is shut down. Concurrent and
    /// repeated calls share one shutdown and all resolve once it is done.
    pub async fn close(&self) {
        let shutdown = lock(&self.inner.shutdown)
            .get_or_insert_with(|| self.inner.clone().shutdown().boxed().shared())
            .clone();
        shutdown.await
    }

    async fn handle_inbound(self, substream: SubstreamBox) {
        let handlers = self.inner.context.registrar.snapshot();
        let negotiation = ListenerSelectFuture::new(substream, handlers.keys().cloned());
        let (protocol, io) =
            match utils::timeout(negotiation, self.inner.context.negotiation_timeout).await {
                Ok(Ok(selected)) => selected,
                Ok(Err(e)) => {
                    tracing::debug!(
                        peer=%self.remote_peer(),
                        error=%e,
                        "Inbound stream negotiation failed, resetting stream"
                    );
                    return;
                }
                Err(e) => {
                    tracing::debug!(peer=%self.remote_peer(), error=%e, "Inbound stream negotiation stalled");
                    return;
                }
            };
        let Some(handler) = handlers.get(&protocol).cloned() else {
            return;
        };
        let Some(stream) =
            self.inner
                .register_stream(Direction::Inbound, Some(protocol.clone()), Box::new(io))
        else {
            return;
        };
        tracing::trace!(peer=%self.remote_peer(), protocol=%protocol, "Dispatching inbound stream");
        handler
            .call(IncomingStream {
                connection: self,
                stream,
                protocol,
            })
            .await;
    }
}

impl ConnectionInner {
    fn register_stream(
        self: &Arc<Self>,
        direction: Direction,
        protocol: Option<String>,
        io: BoxedStream,
    ) -> Option<Stream> {
        let mut streams = lock(&self.streams);
        // Checked under the table lock so a concurrent close cannot miss it.
        if *lock(&self.status) != ConnectionStatus::Open {
            return None;
        }
        let id = StreamId(self.next_stream_id.fetch_add(1, Ordering::Relaxed));
        let shared = Arc::new(StreamShared::default());
        streams.insert(
            id,
            StreamEntry {
                direction,
                protocol: protocol.clone(),
                opened: SystemTime::now(),
                shared: shared.clone(),
            },
        );
        Some(Stream::new(
            id,
            direction,
            protocol,
            io,
            shared,
            Arc::downgrade(self),
        ))
    }

    pub(crate) fn deregister_stream(&self, id: StreamId) {
        lock(&self.streams).remove(&id);
    }

    fn reset_streams(&self) {
        let streams = std::mem::take(&mut *lock(&self.streams));
        for entry in streams.values() {
            entry.shared.reset();
        }
    }

    /// Spawns negotiation and dispatch for a substream opened by the remote.
    fn accept_inbound(self: &Arc<Self>, substream: SubstreamBox) {
        let connection = Connection {
            inner: self.clone(),
        };
        self.context
            .executor
            .exec(connection.handle_inbound(substream).boxed());
    }

    async fn shutdown(self: Arc<Self>) {
        {
            let mut streams = lock(&self.streams);
            let mut status = lock(&self.status);
            if *status == ConnectionStatus::Open {
                *status = ConnectionStatus::Closing;
            }
            drop(status);
            for entry in std::mem::take(&mut *streams).values() {
                entry.shared.reset();
            }
        }
        tracing::debug!(peer=%self.config.remote_peer, id=%self.id, "Closing connection");

        match &self.link {
            Link::Muxed {
                commands,
                driver_done,
            } => {
                let _ = commands.unbounded_send(Command::Close);
                let _ = driver_done.clone().await;
            }
            Link::Implicit { slot, .. } => {
                let io = lock(slot).take();
                if let Some(mut io) = io
                    && let Err(e) = io.close().await
                {
                    tracing::debug!(peer=%self.config.remote_peer, error=%e, "Failed to close stream");
                }
            }
        }
        self.finalize();
    }

    /// Marks the connection closed and emits its close event, once.
    fn finalize(self: &Arc<Self>) {
        if self.finalized.swap(true, Ordering::SeqCst) {
            return;
        }
        *lock(&self.status) = ConnectionStatus::Closed;
        *lock(&self.close_time) = Some(SystemTime::now());
        self.reset_streams();
        tracing::debug!(peer=%self.config.remote_peer, id=%self.id, "Connection closed");

        self.context.events.emit(ConnectionEvent::Closed {
            remote_peer: self.config.remote_peer,
            connection: Connection {
                inner: self.clone(),
            },
        });
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("remote_peer", &self.inner.config.remote_peer)
            .field("remote_addr", &self.inner.config.remote_addr)
            .field("endpoint", &self.inner.config.endpoint)
            .field("status", &self.status())
            .finish()
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Connection {}
