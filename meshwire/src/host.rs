use std::{
    fmt, io,
    net::SocketAddr,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use futures::{StreamExt, channel::mpsc, future::BoxFuture};
use meshwire_core::{
    AllowAll, Connection, ConnectionEncrypter, ConnectionGater, ConnectionProtector,
    ConnectionStatus, Error, Keypair, ListenerEvent, PeerId, PublicKey, Registrar,
    RegistrarError, Stream, StreamHandler, StreamMuxerFactory, Transport, UpgradeOptions,
    Upgrader, UpgraderBuilder,
    transport::{TransportUpgradeError, Upgraded},
};
use meshwire_tcp as tcp;
use tokio::task::JoinHandle;

use crate::manager::{ConnectionManager, HostEvent};

pub const DEFAULT_MAX_CONNECTIONS: usize = 300;

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
    #[error(transparent)]
    Upgrade(#[from] Error),
    #[error(transparent)]
    Registrar(#[from] RegistrarError),
    #[error("refusing to dial the local peer")]
    DialSelf,
    #[error("address {0} was filtered out for the dialed peer")]
    AddressFiltered(SocketAddr),
    #[error("connection limit reached")]
    ConnectionLimit,
    #[error("listener closed before it was bound")]
    ListenerClosed,
    #[error("host is stopped")]
    Stopped,
    #[error("no tokio runtime is running")]
    NoRuntime,
}

impl From<TransportUpgradeError<io::Error>> for HostError {
    fn from(err: TransportUpgradeError<io::Error>) -> Self {
        match err {
            TransportUpgradeError::Transport(e) => HostError::Transport(e),
            TransportUpgradeError::Upgrade(e) => HostError::Upgrade(e),
        }
    }
}

/// Builder for [`Host`].
pub struct HostBuilder {
    keypair: Keypair,
    upgrader: UpgraderBuilder,
    gater: Arc<dyn ConnectionGater>,
    tcp: tcp::Config,
    max_connections: usize,
}

impl HostBuilder {
    fn new(keypair: Keypair) -> Self {
        let upgrader = Upgrader::builder(keypair.peer_id(), |future: BoxFuture<'static, ()>| {
            tokio::spawn(future);
        });
        HostBuilder {
            keypair,
            upgrader,
            gater: Arc::new(AllowAll),
            tcp: tcp::Config::new(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }

    pub fn tcp(mut self, config: tcp::Config) -> Self {
        self.tcp = config;
        self
    }

    pub fn encrypter(mut self, encrypter: impl ConnectionEncrypter) -> Self {
        self.upgrader = self.upgrader.encrypter(encrypter);
        self
    }

    pub fn muxer(mut self, muxer: impl StreamMuxerFactory) -> Self {
        self.upgrader = self.upgrader.muxer(muxer);
        self
    }

    pub fn protector(mut self, protector: impl ConnectionProtector) -> Self {
        self.upgrader = self.upgrader.protector(protector);
        self
    }

    pub fn gater(mut self, gater: impl ConnectionGater) -> Self {
        self.gater = Arc::new(gater);
        self
    }

    pub fn negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.upgrader = self.upgrader.negotiation_timeout(timeout);
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Builds the host and starts its connection manager on the current
    /// tokio runtime.
    pub fn build(self) -> Result<Host, HostError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| HostError::NoRuntime)?;
        let upgrader = self
            .upgrader
            .registrar(Registrar::new())
            .shared_gater(self.gater.clone())
            .build();

        let manager = ConnectionManager::new(self.max_connections);
        let manager_task = runtime.spawn(manager.clone().run(upgrader.subscribe()));

        tracing::info!(peer=%upgrader.local_peer(), "Host started");
        Ok(Host {
            inner: Arc::new(Inner {
                keypair: self.keypair,
                transport: self.tcp.upgrade(upgrader),
                gater: self.gater,
                manager,
                listeners: Mutex::new(Vec::new()),
                manager_task: Mutex::new(Some(manager_task)),
                stopped: AtomicBool::new(false),
            }),
        })
    }
}

struct Listener {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

struct Inner {
    keypair: Keypair,
    transport: Upgraded<tcp::Config>,
    gater: Arc<dyn ConnectionGater>,
    manager: ConnectionManager,
    listeners: Mutex<Vec<Listener>>,
    manager_task: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

/// A peer: TCP listeners and dialer, the upgrade pipeline, stream handlers
/// and a connection manager.
#[derive(Clone)]
pub struct Host {
    inner: Arc<Inner>,
}

impl Host {
    pub fn builder(keypair: Keypair) -> HostBuilder {
        HostBuilder::new(keypair)
    }

    pub fn local_peer(&self) -> PeerId {
        self.inner.keypair.peer_id()
    }

    pub fn public_key(&self) -> PublicKey {
        self.inner.keypair.public()
    }

    pub fn upgrader(&self) -> &Upgrader {
        self.inner.transport.upgrader()
    }

    pub fn listen_addrs(&self) -> Vec<SocketAddr> {
        lock(&self.inner.listeners).iter().map(|l| l.addr).collect()
    }

    /// Binds `addr` and accepts inbound connections in the background.
    /// Returns the bound address.
    pub async fn listen(&self, addr: SocketAddr) -> Result<SocketAddr, HostError> {
        self.ensure_running()?;
        let mut listener = Box::pin(self.inner.transport.listen(addr)?);
        let bound = match listener.next().await {
            Some(ListenerEvent::Listened(bound)) => bound,
            Some(ListenerEvent::Error(e)) | Some(ListenerEvent::Closed(Err(e))) => {
                return Err(e.into());
            }
            _ => return Err(HostError::ListenerClosed),
        };
        tracing::info!(addr=%bound, "Listening");

        let task = tokio::spawn(async move {
            while let Some(event) = listener.next().await {
                match event {
                    ListenerEvent::Incoming {
                        remote_addr,
                        upgrade,
                        ..
                    } => {
                        tokio::spawn(async move {
                            match upgrade.await {
                                Ok(connection) => tracing::debug!(
                                    peer=%connection.remote_peer(),
                                    remote_addr=%remote_addr,
                                    "Accepted connection"
                                ),
                                Err(e) => tracing::debug!(
                                    remote_addr=%remote_addr,
                                    error=%e,
                                    "Inbound upgrade failed"
                                ),
                            }
                        });
                    }
                    ListenerEvent::Error(e) => {
                        tracing::warn!(addr=%bound, error=%e, "Listener error");
                    }
                    ListenerEvent::Closed(_) => break,
                    ListenerEvent::Listened(_) => {}
                }
            }
            tracing::debug!(addr=%bound, "Listener stopped");
        });
        lock(&self.inner.listeners).push(Listener { addr: bound, task });
        Ok(bound)
    }

    /// Dials `addr`. With a `peer`, an open connection to it is reused and
    /// the secured identity must match.
    pub async fn dial(&self, addr: SocketAddr, peer: Option<PeerId>) -> Result<Connection, HostError> {
        let mut options = UpgradeOptions::default();
        if let Some(peer) = peer {
            options = options.with_remote_peer(peer);
        }
        self.dial_with_options(addr, options).await
    }

    pub async fn dial_with_options(
        &self,
        addr: SocketAddr,
        options: UpgradeOptions,
    ) -> Result<Connection, HostError> {
        self.ensure_running()?;
        let gater = &self.inner.gater;
        if let Some(peer) = &options.remote_peer {
            if *peer == self.local_peer() {
                return Err(HostError::DialSelf);
            }
            if gater.deny_dial_peer(peer) {
                tracing::debug!(peer=%peer, "Dial denied by gater");
                return Err(Error::ConnectionDenied.into());
            }
            if let Some(existing) = self
                .inner
                .manager
                .connections(Some(peer))
                .into_iter()
                .find(|c| c.status() == ConnectionStatus::Open)
            {
                tracing::trace!(peer=%peer, id=%existing.id(), "Reusing open connection");
                return Ok(existing);
            }
            if !gater.filter_multiaddr_for_peer(peer, &addr) {
                return Err(HostError::AddressFiltered(addr));
            }
        }
        if gater.deny_dial_multiaddr(options.remote_peer.as_ref(), &addr) {
            tracing::debug!(addr=%addr, "Dial denied by gater");
            return Err(Error::ConnectionDenied.into());
        }

        tracing::debug!(addr=%addr, peer=?options.remote_peer, "Dialing");
        let connection = self.inner.transport.dial(addr, options)?.await?;
        if !self.inner.manager.admit(connection.clone()).await {
            return Err(HostError::ConnectionLimit);
        }
        Ok(connection)
    }

    /// Dials and opens a stream for the first of `protocols` the remote
    /// supports.
    pub async fn dial_protocol<I, P>(
        &self,
        addr: SocketAddr,
        peer: Option<PeerId>,
        protocols: I,
    ) -> Result<Stream, HostError>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<str>,
    {
        let connection = self.dial(addr, peer).await?;
        Ok(connection.new_stream(protocols).await?)
    }

    pub fn handle<I, P, H>(&self, protocols: I, handler: H) -> Result<(), HostError>
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
        H: StreamHandler,
    {
        Ok(self.upgrader().registrar().handle(protocols, handler)?)
    }

    pub fn unhandle<I, P>(&self, protocols: I)
    where
        I: IntoIterator<Item = P>,
        P: AsRef<str>,
    {
        self.upgrader().registrar().unhandle(protocols)
    }

    /// Open connections to `peer`, or all of them.
    pub fn connections(&self, peer: Option<&PeerId>) -> Vec<Connection> {
        self.inner.manager.connections(peer)
    }

    pub fn events(&self) -> mpsc::UnboundedReceiver<HostEvent> {
        self.inner.manager.subscribe()
    }

    /// Stops listening and closes every connection. Idempotent.
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        for listener in lock(&self.inner.listeners).drain(..) {
            listener.task.abort();
        }
        self.inner.manager.close_all().await;
        if let Some(task) = lock(&self.inner.manager_task).take() {
            task.abort();
        }
        tracing::info!(peer=%self.local_peer(), "Host stopped");
    }

    fn ensure_running(&self) -> Result<(), HostError> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(HostError::Stopped);
        }
        Ok(())
    }
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("local_peer", &self.local_peer())
            .field("listen_addrs", &self.listen_addrs())
            .field("manager", &self.inner.manager)
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
