use std::{
    fmt,
    sync::Arc,
    time::{Duration, SystemTime},
};

use futures::{AsyncRead, AsyncWrite, AsyncWriteExt, FutureExt, channel::mpsc, future::BoxFuture};

use crate::{
    Connection, Endpoint, Error, Negotiated, PeerId, Upgrade,
    abort::{AbortSignal, abortable},
    connection::{ConnectionConfig, ConnectionContext, Multiplexing},
    events::{ConnectionEvent, EventBus},
    executor::Executor,
    gater::{AllowAll, ConnectionGater},
    muxing::{MultiplexUpgrade, StreamMuxerExt, StreamMuxerFactory},
    protector::ConnectionProtector,
    registrar::Registrar,
    registry::Registry,
    security::{ConnectionEncrypter, SecuredConnection, SecurityUpgrade},
    transport::RawConnection,
    upgrade::{UpgradeApply, UpgradeError},
    utils::{self, BoxedStream},
};

/// Bound on each negotiation and handshake phase of an upgrade.
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Options for a single upgrade.
#[derive(Debug, Clone, Default)]
pub struct UpgradeOptions {
    /// The peer a dialer expects to reach. A different secured identity
    /// fails the upgrade with [`Error::UnexpectedPeer`].
    pub remote_peer: Option<PeerId>,
    pub signal: Option<AbortSignal>,
}

impl UpgradeOptions {
    pub fn with_remote_peer(mut self, peer: PeerId) -> Self {
        self.remote_peer = Some(peer);
        self
    }

    pub fn with_signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }
}

struct Inner {
    local_peer: PeerId,
    encrypters: Registry<dyn ConnectionEncrypter>,
    muxers: Registry<dyn StreamMuxerFactory>,
    protector: Option<Arc<dyn ConnectionProtector>>,
    gater: Arc<dyn ConnectionGater>,
    context: ConnectionContext,
}

/// Turns raw transport connections into [`Connection`]s.
///
/// Each upgrade runs gate, protect, encrypt and multiplex in that order.
/// A failure at any stage closes the raw connection.
#[derive(Clone)]
pub struct Upgrader {
    inner: Arc<Inner>,
}

impl Upgrader {
    pub fn builder(local_peer: PeerId, executor: impl Executor + 'static) -> UpgraderBuilder {
        UpgraderBuilder {
            local_peer,
            executor: Arc::new(executor),
            encrypters: Registry::new(),
            muxers: Registry::new(),
            protector: None,
            gater: Arc::new(AllowAll),
            registrar: Registrar::new(),
            events: Arc::new(EventBus::new()),
            negotiation_timeout: DEFAULT_NEGOTIATION_TIMEOUT,
        }
    }

    pub fn local_peer(&self) -> PeerId {
        self.inner.local_peer
    }

    pub fn registrar(&self) -> &Registrar {
        &self.inner.context.registrar
    }

    pub fn gater(&self) -> &Arc<dyn ConnectionGater> {
        &self.inner.gater
    }

    /// Subscribes to the open and close events of every connection this
    /// upgrader creates.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ConnectionEvent> {
        self.inner.context.events.subscribe()
    }

    /// Upgrades a connection we dialed.
    pub async fn upgrade_outbound<C>(
        &self,
        raw: RawConnection<C>,
        options: UpgradeOptions,
    ) -> Result<Connection, Error>
    where
        C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        self.upgrade(raw, Endpoint::Dialer, options).await
    }

    /// Upgrades a connection accepted by a listener.
    pub async fn upgrade_inbound<C>(
        &self,
        raw: RawConnection<C>,
        options: UpgradeOptions,
    ) -> Result<Connection, Error>
    where
        C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        self.upgrade(raw, Endpoint::Listener, options).await
    }

    async fn upgrade<C>(
        &self,
        raw: RawConnection<C>,
        endpoint: Endpoint,
        options: UpgradeOptions,
    ) -> Result<Connection, Error>
    where
        C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let RawConnection {
            stream,
            local_addr,
            remote_addr,
            mut timeline,
        } = raw;

        let denied = match endpoint {
            Endpoint::Dialer => self.inner.gater.deny_outbound_connection(&remote_addr),
            Endpoint::Listener => self.inner.gater.deny_inbound_connection(&remote_addr),
        };
        if denied {
            tracing::debug!(remote_addr=%remote_addr, ?endpoint, "Connection denied by gater");
            close_stream(Box::new(stream)).await;
            return Err(Error::ConnectionDenied);
        }

        let expected = options.remote_peer;
        let (secured, multiplexing) = abortable(
            self.secure_and_multiplex(Box::new(stream), endpoint, expected),
            options.signal.as_ref(),
        )
        .await?;

        timeline.upgraded = Some(SystemTime::now());
        let remote_peer = secured.remote_peer;
        let connection = Connection::new(
            ConnectionConfig {
                endpoint,
                local_peer: self.inner.local_peer,
                remote_peer,
                local_addr,
                remote_addr,
                encryption: secured.protocol,
                timeline,
            },
            multiplexing,
            self.inner.context.clone(),
        );
        tracing::debug!(
            peer=%remote_peer,
            remote_addr=%remote_addr,
            ?endpoint,
            encryption=%connection.encryption(),
            muxer=?connection.multiplexer(),
            "Connection upgraded"
        );
        self.inner.context.events.emit(ConnectionEvent::Opened {
            remote_peer,
            connection: connection.clone(),
        });
        Ok(connection)
    }

    /// Protect, encrypt and multiplex. Whatever stage fails drops the stream,
    /// which closes the underlying transport connection.
    async fn secure_and_multiplex(
        &self,
        io: BoxedStream,
        endpoint: Endpoint,
        expected: Option<PeerId>,
    ) -> Result<(SecuredMeta, Multiplexing), Error> {
        let timeout = self.inner.context.negotiation_timeout;

        let io = match &self.inner.protector {
            Some(protector) => utils::timeout(protector.protect(io), timeout)
                .await?
                .map_err(|e| {
                    tracing::debug!(?endpoint, error=%e, "Failed to protect connection");
                    Error::ProtectionFailed(e)
                })?,
            None => io,
        };

        let security = SecurityUpgrade::new(self.inner.encrypters.clone(), expected);
        let SecuredConnection {
            remote_peer,
            protocol,
            stream,
        } = utils::timeout(apply_boxed(io, security, endpoint), timeout)
            .await?
            .map_err(|e| {
                let e = std::io::Error::from(e);
                tracing::debug!(?endpoint, error=%e, "Failed to encrypt connection");
                Error::EncryptionFailed(e)
            })?;

        if let Some(expected) = expected
            && endpoint.is_dialer()
            && expected != remote_peer
        {
            tracing::debug!(expected=%expected, actual=%remote_peer, "Secured identity does not match dialed peer");
            close_stream(stream).await;
            return Err(Error::UnexpectedPeer {
                expected,
                actual: remote_peer,
            });
        }

        let denied = match endpoint {
            Endpoint::Dialer => self.inner.gater.deny_outbound_encrypted_connection(&remote_peer),
            Endpoint::Listener => self.inner.gater.deny_inbound_encrypted_connection(&remote_peer),
        };
        if denied {
            tracing::debug!(peer=%remote_peer, ?endpoint, "Encrypted connection denied by gater");
            close_stream(stream).await;
            return Err(Error::ConnectionDenied);
        }

        let multiplexing = if self.inner.muxers.is_empty() {
            Multiplexing::Implicit(stream)
        } else {
            let upgrade = MultiplexUpgrade::new(self.inner.muxers.clone());
            // A remote without muxers never answers.
            let (protocol, muxer) = utils::timeout(apply_boxed(stream, upgrade, endpoint), timeout)
                .await
                .map_err(|_| {
                    tracing::debug!(peer=%remote_peer, "Muxer negotiation timed out");
                    Error::MuxerUnavailable
                })?
                .map_err(|e| {
                    let e = std::io::Error::from(e);
                    tracing::debug!(peer=%remote_peer, error=%e, "Failed to negotiate a stream muxer");
                    Error::MuxerUnavailable
                })?;
            Multiplexing::Muxed { protocol, muxer }
        };

        let denied = match endpoint {
            Endpoint::Dialer => self.inner.gater.deny_outbound_upgraded_connection(&remote_peer),
            Endpoint::Listener => self.inner.gater.deny_inbound_upgraded_connection(&remote_peer),
        };
        if denied {
            tracing::debug!(peer=%remote_peer, ?endpoint, "Upgraded connection denied by gater");
            match multiplexing {
                Multiplexing::Muxed { muxer, .. } => {
                    if let Err(e) = muxer.close().await {
                        tracing::debug!(peer=%remote_peer, error=%e, "Failed to close muxer");
                    }
                }
                Multiplexing::Implicit(stream) => close_stream(stream).await,
            }
            return Err(Error::ConnectionDenied);
        }

        Ok((
            SecuredMeta {
                remote_peer,
                protocol,
            },
            multiplexing,
        ))
    }
}

/// Identity and protocol of a secured connection.
struct SecuredMeta {
    remote_peer: PeerId,
    protocol: String,
}

/// Boxes an [`UpgradeApply`] so the upgrade futures only hold a `Send`
/// trait object.
fn apply_boxed<U>(
    io: BoxedStream,
    upgrade: U,
    endpoint: Endpoint,
) -> BoxFuture<'static, Result<U::Output, UpgradeError<U::Error>>>
where
    U: Upgrade<Negotiated<BoxedStream>>,
    UpgradeApply<BoxedStream, U>: Send + 'static,
{
    UpgradeApply::new(io, upgrade, endpoint).boxed()
}

async fn close_stream(mut io: BoxedStream) {
    if let Err(e) = io.close().await {
        tracing::trace!(error=%e, "Failed to close raw connection");
    }
}

impl fmt::Debug for Upgrader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Upgrader")
            .field("local_peer", &self.inner.local_peer)
            .field("encrypters", &self.inner.encrypters)
            .field("muxers", &self.inner.muxers)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Upgrader`].
pub struct UpgraderBuilder {
    local_peer: PeerId,
    executor: Arc<dyn Executor>,
    encrypters: Registry<dyn ConnectionEncrypter>,
    muxers: Registry<dyn StreamMuxerFactory>,
    protector: Option<Arc<dyn ConnectionProtector>>,
    gater: Arc<dyn ConnectionGater>,
    registrar: Registrar,
    events: Arc<EventBus<ConnectionEvent>>,
    negotiation_timeout: Duration,
}

impl UpgraderBuilder {
    /// Adds an encrypter. Earlier encrypters are preferred when dialing.
    pub fn encrypter(mut self, encrypter: impl ConnectionEncrypter) -> Self {
        let protocol = encrypter.protocol().to_owned();
        self.encrypters.insert(protocol, Arc::new(encrypter));
        self
    }

    /// Adds a muxer. Earlier muxers are preferred when dialing.
    pub fn muxer(mut self, muxer: impl StreamMuxerFactory) -> Self {
        let protocol = muxer.protocol().to_owned();
        self.muxers.insert(protocol, Arc::new(muxer));
        self
    }

    pub fn protector(mut self, protector: impl ConnectionProtector) -> Self {
        self.protector = Some(Arc::new(protector));
        self
    }

    pub fn gater(mut self, gater: impl ConnectionGater) -> Self {
        self.gater = Arc::new(gater);
        self
    }

    /// Shares a gater with other components, e.g. a host that also checks
    /// it before dialing.
    pub fn shared_gater(mut self, gater: Arc<dyn ConnectionGater>) -> Self {
        self.gater = gater;
        self
    }

    /// Dispatches inbound streams through `registrar` instead of a fresh one.
    pub fn registrar(mut self, registrar: Registrar) -> Self {
        self.registrar = registrar;
        self
    }

    pub fn events(mut self, events: Arc<EventBus<ConnectionEvent>>) -> Self {
        self.events = events;
        self
    }

    pub fn negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.negotiation_timeout = timeout;
        self
    }

    pub fn build(self) -> Upgrader {
        Upgrader {
            inner: Arc::new(Inner {
                local_peer: self.local_peer,
                encrypters: self.encrypters,
                muxers: self.muxers,
                protector: self.protector,
                gater: self.gater,
                context: ConnectionContext {
                    registrar: self.registrar,
                    executor: self.executor,
                    events: self.events,
                    negotiation_timeout: self.negotiation_timeout,
                },
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use tokio::io::DuplexStream;
    use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};

    use super::*;
    use crate::{Keypair, abort::AbortController};

    fn assert_send<T: Send>(_: T) {}

    fn upgrader() -> Upgrader {
        Upgrader::builder(Keypair::generate().peer_id(), |_: BoxFuture<'static, ()>| {})
            .negotiation_timeout(Duration::from_millis(100))
            .build()
    }

    fn raw(io: DuplexStream) -> RawConnection<Compat<DuplexStream>> {
        let addr: SocketAddr = "127.0.0.1:4001".parse().unwrap();
        RawConnection::new(io.compat(), addr, addr)
    }

    #[test]
    fn upgrade_futures_are_send() {
        let upgrader = upgrader();
        let (a, b) = tokio::io::duplex(64);
        assert_send(upgrader.upgrade_outbound(raw(a), UpgradeOptions::default()));
        assert_send(upgrader.upgrade_inbound(raw(b), UpgradeOptions::default()));
    }

    #[tokio::test]
    async fn upgrade_already_aborted_is_cancelled() {
        let upgrader = upgrader();
        let (a, _b) = tokio::io::duplex(64);
        let controller = AbortController::new();
        let options = UpgradeOptions::default().with_signal(controller.signal());
        controller.abort();
        assert!(matches!(
            upgrader.upgrade_outbound(raw(a), options).await,
            Err(Error::Cancelled)
        ));
    }
}
