use std::{
    io,
    net::SocketAddr,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    task::{Context, Poll},
    time::Duration,
};

use futures::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, StreamExt,
    channel::mpsc,
    future::{self, BoxFuture},
};
use meshwire::{
    core::{
        AbortController, BoxedStream, Connection, ConnectionEvent, ConnectionGater,
        ConnectionProtector, ConnectionStatus, Direction, Endpoint, Error, IncomingStream,
        Keypair, PeerId, RawConnection, Stream, StreamMuxerFactory, StreamOptions,
        UpgradeOptions, Upgrader, UpgraderBuilder, muxing::StreamMuxerBox,
    },
    plaintext, pnet, yamux,
};
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};

const ECHO: &str = "/echo/1.0.0";

fn spawn(future: BoxFuture<'static, ()>) {
    tokio::spawn(future);
}

fn builder(keypair: &Keypair) -> UpgraderBuilder {
    Upgrader::builder(keypair.peer_id(), spawn)
        .encrypter(plaintext::Config::new(keypair.public()))
        .negotiation_timeout(Duration::from_secs(5))
}

fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

fn raw_pair() -> (
    RawConnection<Compat<tokio::io::DuplexStream>>,
    RawConnection<Compat<tokio::io::DuplexStream>>,
) {
    let (a, b) = tokio::io::duplex(1 << 16);
    (
        RawConnection::new(a.compat(), addr(4001), addr(4002)),
        RawConnection::new(b.compat(), addr(4002), addr(4001)),
    )
}

async fn upgrade_pair(
    dialer: &Upgrader,
    listener: &Upgrader,
    options: UpgradeOptions,
) -> (Result<Connection, Error>, Result<Connection, Error>) {
    let (a, b) = raw_pair();
    future::join(
        dialer.upgrade_outbound(a, options),
        listener.upgrade_inbound(b, UpgradeOptions::default()),
    )
    .await
}

async fn echo(incoming: IncomingStream) {
    let mut stream = incoming.stream;
    let mut buf = [0u8; 1024];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if stream.write_all(&buf[..n]).await.is_err() || stream.flush().await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn assert_echo(connection: &Connection) -> Stream {
    let mut stream = connection.new_stream([ECHO]).await.unwrap();
    assert_eq!(stream.protocol(), Some(ECHO));
    assert_eq!(stream.direction(), Direction::Outbound);
    stream.write_all(b"hello there!").await.unwrap();
    stream.flush().await.unwrap();
    let mut buf = [0u8; 12];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello there!");
    stream
}

/// Records whether the connection was closed.
struct CloseSpy<T> {
    inner: T,
    closed: Arc<AtomicBool>,
}

impl<T: AsyncRead + Unpin> AsyncRead for CloseSpy<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for CloseSpy<T> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.closed.store(true, Ordering::SeqCst);
        Pin::new(&mut self.inner).poll_close(cx)
    }
}

/// Yamux under another protocol id.
struct Renamed(&'static str);

impl StreamMuxerFactory for Renamed {
    fn protocol(&self) -> &str {
        self.0
    }

    fn create_stream_muxer(&self, io: BoxedStream, endpoint: Endpoint) -> io::Result<StreamMuxerBox> {
        yamux::Config::new().create_stream_muxer(io, endpoint)
    }
}

struct CountingProtector {
    inner: pnet::PnetConfig,
    calls: Arc<AtomicUsize>,
}

impl ConnectionProtector for CountingProtector {
    fn protect(&self, io: BoxedStream) -> BoxFuture<'static, io::Result<BoxedStream>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.protect(io)
    }
}

#[tokio::test]
async fn both_sides_see_each_other() {
    let alice = Keypair::generate();
    let bob = Keypair::generate();
    let dialer = builder(&alice).muxer(yamux::Config::new()).build();
    let listener = builder(&bob).muxer(yamux::Config::new()).build();

    let (outbound, inbound) = upgrade_pair(&dialer, &listener, UpgradeOptions::default()).await;
    let (outbound, inbound) = (outbound.unwrap(), inbound.unwrap());

    assert_eq!(outbound.local_peer(), alice.peer_id());
    assert_eq!(outbound.remote_peer(), bob.peer_id());
    assert_eq!(inbound.local_peer(), bob.peer_id());
    assert_eq!(inbound.remote_peer(), alice.peer_id());
    assert_eq!(outbound.endpoint(), Endpoint::Dialer);
    assert_eq!(inbound.endpoint(), Endpoint::Listener);
    assert_eq!(outbound.encryption(), plaintext::PROTOCOL);
    assert_eq!(inbound.multiplexer(), Some(yamux::PROTOCOL));
    assert_eq!(outbound.status(), ConnectionStatus::Open);
    assert!(outbound.timeline().upgraded.is_some());
}

#[tokio::test]
async fn unexpected_peer_closes_the_raw_connection() {
    let alice = Keypair::generate();
    let bob = Keypair::generate();
    let someone_else = Keypair::generate().peer_id();
    let dialer = builder(&alice).muxer(yamux::Config::new()).build();
    let listener = builder(&bob).muxer(yamux::Config::new()).build();

    let (a, b) = raw_pair();
    let closed = Arc::new(AtomicBool::new(false));
    let a = RawConnection::new(
        CloseSpy {
            inner: a.stream,
            closed: closed.clone(),
        },
        a.local_addr,
        a.remote_addr,
    );
    let (outbound, inbound) = future::join(
        dialer.upgrade_outbound(a, UpgradeOptions::default().with_remote_peer(someone_else)),
        listener.upgrade_inbound(b, UpgradeOptions::default()),
    )
    .await;

    match outbound {
        Err(Error::UnexpectedPeer { expected, actual }) => {
            assert_eq!(expected, someone_else);
            assert_eq!(actual, bob.peer_id());
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert!(closed.load(Ordering::SeqCst));
    assert!(inbound.is_err());
}

#[tokio::test]
async fn disjoint_muxers_fail_on_both_sides() {
    let dialer = builder(&Keypair::generate())
        .muxer(yamux::Config::new())
        .build();
    let listener = builder(&Keypair::generate())
        .muxer(Renamed("/mplex/6.7.0"))
        .build();

    let (outbound, inbound) = upgrade_pair(&dialer, &listener, UpgradeOptions::default()).await;
    assert!(matches!(outbound, Err(Error::MuxerUnavailable)));
    assert!(matches!(inbound, Err(Error::MuxerUnavailable)));
}

#[tokio::test]
async fn muxer_preference_follows_dialer_order() {
    let dialer = builder(&Keypair::generate())
        .muxer(Renamed("/mplex/6.7.0"))
        .muxer(yamux::Config::new())
        .build();
    let listener = builder(&Keypair::generate())
        .muxer(yamux::Config::new())
        .muxer(Renamed("/mplex/6.7.0"))
        .build();

    let (outbound, inbound) = upgrade_pair(&dialer, &listener, UpgradeOptions::default()).await;
    assert_eq!(outbound.unwrap().multiplexer(), Some("/mplex/6.7.0"));
    assert_eq!(inbound.unwrap().multiplexer(), Some("/mplex/6.7.0"));
}

#[tokio::test]
async fn without_muxers_streams_are_unavailable() {
    let dialer = builder(&Keypair::generate()).build();
    let listener = builder(&Keypair::generate()).build();

    let (outbound, inbound) = upgrade_pair(&dialer, &listener, UpgradeOptions::default()).await;
    let (outbound, inbound) = (outbound.unwrap(), inbound.unwrap());
    assert_eq!(outbound.multiplexer(), None);
    assert!(matches!(
        outbound.new_stream([ECHO]).await,
        Err(Error::MuxerUnavailable)
    ));

    let mut a = outbound.take_implicit_stream().unwrap();
    let mut b = inbound.take_implicit_stream().unwrap();
    assert!(outbound.take_implicit_stream().is_none());
    a.write_all(b"raw").await.unwrap();
    a.flush().await.unwrap();
    let mut buf = [0u8; 3];
    b.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"raw");
}

#[tokio::test]
async fn closing_an_implicit_connection_reaches_the_remote() {
    let dialer = builder(&Keypair::generate()).build();
    let listener = builder(&Keypair::generate()).build();
    let mut listener_events = listener.subscribe();

    let (outbound, inbound) = upgrade_pair(&dialer, &listener, UpgradeOptions::default()).await;
    let (outbound, inbound) = (outbound.unwrap(), inbound.unwrap());
    let a = outbound.take_implicit_stream().unwrap();
    let mut b = inbound.take_implicit_stream().unwrap();

    outbound.close().await;
    assert_eq!(outbound.status(), ConnectionStatus::Closed);
    assert!(a.is_reset());

    let mut buf = [0u8; 8];
    let read = tokio::time::timeout(Duration::from_secs(5), b.read(&mut buf))
        .await
        .unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));
    assert_eq!(inbound.status(), ConnectionStatus::Closed);
    assert!(inbound.timeline().close.is_some());
    assert!(inbound.streams().is_empty());

    let mut closed = 0;
    while let Ok(Some(event)) = listener_events.try_next() {
        if let ConnectionEvent::Closed { connection, .. } = event {
            assert_eq!(connection, inbound);
            closed += 1;
        }
    }
    assert_eq!(closed, 1);
}

#[tokio::test]
async fn muxerless_dialer_leaves_the_listener_without_a_muxer() {
    let dialer = builder(&Keypair::generate()).build();
    let listener = builder(&Keypair::generate())
        .muxer(yamux::Config::new())
        .negotiation_timeout(Duration::from_millis(200))
        .build();

    let (outbound, inbound) = upgrade_pair(&dialer, &listener, UpgradeOptions::default()).await;
    assert_eq!(outbound.unwrap().multiplexer(), None);
    assert!(matches!(inbound, Err(Error::MuxerUnavailable)));
}

#[tokio::test]
async fn echo_round_trip() {
    let dialer = builder(&Keypair::generate())
        .muxer(yamux::Config::new())
        .build();
    let listener = builder(&Keypair::generate())
        .muxer(yamux::Config::new())
        .build();
    listener.registrar().handle([ECHO], echo).unwrap();

    let (outbound, _inbound) = upgrade_pair(&dialer, &listener, UpgradeOptions::default()).await;
    let outbound = outbound.unwrap();
    let stream = assert_echo(&outbound).await;
    let streams = outbound.streams();
    assert_eq!(streams.len(), 1);
    assert_eq!(streams[0].id, stream.id());
    assert_eq!(streams[0].protocol.as_deref(), Some(ECHO));

    drop(stream);
    assert!(outbound.streams().is_empty());
}

#[tokio::test]
async fn half_closed_stream_stays_listed_until_dropped() {
    let dialer = builder(&Keypair::generate())
        .muxer(yamux::Config::new())
        .build();
    let listener = builder(&Keypair::generate())
        .muxer(yamux::Config::new())
        .build();
    listener.registrar().handle([ECHO], echo).unwrap();

    let (outbound, _inbound) = upgrade_pair(&dialer, &listener, UpgradeOptions::default()).await;
    let outbound = outbound.unwrap();
    let mut stream = assert_echo(&outbound).await;
    stream.close().await.unwrap();
    assert_eq!(outbound.streams().len(), 1);
    assert!(!stream.is_reset());

    drop(stream);
    assert!(outbound.streams().is_empty());
}

#[tokio::test]
async fn concurrent_streams_get_unique_growing_ids() {
    let dialer = builder(&Keypair::generate())
        .muxer(yamux::Config::new())
        .build();
    let listener = builder(&Keypair::generate())
        .muxer(yamux::Config::new())
        .build();
    listener.registrar().handle([ECHO], echo).unwrap();

    let (outbound, _inbound) = upgrade_pair(&dialer, &listener, UpgradeOptions::default()).await;
    let outbound = outbound.unwrap();
    let streams = future::try_join_all((0..8).map(|_| outbound.new_stream([ECHO])))
        .await
        .unwrap();

    let mut ids: Vec<_> = streams.iter().map(Stream::id).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 8);
    let listed: Vec<_> = outbound.streams().into_iter().map(|info| info.id).collect();
    assert_eq!(listed, ids);

    let last = outbound.new_stream([ECHO]).await.unwrap();
    assert!(ids.iter().all(|id| *id < last.id()));
}

#[tokio::test]
async fn aborted_stream_open_registers_nothing() {
    let dialer = builder(&Keypair::generate())
        .muxer(yamux::Config::new())
        .build();
    let listener = builder(&Keypair::generate())
        .muxer(yamux::Config::new())
        .build();
    listener.registrar().handle([ECHO], echo).unwrap();

    let (outbound, _inbound) = upgrade_pair(&dialer, &listener, UpgradeOptions::default()).await;
    let outbound = outbound.unwrap();

    let controller = AbortController::new();
    let options = StreamOptions {
        signal: Some(controller.signal()),
    };
    controller.abort();
    assert!(matches!(
        outbound.new_stream_with_options([ECHO], options).await,
        Err(Error::Cancelled)
    ));
    assert!(outbound.streams().is_empty());
    assert_eq!(outbound.status(), ConnectionStatus::Open);

    assert_echo(&outbound).await;
}

#[tokio::test]
async fn inbound_handler_sees_the_connection_close() {
    const HOLD: &str = "/hold/1.0.0";
    let dialer = builder(&Keypair::generate())
        .muxer(yamux::Config::new())
        .build();
    let listener = builder(&Keypair::generate())
        .muxer(yamux::Config::new())
        .build();
    let (reads_tx, mut reads) = mpsc::unbounded();
    listener
        .registrar()
        .handle([HOLD], move |incoming: IncomingStream| {
            let reads_tx = reads_tx.clone();
            async move {
                let mut stream = incoming.stream;
                let mut buf = [0u8; 1];
                let _ = reads_tx.unbounded_send(stream.read(&mut buf).await);
                let _ = reads_tx.unbounded_send(stream.read(&mut buf).await);
            }
        })
        .unwrap();

    let (outbound, inbound) = upgrade_pair(&dialer, &listener, UpgradeOptions::default()).await;
    let (outbound, inbound) = (outbound.unwrap(), inbound.unwrap());
    let mut stream = outbound.new_stream([HOLD]).await.unwrap();
    stream.write_all(b"x").await.unwrap();
    stream.flush().await.unwrap();

    let wait = Duration::from_secs(5);
    let first = tokio::time::timeout(wait, reads.next()).await.unwrap();
    assert!(matches!(first, Some(Ok(1))));
    assert_eq!(inbound.streams().len(), 1);

    inbound.close().await;
    let second = tokio::time::timeout(wait, reads.next()).await.unwrap();
    match second {
        Some(Err(e)) => assert_eq!(e.kind(), io::ErrorKind::ConnectionReset),
        other => panic!("unexpected read: {other:?}"),
    }
}

#[tokio::test]
async fn unsupported_protocol_leaves_listener_streams_unchanged() {
    let dialer = builder(&Keypair::generate())
        .muxer(yamux::Config::new())
        .build();
    let listener = builder(&Keypair::generate())
        .muxer(yamux::Config::new())
        .build();
    listener.registrar().handle([ECHO], echo).unwrap();

    let (outbound, inbound) = upgrade_pair(&dialer, &listener, UpgradeOptions::default()).await;
    let (outbound, inbound) = (outbound.unwrap(), inbound.unwrap());

    let before = inbound.streams().len();
    assert!(matches!(
        outbound.new_stream(["/nope/1.0.0"]).await,
        Err(Error::UnsupportedProtocol)
    ));
    assert_eq!(inbound.streams().len(), before);
    assert!(outbound.streams().is_empty());

    // The connection is still usable.
    assert_echo(&outbound).await;
}

#[tokio::test]
async fn concurrent_close_emits_one_closed_event() {
    let dialer = builder(&Keypair::generate())
        .muxer(yamux::Config::new())
        .build();
    let listener = builder(&Keypair::generate())
        .muxer(yamux::Config::new())
        .build();
    listener.registrar().handle([ECHO], echo).unwrap();
    let mut events = dialer.subscribe();

    let (outbound, _inbound) = upgrade_pair(&dialer, &listener, UpgradeOptions::default()).await;
    let outbound = outbound.unwrap();
    let stream = outbound.new_stream([ECHO]).await.unwrap();

    future::join(outbound.close(), outbound.close()).await;
    outbound.close().await;

    assert_eq!(outbound.status(), ConnectionStatus::Closed);
    assert!(outbound.timeline().close.is_some());
    assert!(stream.is_reset());
    assert!(outbound.streams().is_empty());
    assert!(matches!(
        outbound.new_stream([ECHO]).await,
        Err(Error::ConnectionEnded)
    ));

    let mut opened = 0;
    let mut closed = 0;
    while let Ok(Some(event)) = events.try_next() {
        match event {
            ConnectionEvent::Opened { connection, .. } => {
                assert_eq!(connection, outbound);
                opened += 1;
            }
            ConnectionEvent::Closed { connection, .. } => {
                assert_eq!(connection, outbound);
                closed += 1;
            }
        }
    }
    assert_eq!((opened, closed), (1, 1));
}

#[tokio::test]
async fn remote_close_ends_the_connection() {
    let dialer = builder(&Keypair::generate())
        .muxer(yamux::Config::new())
        .build();
    let listener = builder(&Keypair::generate())
        .muxer(yamux::Config::new())
        .build();
    let mut listener_events = listener.subscribe();

    let (outbound, inbound) = upgrade_pair(&dialer, &listener, UpgradeOptions::default()).await;
    let (outbound, inbound) = (outbound.unwrap(), inbound.unwrap());
    outbound.close().await;

    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = listener_events.next().await {
            if let ConnectionEvent::Closed { connection, .. } = event {
                return connection;
            }
        }
        panic!("event bus ended");
    })
    .await
    .unwrap();
    assert_eq!(closed, inbound);
    assert_eq!(inbound.status(), ConnectionStatus::Closed);
}

#[tokio::test]
async fn protector_runs_once_per_side() {
    let key = pnet::PreSharedKey::generate();
    let calls = Arc::new(AtomicUsize::new(0));
    let protector = || CountingProtector {
        inner: pnet::PnetConfig::new(key),
        calls: calls.clone(),
    };
    let dialer = builder(&Keypair::generate())
        .muxer(yamux::Config::new())
        .protector(protector())
        .build();
    let listener = builder(&Keypair::generate())
        .muxer(yamux::Config::new())
        .protector(protector())
        .build();
    listener.registrar().handle([ECHO], echo).unwrap();

    let (outbound, inbound) = upgrade_pair(&dialer, &listener, UpgradeOptions::default()).await;
    let outbound = outbound.unwrap();
    inbound.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_echo(&outbound).await;
}

#[tokio::test]
async fn mismatched_keys_fail_the_upgrade() {
    let dialer = builder(&Keypair::generate())
        .muxer(yamux::Config::new())
        .protector(pnet::PnetConfig::new(pnet::PreSharedKey::generate()))
        .negotiation_timeout(Duration::from_secs(1))
        .build();
    let listener = builder(&Keypair::generate())
        .muxer(yamux::Config::new())
        .protector(pnet::PnetConfig::new(pnet::PreSharedKey::generate()))
        .negotiation_timeout(Duration::from_secs(1))
        .build();

    let (outbound, inbound) = upgrade_pair(&dialer, &listener, UpgradeOptions::default()).await;
    assert!(outbound.is_err());
    assert!(inbound.is_err());
}

#[derive(Default)]
struct Deny {
    inbound: bool,
    outbound_encrypted: Option<PeerId>,
    inbound_upgraded: bool,
}

impl ConnectionGater for Deny {
    fn deny_inbound_connection(&self, _remote_addr: &SocketAddr) -> bool {
        self.inbound
    }

    fn deny_outbound_encrypted_connection(&self, peer: &PeerId) -> bool {
        self.outbound_encrypted.as_ref() == Some(peer)
    }

    fn deny_inbound_upgraded_connection(&self, _peer: &PeerId) -> bool {
        self.inbound_upgraded
    }
}

#[tokio::test]
async fn gater_denies_inbound_connections() {
    let dialer = builder(&Keypair::generate()).build();
    let listener = builder(&Keypair::generate())
        .gater(Deny {
            inbound: true,
            ..Default::default()
        })
        .build();

    let (outbound, inbound) = upgrade_pair(&dialer, &listener, UpgradeOptions::default()).await;
    assert!(matches!(inbound, Err(Error::ConnectionDenied)));
    assert!(outbound.is_err());
}

#[tokio::test]
async fn gater_denies_encrypted_connections() {
    let bob = Keypair::generate();
    let dialer = builder(&Keypair::generate())
        .muxer(yamux::Config::new())
        .gater(Deny {
            outbound_encrypted: Some(bob.peer_id()),
            ..Default::default()
        })
        .build();
    let listener = builder(&bob).muxer(yamux::Config::new()).build();

    let (outbound, inbound) = upgrade_pair(&dialer, &listener, UpgradeOptions::default()).await;
    assert!(matches!(outbound, Err(Error::ConnectionDenied)));
    assert!(inbound.is_err());
}

#[tokio::test]
async fn gater_denies_upgraded_connections() {
    let dialer = builder(&Keypair::generate())
        .muxer(yamux::Config::new())
        .build();
    let listener = builder(&Keypair::generate())
        .muxer(yamux::Config::new())
        .gater(Deny {
            inbound_upgraded: true,
            ..Default::default()
        })
        .build();
    let mut events = listener.subscribe();

    let (_outbound, inbound) = upgrade_pair(&dialer, &listener, UpgradeOptions::default()).await;
    assert!(matches!(inbound, Err(Error::ConnectionDenied)));
    assert!(events.try_next().is_err());
}

#[tokio::test]
async fn aborted_upgrade_is_cancelled() {
    let dialer = builder(&Keypair::generate()).build();
    let (a, _b) = raw_pair();

    let controller = AbortController::new();
    let options = UpgradeOptions::default().with_signal(controller.signal());
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        controller.abort();
    });

    // Nobody answers on the other end, so only the abort ends the upgrade.
    assert!(matches!(
        dialer.upgrade_outbound(a, options).await,
        Err(Error::Cancelled)
    ));
}

#[tokio::test]
async fn silent_remote_times_out() {
    let dialer = builder(&Keypair::generate())
        .negotiation_timeout(Duration::from_millis(100))
        .build();
    let (a, _b) = raw_pair();
    assert!(matches!(
        dialer.upgrade_outbound(a, UpgradeOptions::default()).await,
        Err(Error::Timeout)
    ));
}
