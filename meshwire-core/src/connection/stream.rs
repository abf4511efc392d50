use std::{
    fmt, io,
    pin::Pin,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll},
    time::SystemTime,
};

use futures::{AsyncRead, AsyncWrite, task::AtomicWaker};

use super::ConnectionInner;
use crate::utils::BoxedStream;

/// Identifies a stream within its connection. Ids only ever grow.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub(crate) u64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// A point-in-time view of an open stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub id: StreamId,
    pub direction: Direction,
    pub protocol: Option<String>,
    pub opened: SystemTime,
}

/// Reset flag shared between a stream and its connection's stream table.
#[derive(Default)]
pub(crate) struct StreamShared {
    reset: AtomicBool,
    read_waker: AtomicWaker,
    write_waker: AtomicWaker,
}

impl StreamShared {
    pub(crate) fn reset(&self) {
        self.reset.store(true, Ordering::SeqCst);
        self.read_waker.wake();
        self.write_waker.wake();
    }

    fn is_reset(&self) -> bool {
        self.reset.load(Ordering::SeqCst)
    }
}

/// A protocol-negotiated stream on a [`Connection`](crate::Connection).
///
/// A stream stays listed in [`Connection::streams`](crate::Connection::streams)
/// until it is dropped, even after closing its write half. Once the
/// connection closes, every read and write fails with
/// [`io::ErrorKind::ConnectionReset`].
pub struct Stream {
    id: StreamId,
    direction: Direction,
    protocol: Option<String>,
    io: BoxedStream,
    shared: Arc<StreamShared>,
    connection: Weak<ConnectionInner>,
}

impl Stream {
    pub(crate) fn new(
        id: StreamId,
        direction: Direction,
        protocol: Option<String>,
        io: BoxedStream,
        shared: Arc<StreamShared>,
        connection: Weak<ConnectionInner>,
    ) -> Self {
        Stream {
            id,
            direction,
            protocol,
            io,
            shared,
            connection,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// The negotiated protocol. `None` for the implicit stream of an
    /// unmultiplexed connection.
    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    pub fn is_reset(&self) -> bool {
        self.shared.is_reset()
    }

    /// Abandons the stream without a graceful close.
    pub fn reset(self) {
        self.shared.reset();
    }

    fn check_reset(&self) -> io::Result<()> {
        if self.shared.is_reset() {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "stream was reset",
            ));
        }
        Ok(())
    }

}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.shared.read_waker.register(cx.waker());
        this.check_reset()?;
        Pin::new(&mut this.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.shared.write_waker.register(cx.waker());
        this.check_reset()?;
        Pin::new(&mut this.io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.shared.write_waker.register(cx.waker());
        this.check_reset()?;
        Pin::new(&mut this.io).poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.shared.write_waker.register(cx.waker());
        this.check_reset()?;
        Pin::new(&mut this.io).poll_close(cx)
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.upgrade() {
            connection.deregister_stream(self.id);
        }
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("protocol", &self.protocol)
            .field("reset", &self.is_reset())
            .finish()
    }
}
