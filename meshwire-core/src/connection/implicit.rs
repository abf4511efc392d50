use std::{
    io,
    pin::Pin,
    sync::{Arc, Mutex, Weak},
    task::{Context, Poll},
};

use futures::{AsyncRead, AsyncWrite, ready};

use super::ConnectionInner;
use crate::utils::{BoxedStream, lock};

/// Holds the secured duplex of an unmultiplexed connection. Both the
/// connection and its stream reach it through here, so the connection can
/// close it after the stream was taken.
pub(super) type IoSlot = Arc<Mutex<Option<BoxedStream>>>;

pub(super) struct ImplicitIo {
    slot: IoSlot,
    connection: Weak<ConnectionInner>,
}

impl ImplicitIo {
    pub(super) fn new(slot: IoSlot, connection: Weak<ConnectionInner>) -> Self {
        ImplicitIo { slot, connection }
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionReset, "connection closed")
}

impl AsyncRead for ImplicitIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let mut slot = lock(&this.slot);
        let Some(io) = slot.as_mut() else {
            return Poll::Ready(Err(closed()));
        };
        let result = ready!(Pin::new(io).poll_read(cx, buf));
        let ended = match &result {
            Ok(0) => !buf.is_empty(),
            Ok(_) => false,
            Err(_) => true,
        };
        if ended {
            // The remote is gone, and so is the connection.
            slot.take();
            drop(slot);
            if let Some(connection) = this.connection.upgrade() {
                tracing::debug!(peer=%connection.config.remote_peer, "Remote closed the connection");
                connection.finalize();
            }
        }
        Poll::Ready(result)
    }
}

impl AsyncWrite for ImplicitIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match lock(&self.slot).as_mut() {
            Some(io) => Pin::new(io).poll_write(cx, buf),
            None => Poll::Ready(Err(closed())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match lock(&self.slot).as_mut() {
            Some(io) => Pin::new(io).poll_flush(cx),
            None => Poll::Ready(Err(closed())),
        }
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match lock(&self.slot).as_mut() {
            Some(io) => Pin::new(io).poll_close(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}
