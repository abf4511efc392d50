use std::{
    io,
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll},
};

use futures::{
    Stream,
    future::{self, Ready},
};
use meshwire_core::{ListenerEvent, RawConnection};
use tokio::net::TcpListener;

use crate::TcpStream;

type Upgrade = Ready<Result<RawConnection<TcpStream>, io::Error>>;

pub struct ListenStream {
    local_addr: SocketAddr,
    listener: TcpListener,
    pending_event: Option<ListenerEvent<Upgrade, io::Error>>,
}

impl ListenStream {
    /// Wraps a bound listener. The first event is `Listened` with the
    /// address the OS actually assigned.
    pub fn new(listener: TcpListener) -> io::Result<Self> {
        let local_addr = listener.local_addr()?;
        Ok(ListenStream {
            local_addr,
            listener,
            pending_event: Some(ListenerEvent::Listened(local_addr)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Stream for ListenStream {
    type Item = ListenerEvent<Upgrade, io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(event) = self.pending_event.take() {
            return Poll::Ready(Some(event));
        }
        match self.listener.poll_accept(cx) {
            Poll::Ready(Ok((stream, remote_addr))) => {
                tracing::trace!(local_addr=%self.local_addr, remote_addr=%remote_addr, "Accepted TCP connection");
                let local_addr = self.local_addr;
                Poll::Ready(Some(ListenerEvent::Incoming {
                    local_addr,
                    remote_addr,
                    upgrade: future::ok(RawConnection::new(
                        TcpStream::from(stream),
                        local_addr,
                        remote_addr,
                    )),
                }))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Some(ListenerEvent::Error(e))),
            Poll::Pending => Poll::Pending,
        }
    }
}
