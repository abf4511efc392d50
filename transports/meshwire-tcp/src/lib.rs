mod listener;
mod stream;

use std::{io, net::SocketAddr};

use futures::{
    FutureExt,
    future::{BoxFuture, Ready},
};
use meshwire_core::{RawConnection, Transport};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;

pub use listener::ListenStream;
pub use stream::TcpStream;

#[derive(Clone, Debug)]
pub struct Config {
    ttl: Option<u32>,
    nodelay: bool,
    backlog: u32,
}

impl Config {
    pub fn new() -> Self {
        Self {
            ttl: None,
            nodelay: true,
            backlog: 1024,
        }
    }

    pub fn ttl(mut self, value: u32) -> Self {
        self.ttl = Some(value);
        self
    }

    pub fn nodelay(mut self, value: bool) -> Self {
        self.nodelay = value;
        self
    }

    pub fn listen_backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    fn create_socket(&self, socket_addr: SocketAddr) -> io::Result<Socket> {
        let socket = Socket::new(
            Domain::for_address(socket_addr),
            Type::STREAM,
            Some(Protocol::TCP),
        )?;
        if socket_addr.is_ipv6() {
            socket.set_only_v6(true)?;
        }
        if let Some(ttl) = self.ttl {
            socket.set_ttl(ttl)?;
        }
        socket.set_nodelay(self.nodelay)?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        Ok(socket)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for Config {
    type Output = RawConnection<TcpStream>;
    type Error = io::Error;
    type Dialer = BoxFuture<'static, Result<Self::Output, Self::Error>>;
    type ListenerUpgrade = Ready<Result<Self::Output, Self::Error>>;
    type Listener = ListenStream;

    fn connect(&self, addr: SocketAddr) -> Result<Self::Dialer, Self::Error> {
        let config = self.clone();
        let fut = async move {
            let stream = tokio::net::TcpStream::connect(addr).await?;
            stream.set_nodelay(config.nodelay)?;
            if let Some(ttl) = config.ttl {
                stream.set_ttl(ttl)?;
            }
            let local_addr = stream.local_addr()?;
            tracing::trace!(local_addr=%local_addr, remote_addr=%addr, "Dialed TCP connection");
            Ok(RawConnection::new(TcpStream::from(stream), local_addr, addr))
        };
        Ok(fut.boxed())
    }

    fn listen(&self, addr: SocketAddr) -> Result<Self::Listener, Self::Error> {
        let socket = self.create_socket(addr)?;
        socket.bind(&addr.into())?;
        socket.listen(self.backlog as _)?;
        socket.set_nonblocking(true)?;
        let listener = TcpListener::from_std(socket.into())?;
        ListenStream::new(listener)
    }
}

#[cfg(test)]
mod tests {
    use futures::{AsyncReadExt, AsyncWriteExt, StreamExt};
    use meshwire_core::ListenerEvent;

    use super::*;

    #[tokio::test]
    async fn listened_event_reports_the_bound_port() {
        let mut listener = Config::new().listen("127.0.0.1:0".parse().unwrap()).unwrap();
        let Some(ListenerEvent::Listened(addr)) = listener.next().await else {
            panic!("expected a Listened event");
        };
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn dial_and_accept_exchange_bytes() {
        let transport = Config::new();
        let mut listener = transport.listen("127.0.0.1:0".parse().unwrap()).unwrap();
        let Some(ListenerEvent::Listened(addr)) = listener.next().await else {
            panic!("expected a Listened event");
        };

        let mut dialed = transport.connect(addr).unwrap().await.unwrap();
        assert_eq!(dialed.remote_addr, addr);

        let Some(ListenerEvent::Incoming { upgrade, remote_addr, .. }) = listener.next().await else {
            panic!("expected an Incoming event");
        };
        let mut accepted = upgrade.await.unwrap();
        assert_eq!(remote_addr, dialed.local_addr);
        assert_eq!(accepted.local_addr, addr);

        dialed.stream.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        accepted.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }
}
