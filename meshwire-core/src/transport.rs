pub mod upgrade;

use std::{error, fmt, net::SocketAddr};

use futures::Stream;

use crate::{Timeline, Upgrader};

pub use upgrade::{TransportUpgradeError, Upgraded};

pub trait Transport {
    type Output;
    type Error: error::Error;
    type Dialer: Future<Output = Result<Self::Output, Self::Error>>;
    type ListenerUpgrade: Future<Output = Result<Self::Output, Self::Error>>;
    type Listener: Stream<Item = ListenerEvent<Self::ListenerUpgrade, Self::Error>>;

    fn listen(&self, addr: SocketAddr) -> Result<Self::Listener, Self::Error>;

    fn connect(&self, addr: SocketAddr) -> Result<Self::Dialer, Self::Error>;

    /// Runs every connection of this transport through `upgrader`.
    fn upgrade(self, upgrader: Upgrader) -> Upgraded<Self>
    where
        Self: Sized,
    {
        Upgraded::new(self, upgrader)
    }
}

/// A freshly established transport connection, not yet upgraded.
pub struct RawConnection<C> {
    pub stream: C,
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
    pub timeline: Timeline,
}

impl<C> RawConnection<C> {
    pub fn new(stream: C, local_addr: SocketAddr, remote_addr: SocketAddr) -> Self {
        RawConnection {
            stream,
            local_addr,
            remote_addr,
            timeline: Timeline::new(),
        }
    }
}

impl<C> fmt::Debug for RawConnection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawConnection")
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .finish_non_exhaustive()
    }
}

pub enum ListenerEvent<T, E> {
    /// The listener is bound. Carries the actual local address, so binding
    /// port 0 reveals the assigned port.
    Listened(SocketAddr),
    Incoming {
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        upgrade: T,
    },
    Closed(Result<(), E>),
    Error(E),
}

impl<U, E> ListenerEvent<U, E> {
    pub fn map_upgrade<F, O>(self, f: F) -> ListenerEvent<O, E>
    where
        F: FnOnce(U) -> O,
    {
        match self {
            ListenerEvent::Listened(addr) => ListenerEvent::Listened(addr),
            ListenerEvent::Incoming {
                local_addr,
                remote_addr,
                upgrade,
            } => ListenerEvent::Incoming {
                local_addr,
                remote_addr,
                upgrade: f(upgrade),
            },
            ListenerEvent::Closed(result) => ListenerEvent::Closed(result),
            ListenerEvent::Error(err) => ListenerEvent::Error(err),
        }
    }

    pub fn map_err<F, O>(self, f: F) -> ListenerEvent<U, O>
    where
        F: FnOnce(E) -> O,
    {
        match self {
            ListenerEvent::Listened(addr) => ListenerEvent::Listened(addr),
            ListenerEvent::Incoming {
                local_addr,
                remote_addr,
                upgrade,
            } => ListenerEvent::Incoming {
                local_addr,
                remote_addr,
                upgrade,
            },
            ListenerEvent::Closed(result) => ListenerEvent::Closed(result.map_err(f)),
            ListenerEvent::Error(err) => ListenerEvent::Error(f(err)),
        }
    }
}

impl<U, E> fmt::Debug for ListenerEvent<U, E>
where
    E: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerEvent::Listened(addr) => write!(f, "Listened({addr})"),
            ListenerEvent::Incoming {
                local_addr,
                remote_addr,
                upgrade: _,
            } => write!(f, "Incoming(local: {local_addr}, remote: {remote_addr})"),
            ListenerEvent::Closed(result) => write!(f, "Closed({result:?})"),
            ListenerEvent::Error(err) => write!(f, "Error({err:?})"),
        }
    }
}
