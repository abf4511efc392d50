use std::{
    error,
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll},
};

use futures::{AsyncRead, AsyncWrite, FutureExt, Stream, future::BoxFuture};

use crate::{
    Connection, Error, ListenerEvent, Transport,
    transport::RawConnection,
    upgrader::{UpgradeOptions, Upgrader},
};

/// A [`Transport`] whose connections come out fully upgraded.
#[derive(Clone)]
pub struct Upgraded<T> {
    inner: T,
    upgrader: Upgrader,
}

impl<T> Upgraded<T> {
    pub fn new(inner: T, upgrader: Upgrader) -> Self {
        Upgraded { inner, upgrader }
    }

    pub fn upgrader(&self) -> &Upgrader {
        &self.upgrader
    }
}

impl<T, C> Upgraded<T>
where
    T: Transport<Output = RawConnection<C>>,
    T::Dialer: Send + 'static,
    T::Error: Send + 'static,
    C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Dials `addr` and upgrades the result with `options`.
    pub fn dial(
        &self,
        addr: SocketAddr,
        options: UpgradeOptions,
    ) -> Result<BoxFuture<'static, Result<Connection, TransportUpgradeError<T::Error>>>, T::Error>
    {
        let dial = self.inner.connect(addr)?;
        let upgrader = self.upgrader.clone();
        Ok(async move {
            let raw = dial.await.map_err(TransportUpgradeError::Transport)?;
            Ok::<_, TransportUpgradeError<T::Error>>(upgrader.upgrade_outbound(raw, options).await?)
        }
        .boxed())
    }
}

impl<T, C> Transport for Upgraded<T>
where
    T: Transport<Output = RawConnection<C>>,
    T::Dialer: Send + 'static,
    T::ListenerUpgrade: Send + 'static,
    T::Error: Send + 'static,
    C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    type Output = Connection;
    type Error = TransportUpgradeError<T::Error>;
    type Dialer = BoxFuture<'static, Result<Connection, Self::Error>>;
    type ListenerUpgrade = BoxFuture<'static, Result<Connection, Self::Error>>;
    type Listener = UpgradedListener<T>;

    fn connect(&self, addr: SocketAddr) -> Result<Self::Dialer, Self::Error> {
        self.dial(addr, UpgradeOptions::default())
            .map_err(TransportUpgradeError::Transport)
    }

    fn listen(&self, addr: SocketAddr) -> Result<Self::Listener, Self::Error> {
        let inner = self
            .inner
            .listen(addr)
            .map_err(TransportUpgradeError::Transport)?;
        Ok(UpgradedListener {
            inner,
            upgrader: self.upgrader.clone(),
        })
    }
}

/// Listener of an [`Upgraded`] transport; incoming connections are upgraded
/// as inbound.
#[pin_project::pin_project]
pub struct UpgradedListener<T>
where
    T: Transport,
{
    #[pin]
    inner: T::Listener,
    upgrader: Upgrader,
}

impl<T, C> Stream for UpgradedListener<T>
where
    T: Transport<Output = RawConnection<C>>,
    T::ListenerUpgrade: Send + 'static,
    T::Error: Send + 'static,
    C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    type Item = ListenerEvent<
        BoxFuture<'static, Result<Connection, TransportUpgradeError<T::Error>>>,
        TransportUpgradeError<T::Error>,
    >;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        let event = match futures::ready!(this.inner.poll_next(cx)) {
            Some(event) => event,
            None => return Poll::Ready(None),
        };
        let upgrader = this.upgrader.clone();
        let event = event
            .map_upgrade(move |upgrade| {
                async move {
                    let raw = upgrade.await.map_err(TransportUpgradeError::Transport)?;
                    let connection = upgrader
                        .upgrade_inbound(raw, UpgradeOptions::default())
                        .await?;
                    Ok::<_, TransportUpgradeError<T::Error>>(connection)
                }
                .boxed()
            })
            .map_err(TransportUpgradeError::Transport);
        Poll::Ready(Some(event))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportUpgradeError<TE: error::Error> {
    #[error("Transport error: {0}")]
    Transport(#[source] TE),
    #[error(transparent)]
    Upgrade(#[from] Error),
}
