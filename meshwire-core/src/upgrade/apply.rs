use std::{
    mem,
    pin::Pin,
    task::{Context, Poll},
};

use futures::{AsyncRead, AsyncWrite};
use meshwire_stream_select::{DialerSelectFuture, ListenerSelectFuture};

use crate::{Endpoint, Negotiated, Upgrade, upgrade::UpgradeError};

enum State<C, U>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: Upgrade<Negotiated<C>>,
{
    Listening {
        future: ListenerSelectFuture<C, U::Info>,
        upgrade: U,
    },
    Dialing {
        future: DialerSelectFuture<C, U::InfoIter>,
        upgrade: U,
    },
    Upgrading {
        future: Pin<Box<U::Future>>,
        protocol: String,
    },
    Undefined,
}

/// Negotiates one of the protocols of an [`Upgrade`] over `C`, then applies
/// the upgrade for the selected protocol.
pub struct UpgradeApply<C, U>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: Upgrade<Negotiated<C>>,
{
    state: State<C, U>,
}

impl<C, U> UpgradeApply<C, U>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: Upgrade<Negotiated<C>>,
{
    pub fn new(io: C, upgrade: U, endpoint: Endpoint) -> Self {
        match endpoint {
            Endpoint::Dialer => Self::new_outbound(io, upgrade),
            Endpoint::Listener => Self::new_inbound(io, upgrade),
        }
    }

    pub fn new_outbound(io: C, upgrade: U) -> Self {
        UpgradeApply {
            state: State::Dialing {
                future: DialerSelectFuture::new(io, upgrade.protocol_info()),
                upgrade,
            },
        }
    }

    pub fn new_inbound(io: C, upgrade: U) -> Self {
        UpgradeApply {
            state: State::Listening {
                future: ListenerSelectFuture::new(io, upgrade.protocol_info()),
                upgrade,
            },
        }
    }
}

impl<C, U> Unpin for UpgradeApply<C, U>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: Upgrade<Negotiated<C>>,
{
}

impl<C, U> Future for UpgradeApply<C, U>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: Upgrade<Negotiated<C>>,
{
    type Output = Result<U::Output, UpgradeError<U::Error>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        loop {
            match mem::replace(&mut self.state, State::Undefined) {
                State::Dialing {
                    mut future,
                    upgrade,
                } => {
                    let (info, io) = match Pin::new(&mut future).poll(cx)? {
                        Poll::Ready(selected) => selected,
                        Poll::Pending => {
                            self.state = State::Dialing { future, upgrade };
                            return Poll::Pending;
                        }
                    };
                    tracing::trace!(upgrade=%info.as_ref(), "Negotiated outbound upgrade");
                    self.state = State::Upgrading {
                        protocol: info.as_ref().to_owned(),
                        future: Box::pin(upgrade.upgrade_outbound(io, info)),
                    };
                }
                State::Listening {
                    mut future,
                    upgrade,
                } => {
                    let (info, io) = match Pin::new(&mut future).poll(cx)? {
                        Poll::Ready(selected) => selected,
                        Poll::Pending => {
                            self.state = State::Listening { future, upgrade };
                            return Poll::Pending;
                        }
                    };
                    tracing::trace!(upgrade=%info.as_ref(), "Negotiated inbound upgrade");
                    self.state = State::Upgrading {
                        protocol: info.as_ref().to_owned(),
                        future: Box::pin(upgrade.upgrade_inbound(io, info)),
                    };
                }
                State::Upgrading {
                    mut future,
                    protocol,
                } => match future.as_mut().poll(cx) {
                    Poll::Ready(Ok(output)) => {
                        tracing::trace!(upgrade=%protocol, "Upgraded stream");
                        return Poll::Ready(Ok(output));
                    }
                    Poll::Ready(Err(e)) => {
                        tracing::debug!(upgrade=%protocol, "Failed to upgrade stream");
                        return Poll::Ready(Err(UpgradeError::Apply(e)));
                    }
                    Poll::Pending => {
                        self.state = State::Upgrading { future, protocol };
                        return Poll::Pending;
                    }
                },
                State::Undefined => panic!("UpgradeApply polled after completion"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{convert::Infallible, io};

    use futures::future::{self, Ready};
    use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};

    use super::*;
    use crate::UpgradeInfo;

    type Io = Compat<tokio::io::DuplexStream>;

    #[derive(Clone)]
    struct Named(Vec<&'static str>);

    impl UpgradeInfo for Named {
        type Info = &'static str;
        type InfoIter = std::vec::IntoIter<&'static str>;

        fn protocol_info(&self) -> Self::InfoIter {
            self.0.clone().into_iter()
        }
    }

    impl Upgrade<Negotiated<Io>> for Named {
        type Output = &'static str;
        type Error = Infallible;
        type Future = Ready<Result<&'static str, Infallible>>;

        fn upgrade_inbound(self, _: Negotiated<Io>, info: Self::Info) -> Self::Future {
            future::ready(Ok(info))
        }

        fn upgrade_outbound(self, _: Negotiated<Io>, info: Self::Info) -> Self::Future {
            future::ready(Ok(info))
        }
    }

    #[tokio::test]
    async fn both_sides_apply_the_negotiated_upgrade() {
        let (a, b) = tokio::io::duplex(1024);
        let dialer = UpgradeApply::new(a.compat(), Named(vec!["/x/1", "/y/1"]), Endpoint::Dialer);
        let listener = UpgradeApply::new(b.compat(), Named(vec!["/y/1"]), Endpoint::Listener);
        let (dialed, listened) = future::join(dialer, listener).await;
        assert_eq!(dialed.unwrap(), "/y/1");
        assert_eq!(listened.unwrap(), "/y/1");
    }

    #[tokio::test]
    async fn disjoint_protocol_sets_fail_selection() {
        let (a, b) = tokio::io::duplex(1024);
        let dialer = UpgradeApply::new(a.compat(), Named(vec!["/x/1"]), Endpoint::Dialer);
        let listener = UpgradeApply::new(b.compat(), Named(vec!["/y/1"]), Endpoint::Listener);
        let (dialed, _) = future::join(dialer, listener).await;
        let err = io::Error::from(match dialed {
            Err(UpgradeError::Select(e)) => e,
            _ => panic!("expected a selection failure"),
        });
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }
}
