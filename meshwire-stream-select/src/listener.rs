use std::{
    io, mem,
    pin::Pin,
    task::{Context, Poll},
};

use futures::{AsyncRead, AsyncWrite, Sink, Stream};
use smallvec::SmallVec;

use crate::{
    Negotiated, NegotiationError, ProtocolError,
    protocol::{HeaderLine, Message, MessageIO, Protocol},
};

/// Proposals a listener answers with `na` before giving up on the dialer.
const MAX_PROPOSALS: usize = 64;

/// Answers proposals from a dialer until one of `protocols` is selected.
#[pin_project::pin_project]
pub struct ListenerSelectFuture<R, N> {
    protocols: SmallVec<[(N, Protocol); 8]>,
    rejected: usize,
    state: State<R, N>,
}

enum State<R, N> {
    RecvHeader {
        io: MessageIO<R>,
    },
    SendHeader {
        io: MessageIO<R>,
    },
    RecvMessage {
        io: MessageIO<R>,
    },
    SendMessage {
        io: MessageIO<R>,
        message: Message,
        protocol: Option<N>,
    },
    Flush {
        io: MessageIO<R>,
        protocol: Option<N>,
    },
    Done,
}

impl<R, N> ListenerSelectFuture<R, N>
where
    R: AsyncRead + AsyncWrite,
    N: AsRef<str>,
{
    pub fn new(inner: R, protocols: impl IntoIterator<Item = N>) -> Self {
        let protocols = protocols
            .into_iter()
            .filter_map(|n| match Protocol::try_from(n.as_ref()) {
                Ok(p) => Some((n, p)),
                Err(_) => {
                    tracing::warn!(
                        protocol=%n.as_ref(),
                        "Listener: Ignoring invalid protocol id"
                    );
                    None
                }
            })
            .collect();

        ListenerSelectFuture {
            protocols,
            rejected: 0,
            state: State::RecvHeader {
                io: MessageIO::new(inner),
            },
        }
    }
}

impl<R, N> Future for ListenerSelectFuture<R, N>
where
    R: AsyncRead + AsyncWrite + Unpin,
    N: AsRef<str> + Clone,
{
    type Output = Result<(N, Negotiated<R>), NegotiationError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        loop {
            match mem::replace(this.state, State::Done) {
                State::RecvHeader { mut io } => match Pin::new(&mut io).poll_next(cx)? {
                    Poll::Ready(Some(Message::Header(HeaderLine::V1))) => {
                        *this.state = State::SendHeader { io };
                    }
                    Poll::Ready(Some(_)) => {
                        return Poll::Ready(Err(ProtocolError::InvalidMessage.into()));
                    }
                    Poll::Ready(None) => return Poll::Ready(Err(unexpected_eof())),
                    Poll::Pending => {
                        *this.state = State::RecvHeader { io };
                        return Poll::Pending;
                    }
                },

                State::SendHeader { mut io } => {
                    match Pin::new(&mut io).poll_ready(cx)? {
                        Poll::Ready(()) => {}
                        Poll::Pending => {
                            *this.state = State::SendHeader { io };
                            return Poll::Pending;
                        }
                    }
                    Pin::new(&mut io).start_send(Message::Header(HeaderLine::V1))?;
                    *this.state = State::Flush { io, protocol: None };
                }

                State::RecvMessage { mut io } => {
                    let msg = match Pin::new(&mut io).poll_next(cx)? {
                        Poll::Ready(Some(msg)) => msg,
                        Poll::Ready(None) => return Poll::Ready(Err(unexpected_eof())),
                        Poll::Pending => {
                            *this.state = State::RecvMessage { io };
                            return Poll::Pending;
                        }
                    };

                    let Message::Protocol(p) = msg else {
                        return Poll::Ready(Err(ProtocolError::InvalidMessage.into()));
                    };
                    let supported = this
                        .protocols
                        .iter()
                        .find(|(_, candidate)| *candidate == p)
                        .map(|(n, _)| n.clone());

                    let message = match supported {
                        Some(_) => {
                            tracing::trace!(protocol=%p, "Listener: confirming protocol");
                            Message::Protocol(p)
                        }
                        None => {
                            tracing::trace!(protocol=%p, "Listener: rejecting protocol");
                            *this.rejected += 1;
                            if *this.rejected > MAX_PROPOSALS {
                                return Poll::Ready(Err(ProtocolError::TooManyProtocols.into()));
                            }
                            Message::NotAvailable
                        }
                    };
                    *this.state = State::SendMessage {
                        io,
                        message,
                        protocol: supported,
                    };
                }

                State::SendMessage {
                    mut io,
                    message,
                    protocol,
                } => {
                    match Pin::new(&mut io).poll_ready(cx)? {
                        Poll::Ready(()) => {}
                        Poll::Pending => {
                            *this.state = State::SendMessage {
                                io,
                                message,
                                protocol,
                            };
                            return Poll::Pending;
                        }
                    }
                    Pin::new(&mut io).start_send(message)?;
                    *this.state = State::Flush { io, protocol };
                }

                State::Flush { mut io, protocol } => match Pin::new(&mut io).poll_flush(cx)? {
                    Poll::Ready(()) => match protocol {
                        Some(protocol) => {
                            tracing::trace!(
                                protocol=%protocol.as_ref(),
                                "Listener: sent confirmed protocol"
                            );
                            let (io, buffer) = io.into_inner();
                            return Poll::Ready(Ok((protocol, Negotiated::new(io, buffer))));
                        }
                        None => *this.state = State::RecvMessage { io },
                    },
                    Poll::Pending => {
                        *this.state = State::Flush { io, protocol };
                        return Poll::Pending;
                    }
                },

                State::Done => panic!("ListenerSelectFuture polled after completion"),
            }
        }
    }
}

fn unexpected_eof() -> NegotiationError {
    io::Error::from(io::ErrorKind::UnexpectedEof).into()
}
