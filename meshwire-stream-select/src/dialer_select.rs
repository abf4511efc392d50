use std::{
    io, mem,
    pin::Pin,
    task::{Context, Poll},
};

use futures::{AsyncRead, AsyncWrite, Sink, Stream};

use crate::{
    Negotiated, NegotiationError, ProtocolError,
    protocol::{HeaderLine, Message, MessageIO, Protocol},
};

/// Proposes protocols in order until the listener accepts one.
#[pin_project::pin_project]
pub struct DialerSelectFuture<R, I>
where
    I: Iterator,
{
    protocols: I,
    header_received: bool,
    state: State<R, I::Item>,
}

enum State<R, N> {
    SendHeader { io: MessageIO<R> },
    SendProtocol { io: MessageIO<R>, protocol: N },
    FlushProtocol { io: MessageIO<R>, protocol: N },
    AwaitProtocol { io: MessageIO<R>, protocol: N },
    Done,
}

impl<R, I> DialerSelectFuture<R, I>
where
    R: AsyncRead + AsyncWrite,
    I: Iterator,
    I::Item: AsRef<str>,
{
    pub fn new(inner: R, protocols: impl IntoIterator<IntoIter = I>) -> Self {
        DialerSelectFuture {
            protocols: protocols.into_iter(),
            header_received: false,
            state: State::SendHeader {
                io: MessageIO::new(inner),
            },
        }
    }
}

impl<R, I> Future for DialerSelectFuture<R, I>
where
    R: AsyncRead + AsyncWrite + Unpin,
    I: Iterator,
    I::Item: AsRef<str>,
{
    type Output = Result<(I::Item, Negotiated<R>), NegotiationError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        loop {
            match mem::replace(this.state, State::Done) {
                State::SendHeader { mut io } => {
                    match Pin::new(&mut io).poll_ready(cx)? {
                        Poll::Ready(()) => {}
                        Poll::Pending => {
                            *this.state = State::SendHeader { io };
                            return Poll::Pending;
                        }
                    }
                    Pin::new(&mut io).start_send(Message::Header(HeaderLine::V1))?;
                    let protocol = this.protocols.next().ok_or(NegotiationError::Failed)?;
                    *this.state = State::SendProtocol { io, protocol };
                }

                State::SendProtocol { mut io, protocol } => {
                    match Pin::new(&mut io).poll_ready(cx)? {
                        Poll::Ready(()) => {}
                        Poll::Pending => {
                            *this.state = State::SendProtocol { io, protocol };
                            return Poll::Pending;
                        }
                    }
                    let p = Protocol::try_from(protocol.as_ref())?;
                    tracing::trace!(protocol=%p, "Dialer: Proposing protocol");
                    Pin::new(&mut io).start_send(Message::Protocol(p))?;
                    *this.state = State::FlushProtocol { io, protocol };
                }

                State::FlushProtocol { mut io, protocol } => {
                    match Pin::new(&mut io).poll_flush(cx)? {
                        Poll::Ready(()) => *this.state = State::AwaitProtocol { io, protocol },
                        Poll::Pending => {
                            *this.state = State::FlushProtocol { io, protocol };
                            return Poll::Pending;
                        }
                    }
                }

                State::AwaitProtocol { mut io, protocol } => {
                    let msg = match Pin::new(&mut io).poll_next(cx)? {
                        Poll::Ready(Some(msg)) => msg,
                        Poll::Ready(None) => {
                            return Poll::Ready(Err(ProtocolError::from(io::Error::from(
                                io::ErrorKind::UnexpectedEof,
                            ))
                            .into()));
                        }
                        Poll::Pending => {
                            *this.state = State::AwaitProtocol { io, protocol };
                            return Poll::Pending;
                        }
                    };

                    match msg {
                        Message::Header(HeaderLine::V1) if !*this.header_received => {
                            *this.header_received = true;
                            *this.state = State::AwaitProtocol { io, protocol };
                        }
                        Message::Protocol(ref p)
                            if *this.header_received && p.as_ref() == protocol.as_ref() =>
                        {
                            tracing::trace!(protocol=%p, "Dialer: Received confirmation for protocol");
                            let (io, buffer) = io.into_inner();
                            return Poll::Ready(Ok((protocol, Negotiated::new(io, buffer))));
                        }
                        Message::NotAvailable if *this.header_received => {
                            tracing::trace!(
                                protocol=%protocol.as_ref(),
                                "Dialer: Received rejection of protocol"
                            );
                            let protocol = this.protocols.next().ok_or(NegotiationError::Failed)?;
                            *this.state = State::SendProtocol { io, protocol };
                        }
                        _ => return Poll::Ready(Err(ProtocolError::InvalidMessage.into())),
                    }
                }

                State::Done => panic!("DialerSelectFuture polled after completion"),
            }
        }
    }
}
