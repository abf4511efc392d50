use std::{
    fmt, io,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::{BufMut, Bytes, BytesMut};
use futures::{AsyncRead, AsyncWrite, Sink, Stream, ready};

use crate::{NOT_AVAILABLE, PROTOCOL_HEADER, length_delimited::LengthDelimited};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum HeaderLine {
    V1,
}

/// A validated protocol id: starts with `/`, holds no newline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Protocol(String);

impl AsRef<str> for Protocol {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for Protocol {
    type Error = ProtocolError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        if !value.starts_with('/') || value.contains('\n') {
            return Err(ProtocolError::InvalidProtocol);
        }
        Ok(Protocol(value.to_owned()))
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Message {
    Header(HeaderLine),
    Protocol(Protocol),
    NotAvailable,
}

impl Message {
    fn encode(&self, dest: &mut BytesMut) {
        let payload = match self {
            Message::Header(HeaderLine::V1) => PROTOCOL_HEADER,
            Message::Protocol(p) => p.as_ref(),
            Message::NotAvailable => NOT_AVAILABLE,
        };
        dest.reserve(payload.len() + 1);
        dest.put_slice(payload.as_bytes());
        dest.put_u8(b'\n');
    }

    fn decode(msg: Bytes) -> Result<Message, ProtocolError> {
        let Some((b'\n', payload)) = msg.split_last() else {
            return Err(ProtocolError::InvalidMessage);
        };
        let payload = std::str::from_utf8(payload).map_err(|_| ProtocolError::InvalidMessage)?;
        match payload {
            PROTOCOL_HEADER => Ok(Message::Header(HeaderLine::V1)),
            NOT_AVAILABLE => Ok(Message::NotAvailable),
            other => Protocol::try_from(other)
                .map(Message::Protocol)
                .map_err(|_| ProtocolError::InvalidMessage),
        }
    }
}

/// Sends and receives [`Message`]s over a length-delimited duplex.
#[pin_project::pin_project]
#[derive(Debug)]
pub(crate) struct MessageIO<R> {
    #[pin]
    inner: LengthDelimited<R>,
}

impl<R> MessageIO<R> {
    pub(crate) fn new(inner: R) -> Self {
        MessageIO {
            inner: LengthDelimited::new(inner),
        }
    }

    pub(crate) fn into_inner(self) -> (R, BytesMut) {
        self.inner.into_inner()
    }
}

impl<R> Sink<Message> for MessageIO<R>
where
    R: AsyncWrite,
{
    type Error = ProtocolError;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().inner.poll_ready(cx).map_err(From::from)
    }

    fn start_send(self: Pin<&mut Self>, item: Message) -> Result<(), Self::Error> {
        let mut buf = BytesMut::new();
        item.encode(&mut buf);
        self.project()
            .inner
            .start_send(buf.freeze())
            .map_err(From::from)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().inner.poll_flush(cx).map_err(From::from)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().inner.poll_close(cx).map_err(From::from)
    }
}

impl<R> Stream for MessageIO<R>
where
    R: AsyncRead,
{
    type Item = Result<Message, ProtocolError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match ready!(self.project().inner.poll_next(cx)) {
            Some(Ok(frame)) => Poll::Ready(Some(Message::decode(frame))),
            Some(Err(err)) => Poll::Ready(Some(Err(err.into()))),
            None => Poll::Ready(None),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    #[error("Received an invalid message from the remote.")]
    InvalidMessage,

    #[error("A protocol id is invalid.")]
    InvalidProtocol,

    #[error("Too many protocols have been proposed.")]
    TooManyProtocols,
}

impl From<ProtocolError> for io::Error {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::IoError(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_and_rejection_are_recognised() {
        let header = Message::decode(Bytes::from_static(b"/multistream/1.0.0\n")).unwrap();
        assert_eq!(header, Message::Header(HeaderLine::V1));
        let na = Message::decode(Bytes::from_static(b"na\n")).unwrap();
        assert_eq!(na, Message::NotAvailable);
    }

    #[test]
    fn protocol_messages_need_a_trailing_newline() {
        assert!(Message::decode(Bytes::from_static(b"/echo/1.0.0")).is_err());
        assert!(Message::decode(Bytes::from_static(b"echo\n")).is_err());
        let msg = Message::decode(Bytes::from_static(b"/echo/1.0.0\n")).unwrap();
        assert_eq!(msg, Message::Protocol(Protocol("/echo/1.0.0".into())));
    }

    #[test]
    fn encoded_header_is_newline_terminated() {
        let mut buf = BytesMut::new();
        Message::Header(HeaderLine::V1).encode(&mut buf);
        assert_eq!(&buf[..], b"/multistream/1.0.0\n");
    }
}
