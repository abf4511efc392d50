use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::{Buf, BytesMut};
use futures::{AsyncRead, AsyncWrite};

use crate::ProtocolError;

/// A duplex on which a protocol has been negotiated.
///
/// Bytes the negotiator read past the final negotiation message are returned
/// first, so the sub-protocol sees exactly what the remote sent after selection.
#[pin_project::pin_project]
#[derive(Debug)]
pub struct Negotiated<R> {
    #[pin]
    inner: R,
    buffer: BytesMut,
}

impl<R> Negotiated<R> {
    pub(crate) fn new(inner: R, buffer: BytesMut) -> Self {
        Negotiated { inner, buffer }
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    /// Bytes received after negotiation that have not been read yet.
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }
}

impl<R> AsyncRead for Negotiated<R>
where
    R: AsyncRead,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();
        if !this.buffer.is_empty() {
            let n = this.buffer.len().min(buf.len());
            buf[..n].copy_from_slice(&this.buffer[..n]);
            this.buffer.advance(n);
            return Poll::Ready(Ok(n));
        }
        this.inner.poll_read(cx, buf)
    }
}

impl<R> AsyncWrite for Negotiated<R>
where
    R: AsyncWrite,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.project().inner.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_close(cx)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        self.project().inner.poll_write_vectored(cx, bufs)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NegotiationError {
    #[error(transparent)]
    ProtocolError(#[from] ProtocolError),

    #[error("Protocol negotiation failed.")]
    Failed,
}

impl From<io::Error> for NegotiationError {
    fn from(err: io::Error) -> Self {
        NegotiationError::ProtocolError(ProtocolError::IoError(err))
    }
}

impl From<NegotiationError> for io::Error {
    fn from(err: NegotiationError) -> Self {
        match err {
            NegotiationError::ProtocolError(e) => e.into(),
            NegotiationError::Failed => {
                io::Error::new(io::ErrorKind::Unsupported, NegotiationError::Failed)
            }
        }
    }
}
