use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use chacha20::{
    XChaCha20,
    cipher::{KeyIvInit, StreamCipher},
};
use futures::{AsyncRead, AsyncWrite, ready};

use crate::{NONCE_SIZE, PreSharedKey};

/// Largest chunk encrypted per write.
const WRITE_CHUNK: usize = 16 * 1024;

/// A duplex whose bytes are XOR-ed with per-direction XChaCha20 keystreams.
pub struct PnetOutput<S> {
    inner: S,
    read_cipher: XChaCha20,
    write_cipher: XChaCha20,
    pending: Vec<u8>,
    pending_pos: usize,
}

impl<S> PnetOutput<S> {
    pub(crate) fn new(
        inner: S,
        key: &PreSharedKey,
        local_nonce: &[u8; NONCE_SIZE],
        remote_nonce: &[u8; NONCE_SIZE],
    ) -> Self {
        PnetOutput {
            inner,
            read_cipher: XChaCha20::new(key.as_bytes().into(), remote_nonce.into()),
            write_cipher: XChaCha20::new(key.as_bytes().into(), local_nonce.into()),
            pending: Vec::new(),
            pending_pos: 0,
        }
    }
}

impl<S> PnetOutput<S>
where
    S: AsyncWrite + Unpin,
{
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.pending_pos < self.pending.len() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.pending[self.pending_pos..]))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.pending_pos += n;
        }
        self.pending.clear();
        self.pending_pos = 0;
        Poll::Ready(Ok(()))
    }
}

impl<S> AsyncRead for PnetOutput<S>
where
    S: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let n = ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        this.read_cipher.apply_keystream(&mut buf[..n]);
        Poll::Ready(Ok(n))
    }
}

impl<S> AsyncWrite for PnetOutput<S>
where
    S: AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        let n = buf.len().min(WRITE_CHUNK);
        this.pending.extend_from_slice(&buf[..n]);
        this.write_cipher.apply_keystream(&mut this.pending);
        let _ = this.poll_drain(cx)?;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_close(cx)
    }
}
