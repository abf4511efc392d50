use std::{
    fmt, io,
    pin::Pin,
    task::{Context, Poll},
};

use futures::{AsyncRead, AsyncWrite, ready};
use snow::TransportState;

use crate::MAX_FRAME_LEN;

/// Authentication tag appended to every ciphertext.
const TAG_LEN: usize = 16;
const MAX_PLAINTEXT_LEN: usize = MAX_FRAME_LEN - TAG_LEN;

#[derive(Clone, Copy)]
enum ReadState {
    Length { buf: [u8; 2], filled: usize },
    Frame { len: usize, filled: usize },
    Eof,
}

/// A noise session over `T`: plaintext in, length-prefixed ciphertext out.
pub struct Output<T> {
    io: T,
    session: TransportState,
    read_state: ReadState,
    frame: Vec<u8>,
    decrypted: Vec<u8>,
    decrypted_pos: usize,
    pending: Vec<u8>,
    pending_pos: usize,
}

impl<T> Output<T> {
    pub(crate) fn new(io: T, session: TransportState) -> Self {
        Output {
            io,
            session,
            read_state: ReadState::Length {
                buf: [0; 2],
                filled: 0,
            },
            frame: Vec::new(),
            decrypted: Vec::new(),
            decrypted_pos: 0,
            pending: Vec::new(),
            pending_pos: 0,
        }
    }
}

impl<T> Output<T>
where
    T: AsyncWrite + Unpin,
{
    /// Writes out the frame encrypted by the last `poll_write`.
    fn poll_send_pending(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.pending_pos < self.pending.len() {
            let n = ready!(Pin::new(&mut self.io).poll_write(cx, &self.pending[self.pending_pos..]))?;
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

impl<T> AsyncRead for Output<T>
where
    T: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        loop {
            if this.decrypted_pos < this.decrypted.len() {
                let n = buf.len().min(this.decrypted.len() - this.decrypted_pos);
                buf[..n].copy_from_slice(&this.decrypted[this.decrypted_pos..this.decrypted_pos + n]);
                this.decrypted_pos += n;
                return Poll::Ready(Ok(n));
            }

            match this.read_state {
                ReadState::Length { mut buf, filled } => {
                    let n = ready!(Pin::new(&mut this.io).poll_read(cx, &mut buf[filled..]))?;
                    if n == 0 {
                        if filled == 0 {
                            this.read_state = ReadState::Eof;
                            return Poll::Ready(Ok(0));
                        }
                        return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
                    }
                    let filled = filled + n;
                    this.read_state = if filled == buf.len() {
                        let len = u16::from_be_bytes(buf) as usize;
                        this.frame.resize(len, 0);
                        ReadState::Frame { len, filled: 0 }
                    } else {
                        ReadState::Length { buf, filled }
                    };
                }
                ReadState::Frame { len, filled } if filled < len => {
                    let n = ready!(Pin::new(&mut this.io).poll_read(cx, &mut this.frame[filled..len]))?;
                    if n == 0 {
                        return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
                    }
                    this.read_state = ReadState::Frame {
                        len,
                        filled: filled + n,
                    };
                }
                ReadState::Frame { len, .. } => {
                    this.decrypted.resize(MAX_FRAME_LEN, 0);
                    let n = this
                        .session
                        .read_message(&this.frame[..len], &mut this.decrypted)
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                    this.decrypted.truncate(n);
                    this.decrypted_pos = 0;
                    this.read_state = ReadState::Length {
                        buf: [0; 2],
                        filled: 0,
                    };
                }
                ReadState::Eof => return Poll::Ready(Ok(0)),
            }
        }
    }
}

impl<T> AsyncWrite for Output<T>
where
    T: AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_send_pending(cx))?;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let n = buf.len().min(MAX_PLAINTEXT_LEN);
        let mut frame = vec![0u8; 2 + n + TAG_LEN];
        let len = this
            .session
            .write_message(&buf[..n], &mut frame[2..])
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        frame[..2].copy_from_slice(&(len as u16).to_be_bytes());
        frame.truncate(2 + len);
        this.pending = frame;
        this.pending_pos = 0;

        // The bytes are ours now; flushing them may happen on a later poll.
        let _ = this.poll_send_pending(cx)?;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_send_pending(cx))?;
        Pin::new(&mut this.io).poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_send_pending(cx))?;
        Pin::new(&mut this.io).poll_close(cx)
    }
}

impl<T> fmt::Debug for Output<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NoiseOutput").finish_non_exhaustive()
    }
}
