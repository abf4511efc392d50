use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{AsyncRead, AsyncWrite, Sink, Stream, ready};

/// Largest frame accepted in either direction, trailing newline included.
pub(crate) const MAX_FRAME_SIZE: usize = 1024;

/// Digits needed to spell [`MAX_FRAME_SIZE`].
const MAX_LEN_DIGITS: usize = 4;

/// Bytes pulled from the underlying reader per read call.
const READ_CHUNK: usize = 64;

/// Frames a duplex as `<ascii-decimal-length>\n<frame>`.
///
/// Reads may pull more bytes than the current frame needs; those stay in the
/// read buffer and are handed back by [`LengthDelimited::into_inner`].
#[pin_project::pin_project]
#[derive(Debug)]
pub(crate) struct LengthDelimited<R> {
    #[pin]
    inner: R,
    read_buffer: BytesMut,
    write_buffer: BytesMut,
}

impl<R> LengthDelimited<R> {
    pub(crate) fn new(inner: R) -> Self {
        LengthDelimited {
            inner,
            read_buffer: BytesMut::with_capacity(READ_CHUNK),
            write_buffer: BytesMut::with_capacity(MAX_FRAME_SIZE),
        }
    }

    /// Returns the inner duplex and every byte read past the last decoded frame.
    ///
    /// Must only be called once the write buffer has been flushed.
    pub(crate) fn into_inner(self) -> (R, BytesMut) {
        debug_assert!(self.write_buffer.is_empty());
        (self.inner, self.read_buffer)
    }

    fn poll_write_buffer(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>>
    where
        R: AsyncWrite,
    {
        let mut this = self.project();
        while !this.write_buffer.is_empty() {
            match ready!(this.inner.as_mut().poll_write(cx, this.write_buffer)) {
                Ok(0) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "Failed to write buffered frame.",
                    )));
                }
                Ok(n) => this.write_buffer.advance(n),
                Err(err) => return Poll::Ready(Err(err)),
            }
        }
        Poll::Ready(Ok(()))
    }
}

fn invalid_data(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

/// Splits one complete frame off the front of `buf`, if there is one.
fn decode_frame(buf: &mut BytesMut) -> io::Result<Option<Bytes>> {
    let scan = buf.len().min(MAX_LEN_DIGITS + 1);
    let Some(newline) = buf[..scan].iter().position(|b| *b == b'\n') else {
        if buf.len() > MAX_LEN_DIGITS {
            return Err(invalid_data("length prefix too long"));
        }
        if !buf.iter().all(u8::is_ascii_digit) {
            return Err(invalid_data("length prefix is not a decimal number"));
        }
        return Ok(None);
    };

    let digits = &buf[..newline];
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Err(invalid_data("length prefix is not a decimal number"));
    }
    let len = digits
        .iter()
        .fold(0usize, |acc, d| acc * 10 + usize::from(d - b'0'));
    if len > MAX_FRAME_SIZE {
        return Err(invalid_data("frame exceeds maximum size"));
    }
    if buf.len() < newline + 1 + len {
        return Ok(None);
    }
    buf.advance(newline + 1);
    Ok(Some(buf.split_to(len).freeze()))
}

impl<R> Stream for LengthDelimited<R>
where
    R: AsyncRead,
{
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            match decode_frame(this.read_buffer) {
                Ok(Some(frame)) => return Poll::Ready(Some(Ok(frame))),
                Ok(None) => {}
                Err(err) => return Poll::Ready(Some(Err(err))),
            }

            let mut chunk = [0u8; READ_CHUNK];
            match ready!(this.inner.as_mut().poll_read(cx, &mut chunk)) {
                Ok(0) if this.read_buffer.is_empty() => return Poll::Ready(None),
                Ok(0) => {
                    return Poll::Ready(Some(Err(io::ErrorKind::UnexpectedEof.into())));
                }
                Ok(n) => this.read_buffer.extend_from_slice(&chunk[..n]),
                Err(err) => return Poll::Ready(Some(Err(err))),
            }
        }
    }
}

impl<R> Sink<Bytes> for LengthDelimited<R>
where
    R: AsyncWrite,
{
    type Error = io::Error;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        if self.write_buffer.len() >= MAX_FRAME_SIZE {
            ready!(self.poll_write_buffer(cx))?;
        }
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: Bytes) -> Result<(), Self::Error> {
        if item.len() > MAX_FRAME_SIZE {
            return Err(invalid_data("frame exceeds maximum size"));
        }
        let this = self.project();
        this.write_buffer.put_slice(item.len().to_string().as_bytes());
        this.write_buffer.put_u8(b'\n');
        this.write_buffer.put_slice(&item);
        Ok(())
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        ready!(self.as_mut().poll_write_buffer(cx))?;
        self.project().inner.poll_flush(cx)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        ready!(self.as_mut().poll_write_buffer(cx))?;
        self.project().inner.poll_close(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_frames_and_keeps_the_rest() {
        let mut buf = BytesMut::from(&b"3\nna\n12\n/echo/1.0.0\nhello"[..]);
        assert_eq!(decode_frame(&mut buf).unwrap().unwrap(), &b"na\n"[..]);
        assert_eq!(
            decode_frame(&mut buf).unwrap().unwrap(),
            &b"/echo/1.0.0\n"[..]
        );
        assert!(decode_frame(&mut buf).is_err());
    }

    #[test]
    fn waits_for_incomplete_frame() {
        let mut buf = BytesMut::from(&b"12\n/echo"[..]);
        assert!(decode_frame(&mut buf).unwrap().is_none());
        let mut buf = BytesMut::from(&b"12"[..]);
        assert!(decode_frame(&mut buf).unwrap().is_none());
    }

    #[test]
    fn rejects_garbage_and_oversized_frames() {
        let mut buf = BytesMut::from(&b"\x8f\x01abc"[..]);
        assert!(decode_frame(&mut buf).is_err());
        let mut buf = BytesMut::from(&b"99999\n"[..]);
        assert!(decode_frame(&mut buf).is_err());
        let mut buf = BytesMut::from(&b"2000\n"[..]);
        assert!(decode_frame(&mut buf).is_err());
    }
}
