//! Yamux stream multiplexing for meshwire connections.

use std::{
    fmt, io,
    pin::Pin,
    task::{Context, Poll},
};

use futures::{AsyncRead, AsyncWrite};
use meshwire_core::{
    BoxedStream, Endpoint, StreamMuxer, StreamMuxerFactory, muxing::StreamMuxerBox,
};

pub const PROTOCOL: &str = "/yamux/1.0.0";

/// A yamux session over `C`.
pub struct Muxer<C> {
    connection: yamux::Connection<C>,
}

impl<C> Muxer<C>
where
    C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(io: C, config: yamux::Config, endpoint: Endpoint) -> Self {
        let mode = match endpoint {
            Endpoint::Dialer => yamux::Mode::Client,
            Endpoint::Listener => yamux::Mode::Server,
        };
        Muxer {
            connection: yamux::Connection::new(io, config, mode),
        }
    }
}

impl<C> fmt::Debug for Muxer<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Muxer").finish_non_exhaustive()
    }
}

impl<C> StreamMuxer for Muxer<C>
where
    C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    type Substream = yamux::Stream;
    type Error = yamux::ConnectionError;

    fn poll_inbound(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Self::Substream, Self::Error>> {
        // Polling for inbound streams also drives the session's I/O.
        match self.get_mut().connection.poll_next_inbound(cx) {
            Poll::Ready(Some(Ok(stream))) => {
                tracing::trace!(stream=%stream.id(), "Accepted inbound yamux stream");
                Poll::Ready(Ok(stream))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Err(e)),
            Poll::Ready(None) => Poll::Ready(Err(yamux::ConnectionError::Closed)),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_outbound(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Self::Substream, Self::Error>> {
        self.get_mut().connection.poll_new_outbound(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.get_mut().connection.poll_close(cx)
    }
}

/// Creates yamux muxers for negotiated connections.
#[derive(Debug, Clone)]
pub struct Config {
    inner: yamux::Config,
}

impl Config {
    pub fn new() -> Self {
        Config {
            inner: yamux::Config::default(),
        }
    }

    /// Caps the number of concurrently open streams per connection.
    pub fn max_num_streams(mut self, max: usize) -> Self {
        self.inner.set_max_num_streams(max);
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamMuxerFactory for Config {
    fn protocol(&self) -> &str {
        PROTOCOL
    }

    fn create_stream_muxer(&self, io: BoxedStream, endpoint: Endpoint) -> io::Result<StreamMuxerBox> {
        tracing::trace!(?endpoint, "Starting yamux session");
        Ok(StreamMuxerBox::new(Muxer::new(io, self.inner.clone(), endpoint)))
    }
}
