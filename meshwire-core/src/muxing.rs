use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use futures::{AsyncRead, AsyncWrite, future::BoxFuture};

use crate::{
    Endpoint, Negotiated, Upgrade, UpgradeInfo,
    registry::Registry,
    utils::BoxedStream,
};

mod boxed;

pub use boxed::{StreamMuxerBox, SubstreamBox};

pub trait StreamMuxer {
    type Substream: AsyncRead + AsyncWrite;
    type Error: std::error::Error;

    /// Poll for a substream opened by the remote.
    ///
    /// An error is fatal for the whole muxer, including when the remote has
    /// gone away.
    fn poll_inbound(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Self::Substream, Self::Error>>;

    /// Poll for a new locally opened substream.
    fn poll_outbound(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Self::Substream, Self::Error>>;

    /// Poll for a graceful shutdown of the muxer.
    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>>;
}

pub trait StreamMuxerExt: StreamMuxer + Sized {
    /// Convenience function for calling [`StreamMuxer::poll_inbound`]
    /// for [`StreamMuxer`]s that are `Unpin`.
    fn poll_inbound_unpin(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Self::Substream, Self::Error>>
    where
        Self: Unpin,
    {
        Pin::new(self).poll_inbound(cx)
    }

    /// Convenience function for calling [`StreamMuxer::poll_outbound`]
    /// for [`StreamMuxer`]s that are `Unpin`.
    fn poll_outbound_unpin(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Self::Substream, Self::Error>>
    where
        Self: Unpin,
    {
        Pin::new(self).poll_outbound(cx)
    }

    /// Convenience function for calling [`StreamMuxer::poll_close`]
    /// for [`StreamMuxer`]s that are `Unpin`.
    fn poll_close_unpin(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>>
    where
        Self: Unpin,
    {
        Pin::new(self).poll_close(cx)
    }

    /// Returns a future for closing this [`StreamMuxer`].
    fn close(self) -> Close<Self> {
        Close(self)
    }
}

impl<S> StreamMuxerExt for S where S: StreamMuxer {}

pub struct Close<S>(S);

impl<S> Future for Close<S>
where
    S: StreamMuxer + Unpin,
{
    type Output = Result<(), S::Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.0.poll_close_unpin(cx)
    }
}

/// Builds a [`StreamMuxer`] on top of a secured duplex.
pub trait StreamMuxerFactory: Send + Sync + 'static {
    /// The protocol id announced during negotiation, e.g. `/yamux/1.0.0`.
    fn protocol(&self) -> &str;

    fn create_stream_muxer(&self, io: BoxedStream, endpoint: Endpoint)
    -> io::Result<StreamMuxerBox>;
}

/// Negotiates one of the registered muxers and wraps the duplex with it.
#[derive(Clone)]
pub struct MultiplexUpgrade {
    muxers: Registry<dyn StreamMuxerFactory>,
}

impl MultiplexUpgrade {
    pub fn new(muxers: Registry<dyn StreamMuxerFactory>) -> Self {
        MultiplexUpgrade { muxers }
    }

    fn apply(
        self,
        stream: Negotiated<BoxedStream>,
        info: String,
        endpoint: Endpoint,
    ) -> BoxFuture<'static, io::Result<(String, StreamMuxerBox)>> {
        let result = match self.muxers.get(&info) {
            Some(factory) => factory
                .create_stream_muxer(Box::new(stream), endpoint)
                .map(|muxer| (info, muxer)),
            None => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("no muxer registered for {info}"),
            )),
        };
        Box::pin(futures::future::ready(result))
    }
}

impl UpgradeInfo for MultiplexUpgrade {
    type Info = String;
    type InfoIter = std::vec::IntoIter<String>;

    fn protocol_info(&self) -> Self::InfoIter {
        self.muxers
            .protocols()
            .map(str::to_owned)
            .collect::<Vec<_>>()
            .into_iter()
    }
}

impl Upgrade<Negotiated<BoxedStream>> for MultiplexUpgrade {
    type Output = (String, StreamMuxerBox);
    type Error = io::Error;
    type Future = BoxFuture<'static, io::Result<(String, StreamMuxerBox)>>;

    fn upgrade_inbound(self, stream: Negotiated<BoxedStream>, info: Self::Info) -> Self::Future {
        self.apply(stream, info, Endpoint::Listener)
    }

    fn upgrade_outbound(self, stream: Negotiated<BoxedStream>, info: Self::Info) -> Self::Future {
        self.apply(stream, info, Endpoint::Dialer)
    }
}
