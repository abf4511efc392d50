use std::{
    collections::VecDeque,
    io,
    sync::Arc,
    task::{Context, Poll},
};

use futures::{
    StreamExt,
    channel::{mpsc, oneshot},
    future,
};

use super::ConnectionInner;
use crate::muxing::{StreamMuxerBox, StreamMuxerExt, SubstreamBox};

pub(crate) enum Command {
    Open(oneshot::Sender<io::Result<SubstreamBox>>),
    Close,
}

/// Owns the muxer of a connection and polls it on a background task.
///
/// Outbound opens arrive as commands; inbound substreams are handed to the
/// connection for negotiation and dispatch.
pub(crate) struct Driver {
    muxer: StreamMuxerBox,
    commands: mpsc::UnboundedReceiver<Command>,
    pending_opens: VecDeque<oneshot::Sender<io::Result<SubstreamBox>>>,
    connection: Arc<ConnectionInner>,
    closing: bool,
}

impl Driver {
    pub(crate) fn new(
        muxer: StreamMuxerBox,
        commands: mpsc::UnboundedReceiver<Command>,
        connection: Arc<ConnectionInner>,
    ) -> Self {
        Driver {
            muxer,
            commands,
            pending_opens: VecDeque::new(),
            connection,
            closing: false,
        }
    }

    pub(crate) async fn run(mut self, done: oneshot::Sender<()>) {
        let peer = self.connection.config.remote_peer;
        match future::poll_fn(|cx| self.poll(cx)).await {
            Ok(()) => tracing::trace!(peer=%peer, "Muxer closed"),
            Err(e) => tracing::debug!(peer=%peer, error=%e, "Connection ended"),
        }
        let Driver {
            muxer, connection, ..
        } = self;
        drop(muxer);
        connection.finalize();
        let _ = done.send(());
    }

    fn poll(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        loop {
            if self.closing {
                // Dropping the senders fails the pending opens.
                self.pending_opens.clear();
                return self.muxer.poll_close_unpin(cx);
            }

            match self.commands.poll_next_unpin(cx) {
                Poll::Ready(Some(Command::Open(reply))) => {
                    self.pending_opens.push_back(reply);
                    continue;
                }
                Poll::Ready(Some(Command::Close)) | Poll::Ready(None) => {
                    self.closing = true;
                    continue;
                }
                Poll::Pending => {}
            }

            self.pending_opens.retain(|reply| !reply.is_canceled());
            if !self.pending_opens.is_empty() {
                match self.muxer.poll_outbound_unpin(cx) {
                    Poll::Ready(Ok(substream)) => {
                        if let Some(reply) = self.pending_opens.pop_front() {
                            let _ = reply.send(Ok(substream));
                        }
                        continue;
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => {}
                }
            }

            match self.muxer.poll_inbound_unpin(cx) {
                Poll::Ready(Ok(substream)) => {
                    self.connection.accept_inbound(substream);
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
