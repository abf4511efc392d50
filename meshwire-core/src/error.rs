use std::io;

use meshwire_stream_select::NegotiationError;

use crate::PeerId;

/// Errors surfaced by connection upgrades and stream operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A gater hook refused the connection.
    #[error("connection denied")]
    ConnectionDenied,

    #[error("connection protection failed: {0}")]
    ProtectionFailed(#[source] io::Error),

    /// Encrypter negotiation or the security handshake failed.
    #[error("encryption failed: {0}")]
    EncryptionFailed(#[source] io::Error),

    /// The secured remote identity differs from the peer that was dialed.
    #[error("unexpected peer: expected {expected}, got {actual}")]
    UnexpectedPeer { expected: PeerId, actual: PeerId },

    /// No muxer could be agreed on, or the connection has none.
    #[error("no stream multiplexer available")]
    MuxerUnavailable,

    /// The remote supports none of the requested stream protocols.
    #[error("protocol selection failed")]
    UnsupportedProtocol,

    #[error("connection ended")]
    ConnectionEnded,

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation timed out")]
    Timeout,

    #[error("stream negotiation failed: {0}")]
    Negotiation(#[from] NegotiationError),

    #[error(transparent)]
    Io(#[from] io::Error),
}
