//! Multistream protocol selection.
//!
//! Both ends of a fresh duplex exchange the `/multistream/1.0.0` header, then the
//! dialer proposes protocol ids one by one until the listener echoes one back.
//! Every message on the wire is `<ascii-decimal-length>\n<payload>\n`, the length
//! counting the payload and its trailing newline.

mod dialer_select;
mod length_delimited;
mod listener;
mod negotiated;
mod protocol;

pub use dialer_select::DialerSelectFuture;
pub use listener::ListenerSelectFuture;
pub use negotiated::{Negotiated, NegotiationError};
pub use protocol::ProtocolError;

/// The header both sides send before any proposal.
pub const PROTOCOL_HEADER: &str = "/multistream/1.0.0";

/// The literal token a listener answers with when it does not support a proposal.
pub const NOT_AVAILABLE: &str = "na";
