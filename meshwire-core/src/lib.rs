pub mod abort;
pub mod connection;
mod error;
pub mod events;
mod executor;
pub mod gater;
mod identity;
pub mod muxing;
pub mod protector;
pub mod registrar;
pub mod registry;
pub mod security;
pub mod transport;
pub mod upgrade;
pub mod upgrader;
pub mod utils;

pub use abort::{AbortController, AbortSignal};
pub use connection::{
    Connection, ConnectionId, ConnectionStatus, Direction, Endpoint, Stream, StreamId, StreamInfo,
    StreamOptions, Timeline,
};
pub use error::Error;
pub use events::{ConnectionEvent, EventBus};
pub use executor::Executor;
pub use gater::{AllowAll, ConnectionGater};
pub use identity::{DecodingError, Keypair, PeerId, PublicKey};
pub use muxing::{StreamMuxer, StreamMuxerFactory};
pub use protector::ConnectionProtector;
pub use registrar::{IncomingStream, Registrar, RegistrarError, StreamHandler};
pub use security::ConnectionEncrypter;
pub use transport::{ListenerEvent, RawConnection, Transport};
pub use upgrade::{Upgrade, UpgradeInfo};
pub use upgrader::{UpgradeOptions, Upgrader, UpgraderBuilder};
pub use utils::BoxedStream;

pub type Negotiated<T> = meshwire_stream_select::Negotiated<T>;
