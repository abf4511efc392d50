pub use meshwire_core as core;
pub use meshwire_stream_select as stream_select;

#[cfg(feature = "host")]
mod host;
#[cfg(feature = "host")]
mod manager;

#[cfg(feature = "host")]
pub use host::{DEFAULT_MAX_CONNECTIONS, Host, HostBuilder, HostError};
#[cfg(feature = "host")]
pub use manager::{ConnectionManager, HostEvent};

#[cfg(feature = "tcp")]
pub use meshwire_tcp as tcp;

#[cfg(feature = "plaintext")]
pub use meshwire_plaintext as plaintext;

#[cfg(feature = "noise")]
pub use meshwire_noise as noise;

#[cfg(feature = "yamux")]
pub use meshwire_yamux as yamux;

#[cfg(feature = "pnet")]
pub use meshwire_pnet as pnet;
