use std::net::SocketAddr;

use crate::PeerId;

/// Hooks that may refuse a connection at each stage of its upgrade.
///
/// Every hook returns `true` to deny. The defaults allow everything.
pub trait ConnectionGater: Send + Sync + 'static {
    /// Called before dialing `peer`.
    fn deny_dial_peer(&self, _peer: &PeerId) -> bool {
        false
    }

    /// Called before dialing a specific address of `peer`.
    fn deny_dial_multiaddr(&self, _peer: Option<&PeerId>, _addr: &SocketAddr) -> bool {
        false
    }

    /// Keeps or drops a known address of `peer` before dialing it.
    fn filter_multiaddr_for_peer(&self, _peer: &PeerId, _addr: &SocketAddr) -> bool {
        true
    }

    fn deny_inbound_connection(&self, _remote_addr: &SocketAddr) -> bool {
        false
    }

    fn deny_outbound_connection(&self, _remote_addr: &SocketAddr) -> bool {
        false
    }

    fn deny_inbound_encrypted_connection(&self, _peer: &PeerId) -> bool {
        false
    }

    fn deny_outbound_encrypted_connection(&self, _peer: &PeerId) -> bool {
        false
    }

    fn deny_inbound_upgraded_connection(&self, _peer: &PeerId) -> bool {
        false
    }

    fn deny_outbound_upgraded_connection(&self, _peer: &PeerId) -> bool {
        false
    }
}

/// A gater that denies nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl ConnectionGater for AllowAll {}
