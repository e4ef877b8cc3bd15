//! Capabilities the Dht is constructed with: the datagram transport, and the
//! optional ban list and peer source.

use std::fmt::Debug;
use std::io;

use crate::common::PeerAddress;

/// Transports are plain I/O.
pub type TransportError = io::Error;

/// Carries datagrams between peers, for example over an anonymity network.
///
/// Sending only acknowledges the dispatch, delivery is not guaranteed.
/// Inbound datagrams are passed to [crate::Dht::handle_packet].
pub trait Transport: Debug + Send + Sync {
    fn send(&self, to: &PeerAddress, packet: &[u8]) -> Result<(), TransportError>;
}

/// Ban list, consulted for every inbound packet and before inserting a peer.
pub trait PeerFilter: Debug + Send + Sync {
    /// Returns true if packets from this peer should be dropped and the peer ignored.
    fn is_banned(&self, peer: &PeerAddress) -> bool;
}

/// Extra bootstrap peers found without seeds, for example from a relay or a local cache,
/// asked for on every bootstrap round.
pub trait PeerSource: Debug + Send + Sync {
    fn peers(&self) -> Vec<PeerAddress>;
}
