//! Remote peer identity and its liveness record in the routing table.
use std::{
    fmt::{self, Debug, Formatter},
    hash::{Hash, Hasher},
    time::Instant,
};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;

use crate::common::Id;
use crate::{Error, Result};

/// Number of consecutive timeouts after which a peer is locked.
pub const LOCK_THRESHOLD: u32 = 3;

#[derive(Clone)]
/// Opaque network address of a peer (for example an anonymity-network destination),
/// together with its derived [Id] (the SHA-256 of the address bytes).
pub struct PeerAddress {
    bytes: Bytes,
    id: Id,
}

impl PeerAddress {
    pub fn new<T: Into<Bytes>>(bytes: T) -> Self {
        let bytes = bytes.into();
        let id = Id::hash(&bytes);

        PeerAddress { bytes, id }
    }

    /// Parse a base-64 encoded address, as found in the peer file.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|_| Error::InvalidPeerAddress(encoded.to_string()))?;

        if bytes.is_empty() {
            return Err(Error::InvalidPeerAddress(encoded.to_string()));
        }

        Ok(PeerAddress::new(bytes))
    }

    // === Getters ===

    /// The peer's Id, derived from its address.
    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// An address whose Id is chosen instead of derived, to place peers at exact
    /// positions in the key space.
    #[cfg(test)]
    pub(crate) fn with_id(id: Id) -> Self {
        PeerAddress {
            bytes: Bytes::copy_from_slice(id.as_bytes()),
            id,
        }
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.bytes)
    }
}

impl PartialEq for PeerAddress {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Eq for PeerAddress {}

impl Hash for PeerAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state)
    }
}

impl Debug for PeerAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let id = self.id.to_string();
        write!(f, "Peer({})", &id[..16])
    }
}

#[derive(Debug, Clone)]
/// A peer entry in the routing table.
///
/// The address is immutable, liveness fields are only updated by the bucket
/// owning this record.
pub struct Peer {
    address: PeerAddress,
    consecutive_timeouts: u32,
    first_seen: Instant,
    last_response: Option<Instant>,
}

impl Peer {
    /// A peer we just learned about, unlocked and not yet heard from.
    pub fn new(address: PeerAddress) -> Self {
        Peer {
            address,
            consecutive_timeouts: 0,
            first_seen: Instant::now(),
            last_response: None,
        }
    }

    /// A peer that just sent us a packet.
    pub fn responded(address: PeerAddress) -> Self {
        Self::responded_at(address, Instant::now())
    }

    /// A peer we received a packet from at `received_at`.
    pub fn responded_at(address: PeerAddress, received_at: Instant) -> Self {
        Peer {
            address,
            consecutive_timeouts: 0,
            first_seen: received_at,
            last_response: Some(received_at),
        }
    }

    // === Getters ===

    pub fn id(&self) -> &Id {
        self.address.id()
    }

    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    pub fn consecutive_timeouts(&self) -> u32 {
        self.consecutive_timeouts
    }

    /// Locked peers are excluded from closest-peer selection, but not forgotten.
    pub fn is_locked(&self) -> bool {
        self.consecutive_timeouts >= LOCK_THRESHOLD
    }

    pub fn first_seen(&self) -> Instant {
        self.first_seen
    }

    pub fn last_response(&self) -> Option<Instant> {
        self.last_response
    }

    // === Public Methods ===

    pub(crate) fn no_response(&mut self) {
        self.consecutive_timeouts = self.consecutive_timeouts.saturating_add(1);
    }

    /// Merge a fresh record for the same peer into this one.
    ///
    /// Keeps the original `first_seen`, and resets the timeout counter.
    pub(crate) fn refresh(&mut self, incoming: &Peer) {
        self.consecutive_timeouts = incoming.consecutive_timeouts;

        if incoming.last_response > self.last_response {
            self.last_response = incoming.last_response;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn id_is_the_hash_of_the_address() {
        let address = PeerAddress::new(&b"destination"[..]);
        assert_eq!(address.id(), &Id::hash(b"destination"));
    }

    #[test]
    fn base64_round_trip() {
        let address = PeerAddress::new(vec![7_u8; 387]);
        let parsed = PeerAddress::from_base64(&address.to_base64()).unwrap();

        assert_eq!(parsed, address);
        assert!(PeerAddress::from_base64("not base64!").is_err());
        assert!(PeerAddress::from_base64("").is_err());
    }

    #[test]
    fn locks_after_threshold_and_recovers() {
        let address = PeerAddress::new(&b"peer"[..]);
        let mut peer = Peer::new(address.clone());

        for _ in 0..LOCK_THRESHOLD - 1 {
            peer.no_response();
        }
        assert!(!peer.is_locked());

        peer.no_response();
        assert!(peer.is_locked());

        let first_seen = peer.first_seen();
        peer.refresh(&Peer::responded(address));

        assert!(!peer.is_locked());
        assert_eq!(peer.first_seen(), first_seen);
        assert!(peer.last_response().is_some());
    }
}
