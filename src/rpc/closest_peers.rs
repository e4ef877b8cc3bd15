use std::cmp::Ordering;

use crate::common::{Id, PeerAddress};

#[derive(Debug, Clone)]
/// Peers sorted by ascending XOR distance to a target, without duplicates.
pub struct ClosestPeers {
    target: Id,
    peers: Vec<PeerAddress>,
}

impl ClosestPeers {
    pub fn new(target: Id) -> Self {
        Self {
            target,
            peers: Vec::with_capacity(64),
        }
    }

    // === Getters ===

    pub fn target(&self) -> &Id {
        &self.target
    }

    pub fn peers(&self) -> &[PeerAddress] {
        &self.peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// The closest peer, if any.
    pub fn first(&self) -> Option<&PeerAddress> {
        self.peers.first()
    }

    // === Public Methods ===

    /// Insert a peer in its place, returns false if it was already present.
    pub fn add(&mut self, peer: PeerAddress) -> bool {
        match self.search(peer.id()) {
            Ok(_) => false,
            Err(index) => {
                self.peers.insert(index, peer);
                true
            }
        }
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.search(id).is_ok()
    }

    pub fn remove(&mut self, id: &Id) -> Option<PeerAddress> {
        self.search(id).ok().map(|index| self.peers.remove(index))
    }

    pub fn pop_closest(&mut self) -> Option<PeerAddress> {
        if self.peers.is_empty() {
            return None;
        }

        Some(self.peers.remove(0))
    }

    /// Distance from the target to the `n`th closest peer (zero based).
    pub fn nth_distance(&self, n: usize) -> Option<Id> {
        self.peers.get(n).map(|peer| peer.id().xor(&self.target))
    }

    /// Compare how close two peers are to the target.
    pub fn compare(&self, a: &Id, b: &Id) -> Ordering {
        a.xor(&self.target).cmp(&b.xor(&self.target))
    }

    /// Consume into the `count` closest peers.
    pub fn take(mut self, count: usize) -> Vec<PeerAddress> {
        self.peers.truncate(count);
        self.peers
    }

    // === Private Methods ===

    /// XOR with the target is a bijection, so equal distances mean equal Ids.
    fn search(&self, id: &Id) -> Result<usize, usize> {
        let seek = id.xor(&self.target);

        self.peers
            .binary_search_by(|probe| probe.id().xor(&self.target).cmp(&seek))
    }
}
