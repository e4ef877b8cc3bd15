use crate::common::{Id, PeerAddress};

use super::{NetworkStatus, Rpc};

/// Information and statistics about this node.
#[derive(Debug, Clone)]
pub struct Info {
    id: Id,
    address: PeerAddress,
    status: NetworkStatus,
    peers: usize,
    unlocked_peers: usize,
    buckets: usize,
    siblings: usize,
    inflight_requests: usize,
}

impl Info {
    /// This Node's [Id]
    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    pub fn status(&self) -> &NetworkStatus {
        &self.status
    }

    /// Number of peers in the routing table, including locked ones.
    pub fn peers(&self) -> usize {
        self.peers
    }

    /// Number of peers available for lookups.
    pub fn unlocked_peers(&self) -> usize {
        self.unlocked_peers
    }

    /// Number of k-buckets.
    pub fn buckets(&self) -> usize {
        self.buckets
    }

    /// Number of peers in the sibling bucket.
    pub fn siblings(&self) -> usize {
        self.siblings
    }

    /// Requests still waiting for a response.
    pub fn inflight_requests(&self) -> usize {
        self.inflight_requests
    }
}

impl From<&Rpc> for Info {
    fn from(rpc: &Rpc) -> Self {
        let routing_table = rpc.routing_table();

        Self {
            id: *rpc.id(),
            address: rpc.address().clone(),
            status: rpc.status(),
            peers: routing_table.size(),
            unlocked_peers: routing_table.unlocked_size(),
            buckets: routing_table.buckets().len(),
            siblings: routing_table.siblings().len(),
            inflight_requests: rpc.socket().inflight_len(),
        }
    }
}
