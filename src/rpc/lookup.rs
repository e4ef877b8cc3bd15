//! Iterative lookup of the peers closest to a key.

use std::collections::HashSet;
use std::time::Instant;

use tracing::debug;

use crate::common::{Id, PeerAddress, RequestSpecific, ResponseSpecific};

use super::batch::{Event, RequestBatch};
use super::{ClosestPeers, Reply, Rpc};

/// One run of the iterative "find K closest peers" protocol.
///
/// At most `alpha` requests are in flight, the closest unqueried candidate is asked next.
/// Stops when there is nothing left to ask, when the `k`th closest response is no
/// farther than any remaining candidate, on the overall timeout or on shutdown.
#[derive(Debug)]
pub(crate) struct Lookup<'a> {
    rpc: &'a Rpc,
    target: Id,
    /// Peers that answered.
    responses: ClosestPeers,
    /// Peers not queried yet.
    candidates: ClosestPeers,
    /// Everyone queried so far, answered or not.
    contacted: HashSet<Id>,
    batch: RequestBatch<'a>,
}

impl<'a> Lookup<'a> {
    pub fn new(rpc: &'a Rpc, target: Id) -> Self {
        Self {
            rpc,
            target,
            responses: ClosestPeers::new(target),
            candidates: ClosestPeers::new(target),
            contacted: HashSet::new(),
            batch: RequestBatch::new(rpc.socket()),
        }
    }

    /// Returns up to `k` peers that answered, closest first. May include the local node.
    pub fn run(mut self) -> Vec<PeerAddress> {
        let config = self.rpc.config();
        let started = Instant::now();
        let deadline = started + config.lookup_timeout;

        let seeds: Vec<PeerAddress> = self
            .rpc
            .routing_table()
            .iter()
            .filter(|peer| !peer.is_locked())
            .map(|peer| peer.address().clone())
            .collect();

        debug!(key = ?self.target, candidates = seeds.len(), "Lookup started");

        for peer in seeds {
            self.candidates.add(peer);
        }

        loop {
            if self.is_done() {
                break;
            }

            self.query_candidates();

            if self.batch.is_empty() {
                // Nothing in flight, so no candidate is left either.
                continue;
            }

            if Instant::now() >= deadline {
                debug!(key = ?self.target, "Lookup timed out");
                break;
            }

            let wake_up = self
                .batch
                .next_expiry(config.request_timeout)
                .map_or(deadline, |expiry| expiry.min(deadline));

            match self.batch.next(wake_up, self.rpc.shutdown()) {
                Event::Reply(reply) => self.handle_reply(reply),
                Event::Timeout => {
                    for peer in self.batch.expire(config.request_timeout) {
                        debug!(?peer, key = ?self.target, "Lookup request timed out");
                        self.rpc.no_response(&peer);
                    }
                }
                Event::Shutdown => break,
            }
        }

        let target = self.target;
        let closest = self.responses.take(config.k);

        debug!(
            key = ?target,
            responses = closest.len(),
            elapsed = ?started.elapsed(),
            "Lookup done"
        );

        closest
    }

    fn query_candidates(&mut self) {
        let alpha = self.rpc.config().alpha.max(1);

        while self.batch.pending_len() < alpha {
            let peer = match self.candidates.pop_closest() {
                Some(peer) => peer,
                None => break,
            };

            if !self.contacted.insert(*peer.id()) {
                continue;
            }

            if peer.id() == self.rpc.id() {
                // Answer for ourselves without a round trip.
                let closest = self.rpc.closest_peers(&self.target, self.rpc.config().k);
                self.responses.add(peer);
                self.merge(closest);

                continue;
            }

            let request = RequestSpecific::FindClosePeers { key: self.target };

            if !self.batch.send(&peer, request) {
                self.rpc.no_response(&peer);
            }
        }
    }

    fn handle_reply(&mut self, reply: Reply) {
        match reply.response {
            Ok(ResponseSpecific::PeerList(peers)) => {
                self.responses.add(reply.from);
                self.merge(peers);
            }
            response => {
                debug!(from = ?reply.from, ?response, "Unexpected lookup response");
                self.rpc.no_response(&reply.from);
            }
        }
    }

    fn merge(&mut self, peers: Vec<PeerAddress>) {
        for peer in peers {
            if self.contacted.contains(peer.id()) || self.rpc.is_banned(&peer) {
                continue;
            }

            self.candidates.add(peer);
        }
    }

    fn is_done(&self) -> bool {
        if self.batch.is_empty() && self.candidates.is_empty() {
            return true;
        }

        let k = self.rpc.config().k;

        if self.responses.len() < k.max(1) {
            return false;
        }

        match (
            self.responses.nth_distance(k.max(1) - 1),
            self.candidates.nth_distance(0),
        ) {
            (Some(kth_response), Some(closest_candidate)) => kth_response <= closest_candidate,
            _ => false,
        }
    }
}
