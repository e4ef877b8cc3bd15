//! Kademlia routing table with an S/Kademlia sibling bucket.

use std::time::Duration;

use tracing::trace;

use crate::common::kbucket::{KBucket, SiblingBucket, SiblingOffer};
use crate::common::{Id, KeyRange, Peer, PeerAddress};
use crate::rpc::ClosestPeers;

/// K = the default maximum size of a k-bucket.
pub const MAX_BUCKET_SIZE_K: usize = 20;
/// S = the default size of the sibling bucket.
pub const SIBLING_BUCKET_SIZE_S: usize = 100;
/// B = buckets not covering the local Id only split at depths that are not a multiple of B.
pub const SPLIT_GRANULARITY_B: u16 = 5;

#[derive(Debug, Clone)]
/// Kademlia routing table.
///
/// The sibling bucket holds the `S` peers closest to the local Id and takes
/// precedence: a peer is in exactly one of the siblings or the k-bucket covering
/// its Id. K-buckets partition the whole key space, sorted by range.
pub struct RoutingTable {
    id: Id,
    b: u16,
    buckets: Vec<KBucket>,
    siblings: SiblingBucket,
}

impl RoutingTable {
    /// Create a new [RoutingTable] with a given id and default sizes.
    pub fn new(id: Id) -> Self {
        Self::with_sizes(id, MAX_BUCKET_SIZE_K, SIBLING_BUCKET_SIZE_S, SPLIT_GRANULARITY_B)
    }

    /// Create an empty [RoutingTable] with custom `k`, `s` and `b` parameters.
    pub fn with_sizes(id: Id, k: usize, s: usize, b: u16) -> Self {
        RoutingTable {
            id,
            b,
            buckets: vec![KBucket::new(KeyRange::full(), k)],
            siblings: SiblingBucket::new(id, s, k),
        }
    }

    // === Getters ===

    /// Returns the [Id] of this node, where the distance is measured from.
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// K-buckets sorted by range.
    pub fn buckets(&self) -> &[KBucket] {
        &self.buckets
    }

    pub fn siblings(&self) -> &SiblingBucket {
        &self.siblings
    }

    // === Public Methods ===

    /// Add a new peer, or refresh the record of a known one.
    ///
    /// Returns `true` if the peer is in a bucket afterwards, `false` if it is the
    /// local node or ended up in a replacement cache.
    pub fn add_or_update(&mut self, peer: Peer) -> bool {
        if peer.id() == &self.id {
            return false;
        }

        let index = self.bucket_index(peer.id());

        if self.buckets[index].update(&peer) {
            return true;
        }

        match self.siblings.offer(peer) {
            SiblingOffer::Updated => true,
            SiblingOffer::Accepted { evicted } => {
                if let Some(evicted) = evicted {
                    trace!(?evicted, "Sibling pushed out to the k-buckets");
                    self.add_to_kbucket(evicted);
                }

                true
            }
            SiblingOffer::Rejected(peer) => self.add_to_kbucket(peer),
        }
    }

    /// Remove a peer from this routing table.
    ///
    /// A sibling that leaves is replaced by the closest peer from the k-buckets.
    pub fn remove(&mut self, id: &Id) -> Option<Peer> {
        if let Some(removed) = self.siblings.remove(id) {
            self.refill_siblings();

            return Some(removed);
        }

        let index = self.bucket_index(id);
        self.buckets[index].remove(id)
    }

    /// Count a missed response for a peer, returns `false` if it is unknown.
    pub fn no_response(&mut self, id: &Id) -> bool {
        if self.siblings.no_response(id) {
            return true;
        }

        let index = self.bucket_index(id);
        self.buckets[index].no_response(id)
    }

    /// Return up to `count` unlocked peers closest to the key, sorted by distance.
    pub fn closest_peers(&self, key: &Id, count: usize) -> Vec<PeerAddress> {
        let mut closest = ClosestPeers::new(*key);

        for peer in self.iter().filter(|peer| !peer.is_locked()) {
            closest.add(peer.address().clone());
        }

        closest.take(count)
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.get(id).is_some()
    }

    pub fn get(&self, id: &Id) -> Option<&Peer> {
        self.siblings
            .get(id)
            .or_else(|| self.buckets[self.bucket_index(id)].get(id))
    }

    /// Returns `true` if this routing table is empty.
    pub fn is_empty(&self) -> bool {
        self.siblings.is_empty() && self.buckets.iter().all(|bucket| bucket.is_empty())
    }

    /// Return the number of peers in this routing table, locked or not.
    pub fn size(&self) -> usize {
        self.siblings.len() + self.buckets.iter().map(KBucket::len).sum::<usize>()
    }

    /// Return the number of peers available for lookups.
    pub fn unlocked_size(&self) -> usize {
        self.iter().filter(|peer| !peer.is_locked()).count()
    }

    /// Iterate over all peers, siblings first.
    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.siblings
            .peers()
            .iter()
            .chain(self.buckets.iter().flat_map(|bucket| bucket.peers().iter()))
    }

    /// Export an owned vector of peers from this routing table.
    pub fn to_owned_peers(&self) -> Vec<Peer> {
        self.iter().cloned().collect()
    }

    // === Refresh bookkeeping ===

    /// Ranges of k-buckets that weren't looked up within `interval`.
    pub(crate) fn stale_buckets(&self, interval: Duration) -> Vec<KeyRange> {
        self.buckets
            .iter()
            .filter(|bucket| bucket.is_stale(interval))
            .map(|bucket| *bucket.range())
            .collect()
    }

    /// Mark the bucket covering this range as refreshed.
    ///
    /// The bucket may have split since the range was collected, so every bucket
    /// inside the range counts as refreshed.
    pub(crate) fn mark_refreshed(&mut self, range: &KeyRange) {
        for bucket in self.buckets.iter_mut() {
            if range.contains(&bucket.range().start()) || bucket.range().contains(&range.start())
            {
                bucket.mark_refreshed();
            }
        }
    }

    pub(crate) fn stale_sibling_sections(&self, interval: Duration) -> Vec<usize> {
        self.siblings.stale_sections(interval)
    }

    pub(crate) fn sibling_section_target(&self, index: usize) -> Option<Id> {
        self.siblings.section_target(index)
    }

    pub(crate) fn mark_sibling_section_refreshed(&mut self, index: usize) {
        self.siblings.mark_section_refreshed(index)
    }

    // === Private Methods ===

    /// Index of the k-bucket whose range contains the id.
    fn bucket_index(&self, id: &Id) -> usize {
        self.buckets
            .partition_point(|bucket| bucket.range().start() <= *id)
            .saturating_sub(1)
    }

    fn add_to_kbucket(&mut self, peer: Peer) -> bool {
        loop {
            let index = self.bucket_index(peer.id());
            let bucket = &mut self.buckets[index];

            if !bucket.is_full() {
                bucket.push(peer);
                return true;
            }

            if !bucket.can_split(&self.id, self.b) {
                bucket.add_to_replacement_cache(peer);
                return false;
            }

            self.split(index);
        }
    }

    /// Split the bucket at `index`. While all of its peers land in the same half,
    /// keep the empty half and split the other one again.
    fn split(&mut self, index: usize) {
        let mut pending = self.buckets.remove(index);
        let mut halves = Vec::with_capacity(2);

        loop {
            let (lower, upper) = match pending.clone().split() {
                Some(halves) => halves,
                None => {
                    halves.push(pending);
                    break;
                }
            };

            let total = lower.len() + upper.len();

            if total >= 2 && (lower.is_empty() || upper.is_empty()) {
                let (empty, full) = if lower.is_empty() {
                    (lower, upper)
                } else {
                    (upper, lower)
                };

                halves.push(empty);
                pending = full;
                continue;
            }

            halves.push(lower);
            halves.push(upper);
            break;
        }

        halves.sort_by_key(|bucket| bucket.range().start());

        trace!(depths = ?halves.iter().map(KBucket::depth).collect::<Vec<_>>(), "Split k-bucket");

        self.buckets.splice(index..index, halves);
    }

    /// Move the closest k-bucket peers into the sibling bucket until it is full again.
    fn refill_siblings(&mut self) {
        let missing = self.siblings.capacity().saturating_sub(self.siblings.len());

        if missing == 0 {
            return;
        }

        let mut candidates: Vec<Id> = self
            .buckets
            .iter()
            .flat_map(|bucket| bucket.peers().iter().map(|peer| *peer.id()))
            .collect();
        candidates.sort_by_key(|id| id.xor(&self.id));

        for id in candidates.into_iter().take(missing) {
            let index = self.bucket_index(&id);

            if let Some(peer) = self.buckets[index].remove(&id) {
                self.siblings.insert(peer);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;

    use super::*;
    use crate::common::LOCK_THRESHOLD;

    /// An Id whose most significant 4 bits are `n` and all other bits are zero.
    fn nibble(n: u8) -> Id {
        let mut bytes = [0_u8; 32];
        bytes[0] = n << 4;
        Id::from(bytes)
    }

    fn peer_at(id: Id) -> Peer {
        Peer::new(PeerAddress::with_id(id))
    }

    fn random_peer() -> Peer {
        peer_at(Id::random())
    }

    fn assert_partition(table: &RoutingTable) {
        let buckets = table.buckets();

        assert_eq!(buckets[0].range().start(), Id::ZERO);
        for pair in buckets.windows(2) {
            assert_eq!(pair[0].range().end(), Some(pair[1].range().start()));
        }
        assert_eq!(buckets.last().unwrap().range().end(), None);

        for bucket in buckets {
            assert!(bucket.len() <= bucket.capacity());
            for peer in bucket.peers() {
                assert!(bucket.range().contains(peer.id()));
            }
        }
    }

    #[test]
    fn table_is_empty() {
        let table = RoutingTable::new(Id::random());

        assert!(table.is_empty());
        assert_eq!(table.buckets().len(), 1);
        assert!(table.closest_peers(&Id::random(), 20).is_empty());
    }

    #[test]
    fn should_not_add_self() {
        let id = Id::random();
        let mut table = RoutingTable::new(id);

        assert!(!table.add_or_update(peer_at(id)));
        assert!(table.is_empty());
    }

    #[test]
    fn each_peer_lives_in_one_place() {
        let mut table = RoutingTable::with_sizes(Id::random(), 4, 8, 2);

        let peers: Vec<Peer> = (0..300).map(|_| random_peer()).collect();
        for peer in &peers {
            table.add_or_update(peer.clone());
        }
        // Updates must not duplicate.
        for peer in peers.iter().take(50) {
            table.add_or_update(peer.clone());
        }

        assert_partition(&table);

        let mut seen = HashSet::new();
        for peer in table.iter() {
            assert!(seen.insert(*peer.id()), "{:?} stored twice", peer.id());
        }
        assert_eq!(seen.len(), table.size());
    }

    #[test]
    fn siblings_are_the_closest_peers() {
        let local_id = Id::random();
        let mut table = RoutingTable::with_sizes(local_id, 4, 8, 2);

        let mut peers: Vec<Peer> = (0..200).map(|_| random_peer()).collect();
        for peer in &peers {
            table.add_or_update(peer.clone());
        }

        peers.sort_by_key(|peer| peer.id().xor(&local_id));
        let expected: Vec<Id> = peers.iter().take(8).map(|peer| *peer.id()).collect();
        let siblings: Vec<Id> = table.siblings().peers().iter().map(|p| *p.id()).collect();

        assert_eq!(siblings, expected);
    }

    #[test]
    fn removed_sibling_is_replaced_by_the_next_closest() {
        let local_id = Id::random();
        let mut table = RoutingTable::with_sizes(local_id, 4, 4, 2);

        let mut peers: Vec<Peer> = (0..50).map(|_| random_peer()).collect();
        for peer in &peers {
            table.add_or_update(peer.clone());
        }
        peers.sort_by_key(|peer| peer.id().xor(&local_id));

        let closest = *peers[0].id();
        table.remove(&closest);

        let siblings: Vec<Id> = table.siblings().peers().iter().map(|p| *p.id()).collect();
        let expected: Vec<Id> = peers[1..5].iter().map(|peer| *peer.id()).collect();

        assert_eq!(siblings, expected);
        assert!(!table.contains(&closest));
    }

    #[test]
    fn closest_peers_are_sorted_by_distance() {
        let mut table = RoutingTable::new(Id::random());

        for _ in 0..500 {
            table.add_or_update(random_peer());
        }

        let target = Id::random();
        let closest = table.closest_peers(&target, 20);

        assert_eq!(closest.len(), 20);
        for pair in closest.windows(2) {
            assert!(pair[0].id().xor(&target) < pair[1].id().xor(&target));
        }

        let all_closer = table
            .iter()
            .filter(|peer| peer.id().xor(&target) < closest[19].id().xor(&target))
            .count();
        assert_eq!(all_closer, 19);
    }

    #[test]
    fn full_bucket_far_from_local_id_uses_the_replacement_cache() {
        // Local Id in the lower half, all peers in the upper half.
        let mut table = RoutingTable::with_sizes(nibble(0), 2, 0, 1);

        table.add_or_update(peer_at(nibble(8)));
        table.add_or_update(peer_at(nibble(12)));
        // Splits into [0,8) [8,12) [12,16), then fills [8,12).
        table.add_or_update(peer_at(nibble(9)));
        assert!(!table.add_or_update(peer_at(nibble(10))));

        let index = table.bucket_index(&nibble(10));
        let bucket = &table.buckets()[index];
        assert_eq!(bucket.depth(), 2);
        assert_eq!(bucket.len(), 2);
        assert_eq!(bucket.replacement_cache().count(), 1);
        assert!(!table.contains(&nibble(10)));
        assert_partition(&table);
    }

    #[test]
    fn split_resplits_when_all_peers_share_a_half() {
        let mut table = RoutingTable::with_sizes(nibble(0), 2, 0, 1);

        table.add_or_update(peer_at(nibble(1)));
        table.add_or_update(peer_at(nibble(2)));
        table.add_or_update(peer_at(nibble(3)));

        let buckets = table.buckets();
        let layout: Vec<(u8, usize)> = buckets
            .iter()
            .map(|bucket| (bucket.range().start().as_bytes()[0] >> 4, bucket.len()))
            .collect();

        // [0,2) {1}, [2,4) {2,3}, [4,8) {}, [8,16) {}
        assert_eq!(layout, vec![(0, 1), (2, 2), (4, 0), (8, 0)]);
        assert_eq!(buckets[0].depth(), 3);
        assert_eq!(buckets[1].depth(), 3);
        assert_eq!(buckets[2].depth(), 2);
        assert_eq!(buckets[3].depth(), 1);
        assert_partition(&table);
    }

    #[test]
    fn locked_peers_are_skipped_but_kept() {
        let mut table = RoutingTable::new(Id::random());

        let peer = random_peer();
        let id = *peer.id();
        table.add_or_update(peer.clone());

        for _ in 0..LOCK_THRESHOLD {
            assert!(table.no_response(&id));
        }

        assert!(table.get(&id).unwrap().is_locked());
        assert!(table.closest_peers(&id, 20).is_empty());
        assert_eq!(table.size(), 1);
        assert_eq!(table.unlocked_size(), 0);

        // Hearing from it again unlocks it.
        table.add_or_update(Peer::responded(peer.address().clone()));
        assert!(!table.get(&id).unwrap().is_locked());
        assert_eq!(table.closest_peers(&id, 20).len(), 1);
    }

    #[test]
    fn stale_buckets_are_marked_refreshed() {
        let mut table = RoutingTable::new(Id::random());
        for _ in 0..100 {
            table.add_or_update(random_peer());
        }

        let stale = table.stale_buckets(Duration::ZERO);
        assert_eq!(stale.len(), table.buckets().len());

        for range in &stale {
            table.mark_refreshed(range);
        }
        assert!(table.stale_buckets(Duration::from_secs(60)).is_empty());
    }
}
