//! K-buckets and the S/Kademlia sibling bucket.
use std::collections::VecDeque;
use std::fmt::{self, Debug, Formatter};
use std::time::{Duration, Instant};

use rand::Rng;

use crate::common::{Id, KeyRange, Peer, ID_BITS};

/// Kbuckets hold the peers whose Ids fall in one [KeyRange], most recently
/// responsive first and locked peers at the tail.
///
/// Candidates arriving while the bucket is full and can't be split are kept in a
/// bounded replacement cache (most recent first).
#[derive(Clone)]
pub struct KBucket {
    range: KeyRange,
    capacity: usize,
    peers: Vec<Peer>,
    replacement_cache: VecDeque<Peer>,
    last_refreshed: Instant,
}

impl KBucket {
    pub fn new(range: KeyRange, capacity: usize) -> Self {
        KBucket {
            range,
            capacity,
            peers: Vec::with_capacity(capacity),
            replacement_cache: VecDeque::with_capacity(capacity),
            last_refreshed: Instant::now(),
        }
    }

    // === Getters ===

    pub fn range(&self) -> &KeyRange {
        &self.range
    }

    pub fn depth(&self) -> u16 {
        self.range.depth()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    pub fn replacement_cache(&self) -> impl Iterator<Item = &Peer> {
        self.replacement_cache.iter()
    }

    pub fn last_refreshed(&self) -> Instant {
        self.last_refreshed
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.peers.len() >= self.capacity
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.peers.iter().any(|peer| peer.id() == id)
    }

    pub fn get(&self, id: &Id) -> Option<&Peer> {
        self.peers.iter().find(|peer| peer.id() == id)
    }

    /// A bucket may split if its depth is not a multiple of `b`, or if it covers
    /// the local Id, so the table only grows deep around our own neighborhood.
    pub fn can_split(&self, local_id: &Id, b: u16) -> bool {
        if self.depth() >= ID_BITS {
            return false;
        }

        self.depth() % b.max(1) != 0 || self.range.contains(local_id)
    }

    // === Public Methods ===

    /// Refresh an existing peer and move it to the most-recently-seen position.
    ///
    /// Returns false if the peer is not in this bucket.
    pub(crate) fn update(&mut self, incoming: &Peer) -> bool {
        match self.peers.iter().position(|peer| peer.id() == incoming.id()) {
            Some(index) => {
                let mut existing = self.peers.remove(index);
                existing.refresh(incoming);
                self.peers.insert(0, existing);
                self.sort_locked_last();

                true
            }
            None => false,
        }
    }

    /// Append a new peer, the caller checks [Self::is_full] first.
    pub(crate) fn push(&mut self, peer: Peer) {
        self.remove_from_cache(peer.id());
        self.peers.push(peer);
        self.sort_locked_last();
    }

    pub(crate) fn remove(&mut self, id: &Id) -> Option<Peer> {
        self.remove_from_cache(id);

        self.peers
            .iter()
            .position(|peer| peer.id() == id)
            .map(|index| self.peers.remove(index))
    }

    /// Returns false if the peer is not in this bucket.
    pub(crate) fn no_response(&mut self, id: &Id) -> bool {
        match self.peers.iter_mut().find(|peer| peer.id() == id) {
            Some(peer) => {
                peer.no_response();
                self.sort_locked_last();
                true
            }
            None => false,
        }
    }

    // TODO: promote cached peers once the bucket has room again.
    pub(crate) fn add_to_replacement_cache(&mut self, peer: Peer) {
        self.remove_from_cache(peer.id());
        self.replacement_cache.push_front(peer);
        self.replacement_cache.truncate(self.capacity);
    }

    pub(crate) fn mark_refreshed(&mut self) {
        self.last_refreshed = Instant::now();
    }

    pub(crate) fn is_stale(&self, interval: Duration) -> bool {
        self.last_refreshed.elapsed() >= interval
    }

    /// Split into the lower and upper halves of this bucket's range, keeping the order
    /// of peers and cached candidates. Returns `None` if the range can't get any narrower.
    pub(crate) fn split(self) -> Option<(KBucket, KBucket)> {
        let (lower_range, upper_range) = self.range.split()?;

        let mut lower = KBucket::new(lower_range, self.capacity);
        let mut upper = KBucket::new(upper_range, self.capacity);
        lower.last_refreshed = self.last_refreshed;
        upper.last_refreshed = self.last_refreshed;

        for peer in self.peers {
            if lower_range.contains(peer.id()) {
                lower.peers.push(peer);
            } else {
                upper.peers.push(peer);
            }
        }

        for peer in self.replacement_cache {
            if lower_range.contains(peer.id()) {
                lower.replacement_cache.push_back(peer);
            } else {
                upper.replacement_cache.push_back(peer);
            }
        }

        Some((lower, upper))
    }

    // === Private Methods ===

    fn remove_from_cache(&mut self, id: &Id) {
        self.replacement_cache.retain(|peer| peer.id() != id);
    }

    fn sort_locked_last(&mut self) {
        // Stable, so the recency order is kept within each group.
        self.peers.sort_by_key(|peer| peer.is_locked());
    }
}

impl Debug for KBucket {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "KBucket{{ range: {:?}, depth: {}, peers: {}, cached: {} }}",
            self.range,
            self.depth(),
            self.peers.len(),
            self.replacement_cache.len()
        )
    }
}

#[derive(Debug)]
pub(crate) enum SiblingOffer {
    /// The peer was already a sibling and got refreshed.
    Updated,
    /// The peer became a sibling, possibly pushing out the farthest one.
    Accepted { evicted: Option<Peer> },
    /// Too far from the local Id while the bucket is full.
    Rejected(Peer),
}

/// The `S` peers closest to the local Id, sorted by ascending XOR distance.
///
/// Unlike k-buckets it has no fixed range. For refreshing, the part of the key space
/// it covers is divided into `ceil(S / K)` sections, each refreshed on its own schedule.
#[derive(Clone)]
pub struct SiblingBucket {
    local_id: Id,
    capacity: usize,
    peers: Vec<Peer>,
    sections_refreshed: Vec<Instant>,
}

impl SiblingBucket {
    pub fn new(local_id: Id, capacity: usize, k: usize) -> Self {
        let sections = capacity.div_ceil(k.max(1)).max(1);

        SiblingBucket {
            local_id,
            capacity,
            peers: Vec::with_capacity(capacity),
            sections_refreshed: vec![Instant::now(); sections],
        }
    }

    // === Getters ===

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.peers.len() >= self.capacity
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.peers.iter().any(|peer| peer.id() == id)
    }

    pub fn get(&self, id: &Id) -> Option<&Peer> {
        self.peers.iter().find(|peer| peer.id() == id)
    }

    /// Number of refresh sections.
    pub fn sections(&self) -> usize {
        self.sections_refreshed.len()
    }

    // === Public Methods ===

    pub(crate) fn offer(&mut self, incoming: Peer) -> SiblingOffer {
        if let Some(existing) = self.peers.iter_mut().find(|p| p.id() == incoming.id()) {
            existing.refresh(&incoming);
            return SiblingOffer::Updated;
        }

        if self.capacity == 0 {
            return SiblingOffer::Rejected(incoming);
        }

        if !self.is_full() {
            self.insert(incoming);
            return SiblingOffer::Accepted { evicted: None };
        }

        let distance = incoming.id().xor(&self.local_id);

        match self.farthest_distance() {
            Some(farthest) if distance < farthest => {
                self.insert(incoming);
                let evicted = self.peers.pop();

                SiblingOffer::Accepted { evicted }
            }
            _ => SiblingOffer::Rejected(incoming),
        }
    }

    /// Insert at the position matching the peer's distance, ignoring capacity.
    pub(crate) fn insert(&mut self, peer: Peer) {
        let distance = peer.id().xor(&self.local_id);
        let index = self
            .peers
            .partition_point(|p| p.id().xor(&self.local_id) < distance);

        self.peers.insert(index, peer);
    }

    pub(crate) fn remove(&mut self, id: &Id) -> Option<Peer> {
        self.peers
            .iter()
            .position(|peer| peer.id() == id)
            .map(|index| self.peers.remove(index))
    }

    pub(crate) fn no_response(&mut self, id: &Id) -> bool {
        match self.peers.iter_mut().find(|peer| peer.id() == id) {
            Some(peer) => {
                peer.no_response();
                true
            }
            None => false,
        }
    }

    pub(crate) fn stale_sections(&self, interval: Duration) -> Vec<usize> {
        self.sections_refreshed
            .iter()
            .enumerate()
            .filter(|(_, refreshed)| refreshed.elapsed() >= interval)
            .map(|(index, _)| index)
            .collect()
    }

    pub(crate) fn mark_section_refreshed(&mut self, index: usize) {
        if let Some(refreshed) = self.sections_refreshed.get_mut(index) {
            *refreshed = Instant::now();
        }
    }

    /// A random key in the given section of the sibling range.
    ///
    /// Sections split the XOR distance between the local Id and the farthest sibling
    /// into equal parts, measured on the most significant 128 bits.
    pub(crate) fn section_target(&self, index: usize) -> Option<Id> {
        let farthest = self.farthest_distance()?.high_u128();
        let sections = self.sections() as u128;
        let index = index as u128;

        if index >= sections {
            return None;
        }

        let width = farthest / sections;
        let low = width * index;
        let high = if index + 1 == sections {
            farthest
        } else {
            low + width
        };

        let distance = rand::thread_rng().gen_range(low..=high);

        Some(self.local_id.xor(&Id::from_high_u128(distance)))
    }

    // === Private Methods ===

    fn farthest_distance(&self) -> Option<Id> {
        self.peers.last().map(|peer| peer.id().xor(&self.local_id))
    }
}

impl Debug for SiblingBucket {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SiblingBucket{{ peers: {}, capacity: {} }}",
            self.peers.len(),
            self.capacity
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::PeerAddress;

    fn peer(name: &str) -> Peer {
        Peer::new(PeerAddress::new(name.as_bytes().to_vec()))
    }

    #[test]
    fn update_moves_peer_to_front() {
        let mut bucket = KBucket::new(KeyRange::full(), 3);

        let a = peer("a");
        bucket.push(a.clone());
        bucket.push(peer("b"));
        bucket.push(peer("c"));

        assert_eq!(bucket.peers()[0].id(), a.id());
        bucket.update(&peer("c"));
        assert_eq!(bucket.peers()[0].id(), peer("c").id());
        assert!(!bucket.update(&peer("d")));
    }

    #[test]
    fn locked_peers_go_to_the_tail() {
        let mut bucket = KBucket::new(KeyRange::full(), 3);

        let a = peer("a");
        bucket.push(a.clone());
        bucket.push(peer("b"));

        for _ in 0..crate::common::LOCK_THRESHOLD {
            bucket.no_response(a.id());
        }

        assert_eq!(bucket.peers().last().unwrap().id(), a.id());
        assert!(bucket.peers().last().unwrap().is_locked());
    }

    #[test]
    fn replacement_cache_is_bounded_and_most_recent_first() {
        let mut bucket = KBucket::new(KeyRange::full(), 2);

        bucket.add_to_replacement_cache(peer("a"));
        bucket.add_to_replacement_cache(peer("b"));
        bucket.add_to_replacement_cache(peer("c"));

        let cached: Vec<Id> = bucket.replacement_cache().map(|p| *p.id()).collect();
        assert_eq!(cached, vec![*peer("c").id(), *peer("b").id()]);
    }

    #[test]
    fn split_distributes_by_range() {
        let mut bucket = KBucket::new(KeyRange::full(), 20);
        for i in 0..20 {
            bucket.push(peer(&i.to_string()));
        }

        let (lower, upper) = bucket.split().unwrap();

        assert_eq!(lower.len() + upper.len(), 20);
        assert!(lower.peers().iter().all(|p| lower.range().contains(p.id())));
        assert!(upper.peers().iter().all(|p| upper.range().contains(p.id())));
    }

    #[test]
    fn sibling_bucket_keeps_the_closest() {
        let local_id = Id::random();
        let mut siblings = SiblingBucket::new(local_id, 3, 2);

        let mut all: Vec<Peer> = (0..10).map(|i| peer(&format!("peer-{i}"))).collect();

        for p in all.iter() {
            let _ = siblings.offer(p.clone());
        }

        all.sort_by_key(|p| p.id().xor(&local_id));

        let expected: Vec<Id> = all.iter().take(3).map(|p| *p.id()).collect();
        let actual: Vec<Id> = siblings.peers().iter().map(|p| *p.id()).collect();

        assert_eq!(actual, expected);
        assert_eq!(siblings.sections(), 2);
    }

    #[test]
    fn section_targets_stay_within_the_sibling_range() {
        let local_id = Id::random();
        let mut siblings = SiblingBucket::new(local_id, 4, 2);

        assert!(siblings.section_target(0).is_none());

        for i in 0..4 {
            let _ = siblings.offer(peer(&format!("peer-{i}")));
        }

        let farthest = siblings.farthest_distance().unwrap().high_u128();

        for index in 0..siblings.sections() {
            let target = siblings.section_target(index).unwrap();
            assert!(target.xor(&local_id).high_u128() <= farthest);
        }
        assert!(siblings.section_target(siblings.sections()).is_none());
    }
}
