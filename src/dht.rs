//! Dht node.

use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::common::{
    verify_authorization, Id, ItemType, Peer, PeerAddress, RequestSpecific, ResponseSpecific,
    StorableItem,
};
use crate::peer_file;
use crate::replication::{self, ReplicationReport};
use crate::rpc::{Config, Info, NetworkStatus, Reply, RequestBatch, Rpc, RpcParts};
use crate::shutdown::{self, ShutdownTrigger};
use crate::storage::{StorageHandler, StorageRegistry};
use crate::transport::{PeerFilter, PeerSource, Transport};
use crate::{Error, Result};

#[derive(Debug, Clone)]
/// Kademlia DHT node handle.
///
/// Cheap to clone. Dropping the last handle stops the background tasks.
pub struct Dht(Arc<DhtInner>);

#[derive(Debug)]
struct DhtInner {
    rpc: Arc<Rpc>,
    trigger: ShutdownTrigger,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for DhtInner {
    fn drop(&mut self) {
        self.trigger.trigger();
    }
}

#[derive(Debug)]
/// Create a [Dht] with custom settings and capabilities.
pub struct DhtBuilder {
    address: PeerAddress,
    config: Config,
    transport: Option<Arc<dyn Transport>>,
    storage: StorageRegistry,
    filter: Option<Arc<dyn PeerFilter>>,
    peer_source: Option<Arc<dyn PeerSource>>,
}

impl DhtBuilder {
    /// Replace the whole [Config].
    pub fn config(&mut self, config: Config) -> &mut Self {
        self.config = config;
        self
    }

    /// Set the k-bucket capacity, lookup result size and replication factor.
    pub fn k(&mut self, k: usize) -> &mut Self {
        self.config.k = k;
        self
    }

    /// Set the sibling bucket capacity.
    pub fn s(&mut self, s: usize) -> &mut Self {
        self.config.s = s;
        self
    }

    /// Set the lookup concurrency.
    pub fn alpha(&mut self, alpha: usize) -> &mut Self {
        self.config.alpha = alpha;
        self
    }

    /// Set the split granularity of buckets away from the local Id.
    pub fn b(&mut self, b: u16) -> &mut Self {
        self.config.b = b;
        self
    }

    pub fn request_timeout(&mut self, request_timeout: Duration) -> &mut Self {
        self.config.request_timeout = request_timeout;
        self
    }

    pub fn lookup_timeout(&mut self, lookup_timeout: Duration) -> &mut Self {
        self.config.lookup_timeout = lookup_timeout;
        self
    }

    pub fn response_timeout(&mut self, response_timeout: Duration) -> &mut Self {
        self.config.response_timeout = response_timeout;
        self
    }

    pub fn bucket_refresh_interval(&mut self, interval: Duration) -> &mut Self {
        self.config.bucket_refresh_interval = interval;
        self
    }

    pub fn maintenance_interval(&mut self, interval: Duration) -> &mut Self {
        self.config.maintenance_interval = interval;
        self
    }

    pub fn bootstrap_retry_interval(&mut self, interval: Duration) -> &mut Self {
        self.config.bootstrap_retry_interval = interval;
        self
    }

    pub fn replication_interval(&mut self, interval: Duration) -> &mut Self {
        self.config.replication_interval = interval;
        self
    }

    pub fn replication_jitter(&mut self, jitter: Duration) -> &mut Self {
        self.config.replication_jitter = jitter;
        self
    }

    pub fn replication_wait(&mut self, wait: Duration) -> &mut Self {
        self.config.replication_wait = wait;
        self
    }

    /// Set bootstrapping peers.
    pub fn bootstrap(&mut self, bootstrap: &[PeerAddress]) -> &mut Self {
        self.config.bootstrap = bootstrap.to_vec();
        self
    }

    /// Read extra bootstrapping peers from this file, and persist the routing table to it
    /// on shutdown.
    pub fn peer_file<P: Into<PathBuf>>(&mut self, path: P) -> &mut Self {
        self.config.peer_file = Some(path.into());
        self
    }

    /// Set the transport carrying packets to other peers.
    pub fn transport(&mut self, transport: Arc<dyn Transport>) -> &mut Self {
        self.transport = Some(transport);
        self
    }

    /// Register the storage handler of an item type.
    pub fn storage(&mut self, item_type: ItemType, handler: Arc<dyn StorageHandler>) -> &mut Self {
        self.storage.register(item_type, handler);
        self
    }

    pub fn peer_source(&mut self, peer_source: Arc<dyn PeerSource>) -> &mut Self {
        self.peer_source = Some(peer_source);
        self
    }

    pub fn peer_filter(&mut self, filter: Arc<dyn PeerFilter>) -> &mut Self {
        self.filter = Some(filter);
        self
    }

    /// Create a node, call [Dht::start] to begin bootstrapping.
    pub fn build(&self) -> Result<Dht> {
        let transport = self.transport.clone().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "no transport configured")
        })?;

        let extra_seeds = match &self.config.peer_file {
            Some(path) => peer_file::read(path).unwrap_or_else(|error| {
                warn!(?error, ?path, "Failed to read peer file");
                Vec::new()
            }),
            None => Vec::new(),
        };

        let (trigger, shutdown) = shutdown::channel();

        let rpc = Rpc::new(RpcParts {
            config: self.config.clone(),
            address: self.address.clone(),
            transport,
            storage: self.storage.clone(),
            filter: self.filter.clone(),
            peer_source: self.peer_source.clone(),
            extra_seeds,
            shutdown,
        });

        Ok(Dht(Arc::new(DhtInner {
            rpc: Arc::new(rpc),
            trigger,
            threads: Mutex::new(Vec::new()),
        })))
    }
}

impl Dht {
    /// Returns a builder for a node reachable at `address`.
    pub fn builder(address: PeerAddress) -> DhtBuilder {
        DhtBuilder {
            address,
            config: Config::default(),
            transport: None,
            storage: StorageRegistry::new(),
            filter: None,
            peer_source: None,
        }
    }

    // === Getters ===

    /// This node's [Id], the hash of its address.
    pub fn id(&self) -> &Id {
        self.rpc().id()
    }

    pub fn address(&self) -> &PeerAddress {
        self.rpc().address()
    }

    /// Information and statistics about this node.
    pub fn info(&self) -> Info {
        Info::from(self.rpc())
    }

    pub fn status(&self) -> NetworkStatus {
        self.rpc().status()
    }

    pub fn is_ready(&self) -> bool {
        self.status() == NetworkStatus::Ready
    }

    /// Snapshot of the routing table.
    pub fn peers(&self) -> Vec<Peer> {
        self.rpc().routing_table().to_owned_peers()
    }

    // === Lifecycle ===

    /// Spawn the main loop, which bootstraps and then maintains the routing table,
    /// and the replication loop.
    pub fn start(&self) -> Result<()> {
        let rpc = self.rpc();

        if rpc.shutdown().is_triggered() {
            return Err(Error::Shutdown);
        }

        if rpc.status() != NetworkStatus::NotStarted {
            return Ok(());
        }

        rpc.set_status(NetworkStatus::Bootstrapping);

        let spawned = spawn("maildht-main", self.0.rpc.clone(), run_main_loop).and_then(|main| {
            let replication =
                spawn("maildht-replication", self.0.rpc.clone(), replication::run)?;

            Ok([main, replication])
        });

        match spawned {
            Ok(handles) => {
                self.threads().extend(handles);
                Ok(())
            }
            Err(error) => {
                rpc.set_status(NetworkStatus::Error(error.to_string()));
                self.0.trigger.trigger();
                Err(error.into())
            }
        }
    }

    /// Block until the node is bootstrapped, returns false if it failed or shut down.
    pub fn bootstrapped(&self) -> bool {
        self.rpc().wait_until_ready()
    }

    /// Stop every background task, wait for them to finish and persist the peer file.
    pub fn shutdown(&self) {
        self.0.trigger.trigger();

        let handles: Vec<JoinHandle<()>> = self.threads().drain(..).collect();

        if handles.is_empty() {
            persist_peers(self.rpc());
        }

        for handle in handles {
            if handle.join().is_err() {
                warn!("Dht thread panicked");
            }
        }
    }

    // === Network ===

    /// Pass an inbound packet from the transport.
    pub fn handle_packet(&self, packet: &[u8], from: PeerAddress, received_at: Instant) {
        self.rpc().handle_packet(packet, from, received_at)
    }

    /// Add a peer to the routing table and to the bootstrap candidates.
    pub fn add_peer(&self, address: PeerAddress) {
        let rpc = self.rpc();

        if &address == rpc.address() || rpc.is_banned(&address) {
            return;
        }

        rpc.routing_table_mut()
            .add_or_update(Peer::new(address.clone()));
        rpc.add_seed(address);
    }

    /// Remove a peer from the routing table and drop its packets from now on.
    pub fn ban(&self, address: &PeerAddress) {
        self.rpc().ban(address)
    }

    /// Run one bootstrap round, returns true if any peer responded.
    pub fn bootstrap(&self) -> bool {
        bootstrap_round(self.rpc())
    }

    /// Run one replication cycle now.
    pub fn replicate(&self) -> Result<ReplicationReport> {
        self.check_running()?;

        Ok(replication::replicate(self.rpc()))
    }

    // === Dht operations ===

    /// Find the peers closest to `key`, closest first.
    pub fn find_close_peers(&self, key: Id) -> Result<Vec<PeerAddress>> {
        self.check_running()?;

        let closest = self.rpc().lookup(key);
        self.check_running()?;

        Ok(closest)
    }

    /// Store an item on the peers closest to its key, and locally if this node is one of them.
    ///
    /// Returns once the store requests are sent, the targets are not waited for.
    /// A local storage error is returned after the remote requests went out.
    pub fn store(&self, item: StorableItem) -> Result<Vec<PeerAddress>> {
        let rpc = self.rpc();
        self.check_running()?;

        let key = *item.key();
        let closest = rpc.lookup(key);
        self.check_running()?;

        if closest.is_empty() {
            return Err(Error::NoStorageNodes);
        }

        // Remote copies go out first, a failing local handler must not cost them.
        let remote: Vec<PeerAddress> = closest
            .iter()
            .filter(|peer| *peer != rpc.address())
            .filter(|peer| {
                rpc.socket()
                    .send_one_way(peer, RequestSpecific::Store(item.clone()))
            })
            .cloned()
            .collect();

        let mut targets = Vec::with_capacity(remote.len() + 1);

        if self.belongs_among(&key, &closest) {
            if let Some(handler) = rpc.storage().get(item.item_type()) {
                let item_type = item.item_type();

                if let Err(error) = handler.store(item) {
                    debug!(?key, ?error, remote = remote.len(), "Failed to store item locally");
                    return Err(error.into());
                }

                rpc.mark_recently_stored(item_type, key);
                targets.push(rpc.address().clone());
            }
        }

        targets.extend(remote);

        debug!(?key, targets = targets.len(), "Stored item");

        Ok(targets)
    }

    /// Find an item, locally or from the peers closest to its key.
    ///
    /// Unless `exhaustive`, a local copy is returned without asking anyone, otherwise
    /// the first valid response is. With `exhaustive` every distinct copy found before
    /// the response timeout is returned, the local one included.
    pub fn find(&self, key: Id, item_type: ItemType, exhaustive: bool) -> Result<DhtResults> {
        let rpc = self.rpc();
        self.check_running()?;

        let mut results = DhtResults::default();

        if let Some(handler) = rpc.storage().get(item_type) {
            if let Some(item) = handler.retrieve(&key)? {
                results.push(None, item);

                if !exhaustive {
                    return Ok(results);
                }
            }
        }

        let peers: Vec<PeerAddress> = rpc
            .lookup(key)
            .into_iter()
            .filter(|peer| peer != rpc.address())
            .collect();
        self.check_running()?;

        let mut batch = RequestBatch::new(rpc.socket());
        for peer in &peers {
            batch.send(peer, RequestSpecific::Retrieve { key, item_type });
        }

        let is_valid = |reply: &Reply| {
            matches!(
                &reply.response,
                Ok(ResponseSpecific::Item(Some(item)))
                    if item.key() == &key && item.item_type() == item_type
            )
        };

        let timeout = rpc.config().response_timeout;

        if exhaustive {
            for reply in batch.await_all(timeout, rpc.shutdown()) {
                if !is_valid(&reply) {
                    if reply.response.is_err() {
                        rpc.no_response(&reply.from);
                    }
                    continue;
                }

                if let Ok(ResponseSpecific::Item(Some(item))) = reply.response {
                    results.push(Some(reply.from), item);
                }
            }

            for peer in batch.into_unanswered() {
                rpc.no_response(&peer);
            }
        } else if let Some(reply) = batch.await_first(timeout, rpc.shutdown(), is_valid) {
            if let Ok(ResponseSpecific::Item(Some(item))) = reply.response {
                results.push(Some(reply.from), item);
            }
        }

        debug!(?key, ?item_type, found = results.len(), "Find done");

        Ok(results)
    }

    /// Returns the first copy of an item found.
    pub fn find_one(&self, key: Id, item_type: ItemType) -> Result<Option<StorableItem>> {
        Ok(self.find(key, item_type, false)?.into_items().into_iter().next())
    }

    /// Returns every distinct copy of an item found.
    pub fn find_all(&self, key: Id, item_type: ItemType) -> Result<Vec<StorableItem>> {
        Ok(self.find(key, item_type, true)?.into_items())
    }

    /// Find the authorization that deleted `key`, accepting only one whose SHA-256 is
    /// `verification_hash`.
    pub fn find_delete_authorization(
        &self,
        key: Id,
        verification_hash: &Id,
    ) -> Result<Option<Bytes>> {
        let rpc = self.rpc();
        self.check_running()?;

        for (_, handler) in rpc.storage().iter() {
            if let Some(authorization) = handler.delete_authorization(&key)? {
                if verify_authorization(&authorization, verification_hash) {
                    return Ok(Some(authorization));
                }
            }
        }

        let peers: Vec<PeerAddress> = rpc
            .lookup(key)
            .into_iter()
            .filter(|peer| peer != rpc.address())
            .collect();
        self.check_running()?;

        let mut batch = RequestBatch::new(rpc.socket());
        for peer in &peers {
            batch.send(peer, RequestSpecific::DeletionQuery { key });
        }

        let reply = batch.await_first(rpc.config().response_timeout, rpc.shutdown(), |reply| {
            matches!(
                &reply.response,
                Ok(ResponseSpecific::DeletionInfo { key: answered, authorization: Some(authorization) })
                    if answered == &key && verify_authorization(authorization, verification_hash)
            )
        });

        Ok(match reply.map(|reply| reply.response) {
            Some(Ok(ResponseSpecific::DeletionInfo { authorization, .. })) => authorization,
            _ => None,
        })
    }

    // === Private Methods ===

    fn rpc(&self) -> &Rpc {
        &self.0.rpc
    }

    fn threads(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.0
            .threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn check_running(&self) -> Result<()> {
        if self.rpc().shutdown().is_triggered() {
            return Err(Error::Shutdown);
        }

        Ok(())
    }

    /// True if the local node is, or is close enough to be, one of the closest peers.
    fn belongs_among(&self, key: &Id, closest: &[PeerAddress]) -> bool {
        let rpc = self.rpc();

        if closest.iter().any(|peer| peer == rpc.address()) || closest.len() < rpc.config().k {
            return true;
        }

        closest
            .last()
            .map(|farthest| rpc.id().xor(key) < farthest.id().xor(key))
            .unwrap_or(true)
    }
}

#[derive(Debug, Clone, Default)]
/// Copies of an item returned by [Dht::find].
pub struct DhtResults {
    results: Vec<(Option<PeerAddress>, StorableItem)>,
}

impl DhtResults {
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Items with the peer they came from, `None` for the local copy.
    pub fn iter(&self) -> impl Iterator<Item = (Option<&PeerAddress>, &StorableItem)> {
        self.results.iter().map(|(from, item)| (from.as_ref(), item))
    }

    pub fn into_items(self) -> Vec<StorableItem> {
        self.results.into_iter().map(|(_, item)| item).collect()
    }

    /// Keep distinct payloads only.
    fn push(&mut self, from: Option<PeerAddress>, item: StorableItem) {
        if self
            .results
            .iter()
            .any(|(_, existing)| existing.payload() == item.payload())
        {
            return;
        }

        self.results.push((from, item));
    }
}

// === Background tasks ===

fn spawn(name: &str, rpc: Arc<Rpc>, task: fn(&Rpc)) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || task(&rpc))
}

fn run_main_loop(rpc: &Rpc) {
    if bootstrap(rpc) {
        while !rpc.shutdown().sleep(rpc.config().maintenance_interval) {
            maintain(rpc);
        }
    }

    debug!(id = %rpc.id(), "Dht main loop stopped");

    persist_peers(rpc);
}

/// Run bootstrap rounds until one succeeds, then refresh every bucket.
///
/// Returns false if shut down first.
fn bootstrap(rpc: &Rpc) -> bool {
    rpc.set_status(NetworkStatus::Bootstrapping);

    loop {
        if bootstrap_round(rpc) {
            refresh(rpc, Duration::ZERO);
            rpc.set_status(NetworkStatus::Ready);

            return true;
        }

        if rpc.shutdown().is_triggered() {
            return false;
        }

        let retry = rpc.config().bootstrap_retry_interval;
        warn!(?retry, "No bootstrap peer responded");

        if rpc.shutdown().sleep(retry) {
            return false;
        }
    }
}

/// Look up the local Id through known peers, then through each seed until one responds.
fn bootstrap_round(rpc: &Rpc) -> bool {
    let responded = |rpc: &Rpc| {
        rpc.lookup(*rpc.id())
            .iter()
            .any(|peer| peer != rpc.address())
    };

    let known = rpc.routing_table().unlocked_size();

    if known > 0 && responded(rpc) {
        return true;
    }

    for seed in rpc.seeds() {
        if rpc.shutdown().is_triggered() {
            return false;
        }

        debug!(?seed, "Bootstrapping");

        // A fresh record unlocks a seed that timed out before.
        rpc.routing_table_mut().add_or_update(Peer::new(seed));

        if responded(rpc) {
            return true;
        }
    }

    false
}

fn maintain(rpc: &Rpc) {
    let known = rpc.routing_table().unlocked_size();

    if known == 0 {
        info!("Lost every peer, bootstrapping again");
        bootstrap(rpc);

        return;
    }

    refresh(rpc, rpc.config().bucket_refresh_interval);
}

/// Look up a random key in every bucket and sibling section not refreshed within `interval`.
fn refresh(rpc: &Rpc, interval: Duration) {
    let stale_buckets = rpc.routing_table().stale_buckets(interval);

    for range in stale_buckets {
        if rpc.shutdown().is_triggered() {
            return;
        }

        rpc.lookup(range.random_id());
        rpc.routing_table_mut().mark_refreshed(&range);
    }

    let stale_sections = rpc.routing_table().stale_sibling_sections(interval);

    for index in stale_sections {
        if rpc.shutdown().is_triggered() {
            return;
        }

        let target = rpc.routing_table().sibling_section_target(index);

        if let Some(target) = target {
            rpc.lookup(target);
        }

        rpc.routing_table_mut().mark_sibling_section_refreshed(index);
    }
}

fn persist_peers(rpc: &Rpc) {
    let Some(path) = &rpc.config().peer_file else {
        return;
    };

    let peers = rpc.routing_table().to_owned_peers();

    match peer_file::write(path, &peers) {
        Ok(()) => info!(peers = peers.len(), ?path, "Persisted peers"),
        Err(error) => warn!(?error, ?path, "Failed to persist peers"),
    }
}
