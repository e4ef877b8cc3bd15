//! DHT RPC: state shared by the coordinator, the replication loop, every lookup
//! and inbound request handling.

mod batch;
mod closest_peers;
mod config;
mod info;
mod lookup;
mod server;
mod socket;

use std::collections::HashSet;
use std::fmt::{self, Display, Formatter};
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};
use std::time::Instant;

use flume::{Selector, Sender};
use tracing::{error, info, trace};

use crate::common::{
    ErrorSpecific, Id, ItemType, Message, MessageType, Peer, PeerAddress, RoutingTable,
};
use crate::shutdown::Shutdown;
use crate::storage::StorageRegistry;
use crate::transport::{PeerFilter, PeerSource, Transport};

pub(crate) use batch::RequestBatch;
pub use closest_peers::ClosestPeers;
pub use config::*;
pub use info::Info;
pub(crate) use lookup::Lookup;
pub use server::{
    ERROR_GENERIC, ERROR_PROTOCOL, ERROR_SERVER, ERROR_UNKNOWN_ITEM_TYPE,
};
pub(crate) use socket::{Reply, RpcSocket};

#[derive(Debug, Clone, PartialEq, Eq)]
/// Where the node is in its lifecycle.
pub enum NetworkStatus {
    /// Built, background tasks not started yet.
    NotStarted,
    /// Looking for responsive peers, also re-entered when every known peer is lost.
    Bootstrapping,
    Ready,
    /// Unrecoverable local setup error.
    Error(String),
}

impl Display for NetworkStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            NetworkStatus::NotStarted => write!(f, "not started"),
            NetworkStatus::Bootstrapping => write!(f, "bootstrapping"),
            NetworkStatus::Ready => write!(f, "ready"),
            NetworkStatus::Error(error) => write!(f, "error: {error}"),
        }
    }
}

#[derive(Debug)]
pub(crate) struct Rpc {
    config: Config,
    address: PeerAddress,
    routing_table: RwLock<RoutingTable>,
    socket: RpcSocket,
    storage: StorageRegistry,
    status: RwLock<NetworkStatus>,
    status_watchers: Mutex<Vec<Sender<NetworkStatus>>>,
    filter: Option<Arc<dyn PeerFilter>>,
    peer_source: Option<Arc<dyn PeerSource>>,
    banned: RwLock<HashSet<Id>>,
    /// Peers from the peer file and added explicitly, tried alongside the bootstrap list.
    extra_seeds: Mutex<Vec<PeerAddress>>,
    /// Items stored by other peers since the last replication cycle.
    recently_stored: Mutex<HashSet<(ItemType, Id)>>,
    shutdown: Shutdown,
}

pub(crate) struct RpcParts {
    pub config: Config,
    pub address: PeerAddress,
    pub transport: Arc<dyn Transport>,
    pub storage: StorageRegistry,
    pub filter: Option<Arc<dyn PeerFilter>>,
    pub peer_source: Option<Arc<dyn PeerSource>>,
    pub extra_seeds: Vec<PeerAddress>,
    pub shutdown: Shutdown,
}

impl Rpc {
    pub fn new(parts: RpcParts) -> Self {
        let RpcParts {
            config,
            address,
            transport,
            storage,
            filter,
            peer_source,
            extra_seeds,
            shutdown,
        } = parts;

        let routing_table =
            RoutingTable::with_sizes(*address.id(), config.k, config.s, config.b);

        Rpc {
            config,
            address,
            routing_table: RwLock::new(routing_table),
            socket: RpcSocket::new(transport),
            storage,
            status: RwLock::new(NetworkStatus::NotStarted),
            status_watchers: Mutex::new(Vec::new()),
            filter,
            peer_source,
            banned: RwLock::new(HashSet::new()),
            extra_seeds: Mutex::new(extra_seeds),
            recently_stored: Mutex::new(HashSet::new()),
            shutdown,
        }
    }

    // === Getters ===

    pub fn id(&self) -> &Id {
        self.address.id()
    }

    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn socket(&self) -> &RpcSocket {
        &self.socket
    }

    pub fn storage(&self) -> &StorageRegistry {
        &self.storage
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    pub fn routing_table(&self) -> RwLockReadGuard<'_, RoutingTable> {
        self.routing_table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn routing_table_mut(&self) -> RwLockWriteGuard<'_, RoutingTable> {
        self.routing_table
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> NetworkStatus {
        self.status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    // === Public Methods ===

    pub fn set_status(&self, status: NetworkStatus) {
        {
            let mut current = self.status.write().unwrap_or_else(PoisonError::into_inner);

            if *current == status {
                return;
            }

            match &status {
                NetworkStatus::Error(reason) => error!(?reason, "Dht failed"),
                status => info!(id = %self.id(), %status, "Network status changed"),
            }

            *current = status.clone();
        }

        if matches!(status, NetworkStatus::Ready | NetworkStatus::Error(_)) {
            for watcher in self.status_watchers().drain(..) {
                let _ = watcher.send(status.clone());
            }
        }
    }

    /// Block until the node is ready, returns false if it failed or was shut down first.
    pub fn wait_until_ready(&self) -> bool {
        let receiver = {
            let mut watchers = self.status_watchers();

            match self.status() {
                NetworkStatus::Ready => return true,
                NetworkStatus::Error(_) => return false,
                _ => {}
            }

            let (sender, receiver) = flume::bounded(1);
            watchers.push(sender);

            receiver
        };

        Selector::new()
            .recv(&receiver, |status| matches!(status, Ok(NetworkStatus::Ready)))
            .recv(self.shutdown.receiver(), |_| false)
            .wait()
    }

    pub fn is_banned(&self, peer: &PeerAddress) -> bool {
        self.banned
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(peer.id())
            || self
                .filter
                .as_ref()
                .map(|filter| filter.is_banned(peer))
                .unwrap_or(false)
    }

    /// Drop a peer from the routing table and ignore it from now on.
    pub fn ban(&self, peer: &PeerAddress) {
        self.banned
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(*peer.id());

        if self.routing_table_mut().remove(peer.id()).is_some() {
            info!(?peer, "Banned peer removed from the routing table");
        }
    }

    /// Insert or refresh a peer we just heard from.
    pub fn peer_responded(&self, peer: &PeerAddress, received_at: Instant) {
        if self.is_banned(peer) {
            return;
        }

        self.routing_table_mut()
            .add_or_update(Peer::responded_at(peer.clone(), received_at));
    }

    pub fn no_response(&self, peer: &PeerAddress) {
        self.routing_table_mut().no_response(peer.id());
    }

    pub fn closest_peers(&self, key: &Id, count: usize) -> Vec<PeerAddress> {
        self.routing_table().closest_peers(key, count)
    }

    /// Find the `k` peers closest to `target`, see [Lookup].
    pub fn lookup(&self, target: Id) -> Vec<PeerAddress> {
        Lookup::new(self, target).run()
    }

    /// Bootstrap list, peer file, explicitly added peers and the [PeerSource].
    pub fn seeds(&self) -> Vec<PeerAddress> {
        let mut seeds = self.config.bootstrap.clone();

        seeds.extend(
            self.extra_seeds
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .cloned(),
        );

        if let Some(source) = &self.peer_source {
            seeds.extend(source.peers());
        }

        let mut seen = HashSet::new();
        seeds.retain(|peer| {
            peer.id() != self.id() && !self.is_banned(peer) && seen.insert(*peer.id())
        });

        seeds
    }

    pub fn add_seed(&self, peer: PeerAddress) {
        self.extra_seeds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(peer);
    }

    pub fn mark_recently_stored(&self, item_type: ItemType, key: Id) {
        self.recently_stored().insert((item_type, key));
    }

    /// Take the items stored since the last call, clearing the set.
    pub fn take_recently_stored(&self) -> HashSet<(ItemType, Id)> {
        std::mem::take(&mut *self.recently_stored())
    }

    /// Handle an inbound packet from `from`, received at `received_at`.
    pub fn handle_packet(&self, packet: &[u8], from: PeerAddress, received_at: Instant) {
        if self.shutdown.is_triggered() || &from == self.address() {
            return;
        }

        if self.is_banned(&from) {
            trace!(context = "socket_validation", ?from, "Dropped packet from banned peer");
            return;
        }

        let message = match Message::from_bytes(packet) {
            Ok(message) => message,
            Err(error) => {
                trace!(
                    context = "socket_error",
                    ?error,
                    ?from,
                    "Received invalid message"
                );

                // A broken reply to one of our requests fails it now, not on timeout.
                if let Some(transaction_id) = Message::reply_transaction_id(packet) {
                    let failure = Message {
                        transaction_id,
                        message_type: MessageType::Error(ErrorSpecific {
                            code: ERROR_PROTOCOL,
                            description: format!("Malformed response: {error}"),
                        }),
                    };

                    self.socket.correlate(failure, &from);
                }

                return;
            }
        };

        trace!(context = "socket_message_receiving", ?message, ?from);

        match message.message_type {
            MessageType::Request(request) => {
                self.peer_responded(&from, received_at);
                server::handle_request(self, &from, message.transaction_id, request);
            }
            MessageType::Response(_) => {
                if self.socket.correlate(message, &from) {
                    self.peer_responded(&from, received_at);
                }
            }
            MessageType::Error(_) => {
                self.socket.correlate(message, &from);
            }
        }
    }

    // === Private Methods ===

    fn status_watchers(&self) -> MutexGuard<'_, Vec<Sender<NetworkStatus>>> {
        self.status_watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn recently_stored(&self) -> MutexGuard<'_, HashSet<(ItemType, Id)>> {
        self.recently_stored
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
