//! In-process simulated network, for tests and experiments.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use crate::common::{Id, ItemType, Message, PeerAddress};
use crate::rpc::Config;
use crate::storage::MemoryStorage;
use crate::transport::Transport;
use crate::{Dht, Result};

const ITEM_TYPES: [ItemType; 3] = [
    ItemType::EMAIL_PACKET,
    ItemType::INDEX_PACKET,
    ItemType::DIRECTORY_ENTRY,
];

#[derive(Debug, Clone)]
/// A message sent over a [Testnet], whether it was delivered or not.
pub struct SentMessage {
    pub from: PeerAddress,
    pub to: PeerAddress,
    pub message: Message,
}

#[derive(Debug, Default)]
struct Network {
    nodes: RwLock<HashMap<Id, Dht>>,
    offline: RwLock<HashSet<Id>>,
    log: Mutex<Vec<SentMessage>>,
}

/// Delivers packets synchronously to the destination node of the same [Network].
#[derive(Debug)]
struct TestnetTransport {
    local: PeerAddress,
    network: Arc<Network>,
}

impl Transport for TestnetTransport {
    fn send(&self, to: &PeerAddress, packet: &[u8]) -> io::Result<()> {
        let message = Message::from_bytes(packet).map_err(io::Error::other)?;

        self.network
            .log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(SentMessage {
                from: self.local.clone(),
                to: to.clone(),
                message,
            });

        {
            let offline = self
                .network
                .offline
                .read()
                .unwrap_or_else(PoisonError::into_inner);

            if offline.contains(self.local.id()) || offline.contains(to.id()) {
                return Ok(());
            }
        }

        let node = self
            .network
            .nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(to.id())
            .cloned();

        if let Some(node) = node {
            node.handle_packet(packet, self.local.clone(), Instant::now());
        }

        Ok(())
    }
}

#[derive(Debug)]
/// Create a testnet of Dht nodes in this process, with no bootstrap peers other
/// than the first node.
pub struct Testnet {
    pub bootstrap: Vec<PeerAddress>,
    pub nodes: Vec<Dht>,
    storages: Vec<HashMap<ItemType, Arc<MemoryStorage>>>,
    network: Arc<Network>,
}

impl Testnet {
    /// Create `count` bootstrapped nodes with [Testnet::config].
    pub fn new(count: usize) -> Result<Testnet> {
        Self::with_config(count, Self::config())
    }

    /// Timeouts and intervals short enough for tests, with maintenance and replication
    /// effectively only happening when asked for.
    pub fn config() -> Config {
        Config {
            request_timeout: Duration::from_millis(200),
            lookup_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(1),
            bootstrap_retry_interval: Duration::from_millis(20),
            replication_jitter: Duration::ZERO,
            replication_wait: Duration::from_millis(500),
            ..Config::default()
        }
    }

    /// Create `count` nodes sharing `config`, and wait until they are all bootstrapped.
    pub fn with_config(count: usize, config: Config) -> Result<Testnet> {
        let network = Arc::new(Network::default());

        let addresses: Vec<PeerAddress> = (0..count)
            .map(|i| PeerAddress::new(format!("peer-{i}").into_bytes()))
            .collect();
        let bootstrap: Vec<PeerAddress> = addresses.iter().take(1).cloned().collect();

        let mut nodes = Vec::with_capacity(count);
        let mut storages = Vec::with_capacity(count);

        for address in addresses {
            let mut builder = Dht::builder(address.clone());
            builder
                .config(config.clone())
                .bootstrap(&bootstrap)
                .transport(Arc::new(TestnetTransport {
                    local: address.clone(),
                    network: network.clone(),
                }));

            let mut storage = HashMap::new();
            for item_type in ITEM_TYPES {
                let handler = Arc::new(MemoryStorage::new(item_type));
                builder.storage(item_type, handler.clone());
                storage.insert(item_type, handler);
            }

            let node = builder.build()?;

            network
                .nodes
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(*address.id(), node.clone());

            nodes.push(node);
            storages.push(storage);
        }

        for node in &nodes {
            node.start()?;
        }

        for node in &nodes {
            node.bootstrapped();
        }

        Ok(Testnet {
            bootstrap,
            nodes,
            storages,
            network,
        })
    }

    // === Getters ===

    pub fn node(&self, index: usize) -> &Dht {
        &self.nodes[index]
    }

    /// The in-memory storage of a node for an item type.
    pub fn storage(&self, index: usize, item_type: ItemType) -> Option<Arc<MemoryStorage>> {
        self.storages[index].get(&item_type).cloned()
    }

    /// Every message sent so far, in order.
    pub fn sent_messages(&self) -> Vec<SentMessage> {
        self.network
            .log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of messages a node sent so far.
    pub fn sent_by(&self, index: usize) -> usize {
        let address = self.nodes[index].address();

        self.network
            .log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|sent| &sent.from == address)
            .count()
    }

    // === Public Methods ===

    /// Take a node off the network, dropping everything it sends or is sent.
    pub fn set_online(&self, index: usize, online: bool) {
        let id = *self.nodes[index].id();
        let mut offline = self
            .network
            .offline
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        if online {
            offline.remove(&id);
        } else {
            offline.insert(id);
        }
    }
}

impl Drop for Testnet {
    fn drop(&mut self) {
        // The network holds handles too, release them so the nodes can stop.
        self.network
            .nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        for node in &self.nodes {
            node.shutdown();
        }
    }
}
