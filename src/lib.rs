//! Kademlia DHT with an S/Kademlia sibling list, the routing and storage core of an
//! anonymous mail network.
//!
//! A [Dht] node keeps a routing table of peers, finds the peers closest to a key with
//! iterative lookups, stores opaque typed items on them and keeps replicating what it
//! holds as peers come and go. Carrying datagrams is left to a [Transport], persisting
//! items to a [StorageHandler] per [ItemType].
//!
//! See [Testnet] for an in-process network of nodes.

mod common;
mod dht;
mod error;
mod peer_file;
mod replication;
pub mod rpc;
mod shutdown;
mod storage;
mod testnet;
mod transport;

pub use crate::common::{
    kbucket::{KBucket, SiblingBucket},
    verify_authorization, DeleteRequest, ErrorSpecific, Id, ItemType, KeyRange, Message,
    MessageType, Peer, PeerAddress, RequestSpecific, ResponseSpecific, RoutingTable,
    StorableItem, ID_SIZE, LOCK_THRESHOLD, MAX_BUCKET_SIZE_K, SIBLING_BUCKET_SIZE_S,
    SPLIT_GRANULARITY_B,
};
pub use bytes::Bytes;
pub use dht::{Dht, DhtBuilder, DhtResults};
pub use error::Error;
pub use replication::ReplicationReport;
pub use storage::{MemoryStorage, StorageError, StorageHandler, StorageRegistry};
pub use testnet::{SentMessage, Testnet};
pub use transport::{PeerFilter, PeerSource, Transport, TransportError};

/// Alias for `Result<T, maildht::Error>`.
pub type Result<T, E = Error> = std::result::Result<T, E>;
