//! Main Crate Error

use crate::storage::StorageError;

#[derive(thiserror::Error, Debug)]
/// Maildht crate error enum.
pub enum Error {
    /// A store lookup found no peer to hold the item.
    #[error("No storage nodes available")]
    NoStorageNodes,

    /// The node was shut down while (or before) running this operation.
    #[error("Dht is shut down")]
    Shutdown,

    #[error(transparent)]
    /// Error from a [crate::StorageHandler].
    Storage(#[from] StorageError),

    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),

    #[error("Failed to parse packet bytes: {0}")]
    BencodeError(#[from] serde_bencode::Error),

    /// Indicates that an Id or key is not 32 bytes.
    #[error("Invalid Id size, expected 32, got {0}")]
    InvalidIdSize(usize),

    #[error("Invalid Id encoding: {0}")]
    InvalidIdEncoding(String),

    /// A decoded message is structurally valid bencode but not a valid DHT message.
    #[error("Invalid message: {0}")]
    InvalidMessage(&'static str),

    #[error("Invalid peer address: {0}")]
    InvalidPeerAddress(String),
}
