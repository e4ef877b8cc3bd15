//! Opaque items stored in the DHT.
use std::fmt::{self, Debug, Display, Formatter};

use bytes::Bytes;

use crate::common::Id;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
/// Type tag of a [StorableItem], selecting the [crate::StorageHandler] that owns it.
pub struct ItemType(pub u8);

impl ItemType {
    pub const EMAIL_PACKET: ItemType = ItemType(b'E');
    pub const INDEX_PACKET: ItemType = ItemType(b'I');
    pub const DIRECTORY_ENTRY: ItemType = ItemType(b'C');
}

impl Display for ItemType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match *self {
            ItemType::EMAIL_PACKET => write!(f, "email-packet"),
            ItemType::INDEX_PACKET => write!(f, "index-packet"),
            ItemType::DIRECTORY_ENTRY => write!(f, "directory-entry"),
            ItemType(other) => write!(f, "item-type-{other}"),
        }
    }
}

impl Debug for ItemType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "ItemType({self})")
    }
}

#[derive(Clone, PartialEq, Eq)]
/// An opaque payload stored under a DHT key.
///
/// The DHT never interprets the payload bytes.
pub struct StorableItem {
    item_type: ItemType,
    key: Id,
    payload: Bytes,
}

impl StorableItem {
    pub fn new<T: Into<Bytes>>(item_type: ItemType, key: Id, payload: T) -> Self {
        StorableItem {
            item_type,
            key,
            payload: payload.into(),
        }
    }

    /// An item keyed by the SHA-256 hash of its payload.
    pub fn content_addressed<T: Into<Bytes>>(item_type: ItemType, payload: T) -> Self {
        let payload = payload.into();

        StorableItem {
            item_type,
            key: Id::hash(&payload),
            payload,
        }
    }

    // === Getters ===

    pub fn item_type(&self) -> ItemType {
        self.item_type
    }

    pub fn key(&self) -> &Id {
        &self.key
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}

impl Debug for StorableItem {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorableItem")
            .field("item_type", &self.item_type)
            .field("key", &self.key)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A request to delete the item stored under `key`, carrying the proof of authorization.
///
/// Whoever created the item published SHA-256 of `authorization` as the
/// verification hash, see [verify_authorization].
pub struct DeleteRequest {
    pub item_type: ItemType,
    pub key: Id,
    pub authorization: Bytes,
}

impl DeleteRequest {
    pub fn new<T: Into<Bytes>>(item_type: ItemType, key: Id, authorization: T) -> Self {
        DeleteRequest {
            item_type,
            key,
            authorization: authorization.into(),
        }
    }
}

/// Returns true if `authorization` hashes to `verification_hash`.
pub fn verify_authorization(authorization: &[u8], verification_hash: &Id) -> bool {
    &Id::hash(authorization) == verification_hash
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn content_addressed_key() {
        let item = StorableItem::content_addressed(ItemType::INDEX_PACKET, &b"payload"[..]);
        assert_eq!(item.key(), &Id::hash(b"payload"));
    }

    #[test]
    fn authorization_check() {
        let authorization = b"secret delete key";
        let verification_hash = Id::hash(authorization);

        assert!(verify_authorization(authorization, &verification_hash));
        assert!(!verify_authorization(b"forged", &verification_hash));
    }
}
