//! Local storage of DHT items, one [StorageHandler] per [ItemType].

use std::collections::HashMap;
use std::fmt::Debug;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use lru::LruCache;

use crate::common::{DeleteRequest, Id, ItemType, StorableItem};

#[derive(thiserror::Error, Debug)]
/// Errors returned by a [StorageHandler].
pub enum StorageError {
    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),

    /// The handler refused the item.
    #[error("Rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// Persists the items of one [ItemType].
///
/// Handlers are shared between the coordinator, the replication loop and inbound
/// request handling, so they serialize their own internal state.
pub trait StorageHandler: Debug + Send + Sync {
    fn retrieve(&self, key: &Id) -> Result<Option<StorableItem>, StorageError>;

    fn store(&self, item: StorableItem) -> Result<(), StorageError>;

    /// Every item held locally, replicated to its closest peers periodically.
    fn items(&self) -> Result<Vec<StorableItem>, StorageError>;

    /// The authorization that deleted `key`, if this handler knows it.
    fn delete_authorization(&self, _key: &Id) -> Result<Option<Bytes>, StorageError> {
        Ok(None)
    }

    /// Store the item, unless it is known to be deleted, in which case return
    /// the delete request instead so the sender stops replicating it.
    fn store_or_get_delete_request(
        &self,
        item: StorableItem,
    ) -> Result<Option<DeleteRequest>, StorageError> {
        self.store(item).map(|_| None)
    }

    /// Delete an item. Handlers that can't verify the authorization ignore the request.
    fn delete(&self, _request: &DeleteRequest) -> Result<(), StorageError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
/// Registered [StorageHandler]s by item type.
pub struct StorageRegistry {
    handlers: HashMap<ItemType, Arc<dyn StorageHandler>>,
}

impl StorageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, item_type: ItemType, handler: Arc<dyn StorageHandler>) {
        self.handlers.insert(item_type, handler);
    }

    pub fn get(&self, item_type: ItemType) -> Option<&Arc<dyn StorageHandler>> {
        self.handlers.get(&item_type)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ItemType, &Arc<dyn StorageHandler>)> {
        self.handlers
            .iter()
            .map(|(item_type, handler)| (*item_type, handler))
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Default number of items a [MemoryStorage] holds before evicting the least recently used.
pub const DEFAULT_MEMORY_STORAGE_CAPACITY: usize = 1000;

const DEFAULT_CAPACITY: NonZeroUsize =
    NonZeroUsize::MIN.saturating_add(DEFAULT_MEMORY_STORAGE_CAPACITY - 1);

#[derive(Debug)]
/// A bounded, deletion-aware in-memory [StorageHandler].
///
/// Items are evicted least recently used first. Deleted keys are remembered
/// together with their authorization, so a deleted item is never stored again.
///
/// Payloads are opaque here, so delete requests are trusted as they come.
pub struct MemoryStorage {
    item_type: ItemType,
    inner: Mutex<MemoryStorageInner>,
}

#[derive(Debug)]
struct MemoryStorageInner {
    items: LruCache<Id, StorableItem>,
    deleted: LruCache<Id, DeleteRequest>,
}

impl MemoryStorage {
    pub fn new(item_type: ItemType) -> Self {
        Self::with_capacity(item_type, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(item_type: ItemType, capacity: NonZeroUsize) -> Self {
        MemoryStorage {
            item_type,
            inner: Mutex::new(MemoryStorageInner {
                items: LruCache::new(capacity),
                deleted: LruCache::new(capacity),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    /// Items held before the least recently used one is evicted.
    pub fn capacity(&self) -> usize {
        self.lock().items.cap().get()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryStorageInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_type(&self, item_type: ItemType) -> Result<(), StorageError> {
        if item_type != self.item_type {
            return Err(StorageError::Rejected(format!(
                "expected {} got {}",
                self.item_type, item_type
            )));
        }

        Ok(())
    }
}

impl StorageHandler for MemoryStorage {
    fn retrieve(&self, key: &Id) -> Result<Option<StorableItem>, StorageError> {
        Ok(self.lock().items.get(key).cloned())
    }

    fn store(&self, item: StorableItem) -> Result<(), StorageError> {
        self.store_or_get_delete_request(item).map(|_| ())
    }

    fn items(&self) -> Result<Vec<StorableItem>, StorageError> {
        Ok(self
            .lock()
            .items
            .iter()
            .map(|(_, item)| item.clone())
            .collect())
    }

    fn delete_authorization(&self, key: &Id) -> Result<Option<Bytes>, StorageError> {
        Ok(self
            .lock()
            .deleted
            .peek(key)
            .map(|request| request.authorization.clone()))
    }

    fn store_or_get_delete_request(
        &self,
        item: StorableItem,
    ) -> Result<Option<DeleteRequest>, StorageError> {
        self.check_type(item.item_type())?;

        let mut inner = self.lock();

        if let Some(request) = inner.deleted.get(item.key()) {
            return Ok(Some(request.clone()));
        }

        inner.items.put(*item.key(), item);

        Ok(None)
    }

    fn delete(&self, request: &DeleteRequest) -> Result<(), StorageError> {
        self.check_type(request.item_type)?;

        let mut inner = self.lock();

        inner.items.pop(&request.key);
        inner.deleted.put(request.key, request.clone());

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn store_and_retrieve() {
        let storage = MemoryStorage::new(ItemType::EMAIL_PACKET);
        let item = StorableItem::content_addressed(ItemType::EMAIL_PACKET, &b"hello"[..]);

        storage.store(item.clone()).unwrap();

        assert_eq!(storage.retrieve(item.key()).unwrap(), Some(item));
        assert_eq!(storage.items().unwrap().len(), 1);
        assert_eq!(storage.capacity(), DEFAULT_MEMORY_STORAGE_CAPACITY);
    }

    #[test]
    fn rejects_other_item_types() {
        let storage = MemoryStorage::new(ItemType::EMAIL_PACKET);
        let item = StorableItem::content_addressed(ItemType::INDEX_PACKET, &b"hello"[..]);

        assert!(matches!(
            storage.store(item),
            Err(StorageError::Rejected(_))
        ));
    }

    #[test]
    fn deleted_items_are_not_stored_again() {
        let storage = MemoryStorage::new(ItemType::EMAIL_PACKET);
        let item = StorableItem::content_addressed(ItemType::EMAIL_PACKET, &b"hello"[..]);
        storage.store(item.clone()).unwrap();

        let request = DeleteRequest::new(ItemType::EMAIL_PACKET, *item.key(), &b"secret"[..]);
        storage.delete(&request).unwrap();

        assert!(storage.retrieve(item.key()).unwrap().is_none());
        assert_eq!(
            storage.delete_authorization(item.key()).unwrap(),
            Some(Bytes::from_static(b"secret"))
        );
        assert_eq!(
            storage.store_or_get_delete_request(item.clone()).unwrap(),
            Some(request)
        );
        assert!(storage.is_empty());
    }

    #[test]
    fn evicts_least_recently_used() {
        let storage =
            MemoryStorage::with_capacity(ItemType::EMAIL_PACKET, NonZeroUsize::new(2).unwrap());

        let items: Vec<StorableItem> = (0..3_u8)
            .map(|i| StorableItem::content_addressed(ItemType::EMAIL_PACKET, vec![i]))
            .collect();

        storage.store(items[0].clone()).unwrap();
        storage.store(items[1].clone()).unwrap();
        storage.retrieve(items[0].key()).unwrap();
        storage.store(items[2].clone()).unwrap();

        assert!(storage.retrieve(items[1].key()).unwrap().is_none());
        assert!(storage.retrieve(items[0].key()).unwrap().is_some());
        assert_eq!(storage.len(), 2);
    }
}
