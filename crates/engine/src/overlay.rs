use std::sync::Arc;

use farmstand_core::{Clock, LineMetadata, OverlayEntry, ProductId, clamp_quantity};
use farmstand_storage::{KeyValueStore, StorageError};
use tracing::{debug, warn};

/// Session-scoped "buy now" entries, one per product id.
///
/// Entries live in their own storage instance (the tab's session storage) and
/// outrank the durable cart's quantity for the same product while they exist.
pub struct OverlayStore<S> {
    storage: S,
    prefix: String,
    clock: Arc<dyn Clock>,
}

impl<S: KeyValueStore> OverlayStore<S> {
    pub fn new(storage: S, prefix: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            storage,
            prefix: prefix.into(),
            clock,
        }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn into_storage(self) -> S {
        self.storage
    }

    fn key(&self, product_id: &ProductId) -> String {
        format!("{}{}", self.prefix, product_id)
    }

    /// Create or refresh the entry for `product_id`. Quantities below 1 clamp to 1.
    /// Refreshing restarts the entry's age.
    pub fn set_overlay(
        &mut self,
        product_id: &ProductId,
        quantity: i64,
        metadata: Option<LineMetadata>,
        max_quantity: Option<u32>,
    ) -> Result<OverlayEntry, StorageError> {
        let entry = OverlayEntry {
            quantity: clamp_quantity(quantity),
            created_at: self.clock.now_ms(),
            metadata,
            max_quantity,
        };
        self.put_entry(product_id, &entry)?;
        debug!(%product_id, quantity = entry.quantity, "overlay set");
        Ok(entry)
    }

    /// Write an entry verbatim, keeping its timestamp. Used to restore state
    /// after a failed multi-store write.
    pub(crate) fn put_entry(
        &mut self,
        product_id: &ProductId,
        entry: &OverlayEntry,
    ) -> Result<(), StorageError> {
        let raw = entry
            .to_json()
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        let key = self.key(product_id);
        self.storage.set(&key, &raw)
    }

    pub fn get_overlay(&self, product_id: &ProductId) -> Result<Option<u32>, StorageError> {
        Ok(self.entry(product_id)?.map(|e| e.quantity))
    }

    /// Full entry for `product_id`. Unparseable entries read as absent.
    pub fn entry(&self, product_id: &ProductId) -> Result<Option<OverlayEntry>, StorageError> {
        let Some(raw) = self.storage.get(&self.key(product_id))? else {
            return Ok(None);
        };
        match OverlayEntry::from_json(&raw) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                warn!(%product_id, error = %e, "ignoring malformed overlay entry");
                Ok(None)
            }
        }
    }

    pub fn clear_overlay(&mut self, product_id: &ProductId) -> Result<(), StorageError> {
        let key = self.key(product_id);
        self.storage.remove(&key)
    }

    /// Every well-formed entry, ordered by product id. Malformed entries are
    /// removed on the way.
    pub fn entries(&mut self) -> Result<Vec<(ProductId, OverlayEntry)>, StorageError> {
        let (entries, malformed) = self.scan()?;
        for key in malformed {
            self.storage.remove(&key)?;
        }
        Ok(entries)
    }

    /// Read-only variant of [`entries`](Self::entries) that leaves malformed entries in place.
    pub fn peek_entries(&self) -> Result<Vec<(ProductId, OverlayEntry)>, StorageError> {
        Ok(self.scan()?.0)
    }

    fn scan(&self) -> Result<(Vec<(ProductId, OverlayEntry)>, Vec<String>), StorageError> {
        let mut entries = Vec::new();
        let mut malformed = Vec::new();
        for key in self.storage.keys_with_prefix(&self.prefix)? {
            let Some(raw) = self.storage.get(&key)? else {
                continue;
            };
            let product_id = ProductId::new(&key[self.prefix.len()..]);
            match OverlayEntry::from_json(&raw) {
                Ok(entry) => entries.push((product_id, entry)),
                Err(e) => {
                    warn!(%product_id, error = %e, "malformed overlay entry");
                    malformed.push(key);
                }
            }
        }
        Ok((entries, malformed))
    }

    pub fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.storage.keys_with_prefix(&self.prefix)?.is_empty())
    }

    pub fn clear_all(&mut self) -> Result<usize, StorageError> {
        let keys = self.storage.keys_with_prefix(&self.prefix)?;
        for key in &keys {
            self.storage.remove(key)?;
        }
        Ok(keys.len())
    }

    /// Remove entries older than `max_age_ms`. Returns how many were removed.
    pub fn purge_stale(&mut self, max_age_ms: u64) -> Result<usize, StorageError> {
        let now = self.clock.now_ms();
        let mut purged = 0;
        for (product_id, entry) in self.entries()? {
            if entry.is_stale(now, max_age_ms) {
                self.clear_overlay(&product_id)?;
                debug!(%product_id, age_ms = now.saturating_sub(entry.created_at), "purged stale overlay");
                purged += 1;
            }
        }
        Ok(purged)
    }
}
