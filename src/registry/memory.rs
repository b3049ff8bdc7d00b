//! In-memory registry backend.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::error::StoreError;

use super::{KeyPrefix, MemberRegistry, RegistryKey, RegistryValue};

/// In-memory [`MemberRegistry`] for tests and single-process embeddings.
///
/// Rows live in a `BTreeMap`, so enumeration order matches key order the way
/// a real backing store would deliver it. The write counter lets tests assert
/// that an operation performed no writes (reconciliation idempotency).
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    rows: RwLock<BTreeMap<RegistryKey, RegistryValue>>,
    writes: AtomicU64,
}

impl MemoryRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored rows.
    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    /// Whether no rows are stored.
    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    /// Number of mutating operations performed so far (sets plus effective
    /// removes).
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Clone out all rows in key order.
    pub fn export(&self) -> Vec<(RegistryKey, RegistryValue)> {
        self.rows
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl MemberRegistry for MemoryRegistry {
    async fn get(&self, key: &RegistryKey) -> Result<Option<RegistryValue>, StoreError> {
        Ok(self.rows.read().get(key).cloned())
    }

    async fn set(&self, key: RegistryKey, value: RegistryValue) -> Result<(), StoreError> {
        self.rows.write().insert(key, value);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn remove(&self, key: &RegistryKey) -> Result<Option<RegistryValue>, StoreError> {
        let removed = self.rows.write().remove(key);
        if removed.is_some() {
            self.writes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(removed)
    }

    async fn visit<F>(&self, prefix: &KeyPrefix, mut visit: F) -> Result<(), StoreError>
    where
        F: FnMut(&RegistryKey, &RegistryValue) -> bool + Send,
    {
        let rows = self.rows.read();
        for (key, value) in rows.iter() {
            if !prefix.matches(key) {
                continue;
            }
            if !visit(key, value) {
                break;
            }
        }
        Ok(())
    }
}
