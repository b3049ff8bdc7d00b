//! Registry that starts process-local and later switches to a shared backend.
//!
//! The durable store is often not usable yet when discovery starts (it may
//! itself depend on the cluster being formed). `SwitchableRegistry` breaks
//! that cycle: registrations land in a process-local registry first, and once
//! the host promotes the real backend, existing rows are copied over and all
//! subsequent operations hit the shared store.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::error::StoreError;

use super::{KeyPrefix, MemberRegistry, MemoryRegistry, RegistryKey, RegistryValue};

enum Backend<R> {
    Local(Arc<MemoryRegistry>),
    Cluster(Arc<R>),
}

impl<R> Clone for Backend<R> {
    fn clone(&self) -> Self {
        match self {
            Self::Local(local) => Self::Local(Arc::clone(local)),
            Self::Cluster(cluster) => Self::Cluster(Arc::clone(cluster)),
        }
    }
}

/// A [`MemberRegistry`] that can be promoted from local to cluster-backed.
///
/// Writes and promotion are serialized through one async mutex so a promotion
/// never races a write into the variant being retired; reads route against
/// the current variant without taking that mutex.
pub struct SwitchableRegistry<R> {
    backend: RwLock<Backend<R>>,
    write_gate: tokio::sync::Mutex<()>,
}

impl<R: MemberRegistry> SwitchableRegistry<R> {
    /// Create a registry backed by a fresh process-local store.
    pub fn new() -> Self {
        Self {
            backend: RwLock::new(Backend::Local(Arc::new(MemoryRegistry::new()))),
            write_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Whether promotion has happened.
    pub fn is_promoted(&self) -> bool {
        matches!(&*self.backend.read(), Backend::Cluster(_))
    }

    /// Switch to the shared backend, copying all locally accumulated rows
    /// into it first. Returns the number of rows copied. Promoting twice is
    /// a no-op.
    pub async fn promote(&self, cluster: Arc<R>) -> Result<usize, StoreError> {
        let _gate = self.write_gate.lock().await;

        let local = match &*self.backend.read() {
            Backend::Local(local) => Arc::clone(local),
            Backend::Cluster(_) => {
                debug!("registry already promoted, ignoring");
                return Ok(0);
            }
        };

        let rows = local.export();
        let copied = rows.len();
        for (key, value) in rows {
            cluster.set(key, value).await?;
        }
        *self.backend.write() = Backend::Cluster(cluster);
        info!(copied, "promoted member registry to cluster backend");
        Ok(copied)
    }

    fn current(&self) -> Backend<R> {
        self.backend.read().clone()
    }
}

impl<R: MemberRegistry> Default for SwitchableRegistry<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: MemberRegistry> MemberRegistry for SwitchableRegistry<R> {
    async fn get(&self, key: &RegistryKey) -> Result<Option<RegistryValue>, StoreError> {
        match self.current() {
            Backend::Local(local) => local.get(key).await,
            Backend::Cluster(cluster) => cluster.get(key).await,
        }
    }

    async fn set(&self, key: RegistryKey, value: RegistryValue) -> Result<(), StoreError> {
        let _gate = self.write_gate.lock().await;
        match self.current() {
            Backend::Local(local) => local.set(key, value).await,
            Backend::Cluster(cluster) => cluster.set(key, value).await,
        }
    }

    async fn remove(&self, key: &RegistryKey) -> Result<Option<RegistryValue>, StoreError> {
        let _gate = self.write_gate.lock().await;
        match self.current() {
            Backend::Local(local) => local.remove(key).await,
            Backend::Cluster(cluster) => cluster.remove(key).await,
        }
    }

    async fn visit<F>(&self, prefix: &KeyPrefix, visit: F) -> Result<(), StoreError>
    where
        F: FnMut(&RegistryKey, &RegistryValue) -> bool + Send,
    {
        match self.current() {
            Backend::Local(local) => local.visit(prefix, visit).await,
            Backend::Cluster(cluster) => cluster.visit(prefix, visit).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(instance: &str) -> RegistryKey {
        RegistryKey::canonical("members", instance)
    }

    #[tokio::test]
    async fn test_promote_copies_local_rows() {
        let switch: SwitchableRegistry<MemoryRegistry> = SwitchableRegistry::new();
        switch
            .set(key("main"), RegistryValue::Single("10.0.0.5:47500".into()))
            .await
            .unwrap();
        assert!(!switch.is_promoted());

        let cluster = Arc::new(MemoryRegistry::new());
        let copied = switch.promote(Arc::clone(&cluster)).await.unwrap();
        assert_eq!(copied, 1);
        assert!(switch.is_promoted());

        // The copied row is readable both through the switch and directly.
        assert_eq!(
            cluster.get(&key("main")).await.unwrap(),
            Some(RegistryValue::Single("10.0.0.5:47500".into()))
        );
        assert_eq!(
            switch.get(&key("main")).await.unwrap(),
            Some(RegistryValue::Single("10.0.0.5:47500".into()))
        );
    }

    #[tokio::test]
    async fn test_writes_after_promotion_hit_cluster_backend() {
        let switch: SwitchableRegistry<MemoryRegistry> = SwitchableRegistry::new();
        let cluster = Arc::new(MemoryRegistry::new());
        switch.promote(Arc::clone(&cluster)).await.unwrap();

        switch
            .set(key("main"), RegistryValue::Single("10.0.0.6:47500".into()))
            .await
            .unwrap();
        assert_eq!(cluster.len(), 1);

        // Second promotion is a no-op.
        assert_eq!(switch.promote(Arc::new(MemoryRegistry::new())).await.unwrap(), 0);
        assert_eq!(
            switch.get(&key("main")).await.unwrap(),
            Some(RegistryValue::Single("10.0.0.6:47500".into()))
        );
    }
}
