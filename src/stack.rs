//! Wiring of the full rendezvous subsystem.
//!
//! [`RendezvousStack`] owns one of everything and drives the lifecycle:
//!
//! ```text
//! new()      build translator (static self-mappings active immediately),
//!            finder, registrar, listener, reconcile queue
//! start()    seed finder from the registry, write own registration,
//!            startup reconcile (fatal on lock contention), spawn worker
//! shutdown() stop worker, remove own registrations
//! ```
//!
//! The host hands the finder and translator to its clustering runtime as the
//! seed-address source and address resolver, routes discovery events into
//! the listener, and advertises [`RendezvousStack::self_mappings`] as this
//! node's member attributes so peers can learn them.

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use async_channel::Receiver;
use tracing::{debug, info};

use crate::config::RendezvousConfig;
use crate::error::{Error, Result};
use crate::events::{ClusterRuntime, DiscoveryEventListener};
use crate::finder::BootstrapIpFinder;
use crate::lock::DistributedLock;
use crate::registrar::{FailureCleanup, MemberAddressRegistrar};
use crate::registry::MemberRegistry;
use crate::translator::{
    build_self_mappings, AddressTranslator, LocalIdentity, MappingSet, PeerMappingTable,
};
use crate::worker::ReconcileWorker;

/// The assembled subsystem: translator, finder, registrar, listener, worker.
pub struct RendezvousStack<I, R, L, C> {
    config: RendezvousConfig,
    translator: Arc<AddressTranslator>,
    finder: Arc<BootstrapIpFinder>,
    registrar: Arc<MemberAddressRegistrar<I, R, L, C>>,
    listener: Arc<DiscoveryEventListener<I, R, L, C>>,
    self_mappings: MappingSet,
    reconcile_rx: Option<Receiver<()>>,
    worker: Option<ReconcileWorker>,
}

impl<I, R, L, C> RendezvousStack<I, R, L, C>
where
    I: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    R: MemberRegistry + 'static,
    L: DistributedLock + 'static,
    C: ClusterRuntime<I> + 'static,
{
    /// Build and wire the subsystem. Validates the configuration and
    /// computes this node's static address mappings (resolving the external
    /// host once, if one is configured).
    pub fn new(
        config: RendezvousConfig,
        local: &LocalIdentity,
        registry: Arc<R>,
        lock: Arc<L>,
        runtime: Arc<C>,
    ) -> Result<Self> {
        config.validate()?;

        let translator = Arc::new(AddressTranslator::new());
        let self_mappings = build_self_mappings(&config, local);
        translator.rebuild([&self_mappings]);

        let finder = Arc::new(BootstrapIpFinder::new(Arc::clone(&translator)));
        let registrar = Arc::new(MemberAddressRegistrar::new(
            config.clone(),
            Arc::clone(&translator),
            registry,
            lock,
            runtime,
        )?);

        let (reconcile_tx, reconcile_rx) =
            async_channel::bounded(config.reconcile_queue_capacity.max(1));
        let listener = Arc::new(DiscoveryEventListener::new(
            Arc::clone(&registrar),
            Arc::clone(&translator),
            Arc::new(PeerMappingTable::new()),
            self_mappings.clone(),
            reconcile_tx,
        ));

        debug!(
            instance = %config.instance_name,
            static_mappings = self_mappings.socket_mappings().len()
                + self_mappings.host_mappings().len(),
            "rendezvous stack wired"
        );
        Ok(Self {
            config,
            translator,
            finder,
            registrar,
            listener,
            self_mappings,
            reconcile_rx: Some(reconcile_rx),
            worker: None,
        })
    }

    /// The address translator, to be installed as the runtime's resolver.
    pub fn translator(&self) -> &Arc<AddressTranslator> {
        &self.translator
    }

    /// The seed-address finder, to be installed in the runtime's discovery.
    pub fn finder(&self) -> &Arc<BootstrapIpFinder> {
        &self.finder
    }

    /// The registrar, for hosts that drive parts of the lifecycle manually.
    pub fn registrar(&self) -> &Arc<MemberAddressRegistrar<I, R, L, C>> {
        &self.registrar
    }

    /// The event listener the runtime must deliver discovery events to.
    pub fn listener(&self) -> &Arc<DiscoveryEventListener<I, R, L, C>> {
        &self.listener
    }

    /// This node's static mapping set, to be advertised to peers as member
    /// attributes.
    pub fn self_mappings(&self) -> &MappingSet {
        &self.self_mappings
    }

    /// Whether `start` has completed and the worker is alive.
    pub fn is_started(&self) -> bool {
        self.worker
            .as_ref()
            .map(ReconcileWorker::is_running)
            .unwrap_or(false)
    }

    /// Bring the subsystem up.
    ///
    /// Seeds the finder from the registry, registers this process's
    /// addresses, runs the startup reconciliation, and spawns the worker.
    /// Call from within a tokio runtime, once the cluster runtime reports a
    /// topology containing at least this node. Errors here are fatal to
    /// instance startup; the registration written earlier in the sequence is
    /// rolled back.
    pub async fn start(&mut self) -> Result<()> {
        let reconcile_rx = self
            .reconcile_rx
            .take()
            .ok_or_else(|| Error::Config("rendezvous stack already started".into()))?;

        let seeds = self.registrar.initialize_seed_addresses().await?;
        self.finder.seed(seeds);

        let mut cleanup = FailureCleanup::new();
        self.registrar.register_addresses(&mut cleanup).await?;

        if let Err(err) = self.registrar.reconcile_startup().await {
            self.registrar.run_cleanup(&mut cleanup).await;
            return Err(err);
        }

        self.worker = Some(ReconcileWorker::spawn(
            Arc::clone(&self.registrar),
            reconcile_rx,
            self.config.refresh_interval,
        ));
        info!(instance = %self.config.instance_name, "rendezvous stack started");
        Ok(())
    }

    /// Tear the subsystem down: stop the worker, remove own registrations.
    pub async fn shutdown(&mut self) -> Result<()> {
        if let Some(worker) = self.worker.take() {
            worker.stop().await;
        }
        self.registrar.remove_address_registrations().await?;
        info!(instance = %self.config.instance_name, "rendezvous stack shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::MemberAddress;
    use crate::events::MemberInfo;
    use crate::lock::MemoryLock;
    use crate::registrar::RegistrationState;
    use crate::registry::{KeyPrefix, MemoryRegistry};
    use parking_lot::Mutex;

    struct StaticRuntime {
        local: Vec<MemberAddress>,
        members: Mutex<Vec<MemberInfo<u64>>>,
    }

    impl ClusterRuntime<u64> for StaticRuntime {
        fn members(&self) -> Vec<MemberInfo<u64>> {
            self.members.lock().clone()
        }

        fn local_addresses(&self) -> Vec<MemberAddress> {
            self.local.clone()
        }
    }

    fn addr(s: &str) -> MemberAddress {
        s.parse().unwrap()
    }

    fn make_stack() -> (
        RendezvousStack<u64, MemoryRegistry, MemoryLock, StaticRuntime>,
        Arc<MemoryRegistry>,
    ) {
        let registry = Arc::new(MemoryRegistry::new());
        let runtime = Arc::new(StaticRuntime {
            local: vec![addr("10.0.0.1:47500")],
            members: Mutex::new(vec![MemberInfo::new(1u64, vec![addr("10.0.0.1:47500")])]),
        });
        let stack = RendezvousStack::new(
            RendezvousConfig::new("main"),
            &LocalIdentity::new("10.0.0.1", "node1"),
            Arc::clone(&registry),
            Arc::new(MemoryLock::new()),
            runtime,
        )
        .unwrap();
        (stack, registry)
    }

    #[tokio::test]
    async fn test_start_registers_and_reconciles() {
        let (mut stack, registry) = make_stack();
        assert!(!stack.is_started());

        stack.start().await.unwrap();
        assert!(stack.is_started());

        // One registration entry plus the canonical list.
        let mut keys = Vec::new();
        registry
            .visit(&KeyPrefix::namespace("cluster-instance-members"), |k, _| {
                keys.push(k.clone());
                true
            })
            .await
            .unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys.iter().any(|k| k.is_canonical()));
        assert!(matches!(
            stack.registrar().registration_state(),
            RegistrationState::Registered(_)
        ));

        stack.shutdown().await.unwrap();
        assert!(!stack.is_started());
        assert_eq!(
            stack.registrar().registration_state(),
            RegistrationState::Deregistered
        );
        // The entry is gone; the canonical list survives for the next node.
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let (mut stack, _registry) = make_stack();
        stack.start().await.unwrap();
        let err = stack.start().await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        stack.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_startup_lock_contention_rolls_back_registration() {
        let registry = Arc::new(MemoryRegistry::new());
        let lock = Arc::new(MemoryLock::new());
        let runtime = Arc::new(StaticRuntime {
            local: vec![addr("10.0.0.1:47500")],
            members: Mutex::new(vec![MemberInfo::new(1u64, vec![addr("10.0.0.1:47500")])]),
        });
        let config = RendezvousConfig::new("main")
            .with_startup_lock_retry_wait(std::time::Duration::ZERO)
            .with_startup_lock_retry_count(2);
        let mut stack = RendezvousStack::new(
            config,
            &LocalIdentity::new("10.0.0.1", "node1"),
            Arc::clone(&registry),
            Arc::clone(&lock),
            runtime,
        )
        .unwrap();

        let held = lock
            .acquire(
                "cluster-instance-members",
                std::time::Duration::from_secs(10),
                std::time::Duration::ZERO,
                1,
            )
            .await
            .unwrap();

        let err = stack.start().await.unwrap_err();
        assert!(matches!(err, Error::LockAcquisition { .. }));
        assert!(!stack.is_started());
        // The registration written before the failed reconcile was undone.
        assert_eq!(registry.len(), 0);

        lock.release("cluster-instance-members", held).await.unwrap();
    }
}
