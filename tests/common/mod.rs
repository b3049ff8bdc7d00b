//! Shared test utilities for member-rendezvous tests.
//!
//! Provides a scriptable cluster-runtime double plus small constructors for
//! the usual registrar/registry/lock wiring, so scenario tests read as
//! topology scripts instead of setup noise.

#![allow(dead_code)]

use std::sync::Arc;

use parking_lot::Mutex;

use member_rendezvous::{
    AddressTranslator, ClusterRuntime, MemberAddress, MemberAddressRegistrar, MemberInfo,
    MemoryLock, MemoryRegistry, RendezvousConfig,
};

/// Node id type used throughout the tests.
pub type NodeId = u64;

/// A cluster runtime whose topology the test script mutates directly.
pub struct ScriptedRuntime {
    local: Mutex<Vec<MemberAddress>>,
    members: Mutex<Vec<MemberInfo<NodeId>>>,
}

impl ScriptedRuntime {
    /// Runtime reporting the given local candidate addresses and an empty
    /// topology.
    pub fn new(local: Vec<MemberAddress>) -> Arc<Self> {
        Arc::new(Self {
            local: Mutex::new(local),
            members: Mutex::new(Vec::new()),
        })
    }

    /// Replace the whole topology snapshot.
    pub fn set_members(&self, members: Vec<MemberInfo<NodeId>>) {
        *self.members.lock() = members;
    }

    /// Add one member to the topology.
    pub fn add_member(&self, member: MemberInfo<NodeId>) {
        self.members.lock().push(member);
    }

    /// Remove one member from the topology.
    pub fn remove_member(&self, id: NodeId) {
        self.members.lock().retain(|m| m.id != id);
    }
}

impl ClusterRuntime<NodeId> for ScriptedRuntime {
    fn members(&self) -> Vec<MemberInfo<NodeId>> {
        self.members.lock().clone()
    }

    fn local_addresses(&self) -> Vec<MemberAddress> {
        self.local.lock().clone()
    }
}

/// Registrar wired to in-memory collaborators.
pub type TestRegistrar =
    MemberAddressRegistrar<NodeId, MemoryRegistry, MemoryLock, ScriptedRuntime>;

/// Parse a test address, panicking on typos.
pub fn addr(s: &str) -> MemberAddress {
    s.parse().expect("test address must parse")
}

/// Config for the `main` instance with lock retries tightened for tests.
pub fn test_config() -> RendezvousConfig {
    RendezvousConfig::new("main")
        .with_startup_lock_retry_wait(std::time::Duration::ZERO)
        .with_startup_lock_retry_count(2)
}

/// Wire a registrar around shared in-memory collaborators.
pub fn make_registrar(
    config: RendezvousConfig,
    registry: &Arc<MemoryRegistry>,
    lock: &Arc<MemoryLock>,
    runtime: &Arc<ScriptedRuntime>,
) -> Arc<TestRegistrar> {
    Arc::new(
        MemberAddressRegistrar::new(
            config,
            Arc::new(AddressTranslator::new()),
            Arc::clone(registry),
            Arc::clone(lock),
            Arc::clone(runtime),
        )
        .expect("test config must validate"),
    )
}
