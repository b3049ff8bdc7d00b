//! Topology events and the discovery event listener.
//!
//! The clustering runtime invokes the listener inline from its event thread
//! on every join/leave/fail. The listener is strictly synchronous and must
//! return promptly: it mutates process-local state (peer mappings, pending
//! exclusions) and enqueues reconcile requests, never performs I/O and never
//! touches the distributed lock. The actual registry work happens on the
//! [`crate::ReconcileWorker`] draining the queue.

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use async_channel::{Sender, TrySendError};
use tracing::{debug, warn};

use crate::address::MemberAddress;
use crate::lock::DistributedLock;
use crate::registrar::MemberAddressRegistrar;
use crate::registry::MemberRegistry;
use crate::translator::{AddressTranslator, MappingSet, PeerMappingTable};

/// One cluster member as reported by the runtime's topology snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberInfo<I> {
    /// The runtime's node id.
    pub id: I,
    /// Client nodes never hold data and are never registered.
    pub is_client: bool,
    /// Whether the member runs this subsystem and registers itself.
    pub self_registering: bool,
    /// The member's externally advertised addresses.
    pub addresses: Vec<MemberAddress>,
    /// The member's advertised address mappings, empty if none.
    pub mappings: MappingSet,
}

impl<I> MemberInfo<I> {
    /// A server member that registers itself and advertises no mappings.
    pub fn new(id: I, addresses: Vec<MemberAddress>) -> Self {
        Self {
            id,
            is_client: false,
            self_registering: true,
            addresses,
            mappings: MappingSet::new(),
        }
    }

    /// Mark the member as a client node.
    pub fn client(mut self) -> Self {
        self.is_client = true;
        self
    }

    /// Mark the member as unable to register itself.
    pub fn without_self_registration(mut self) -> Self {
        self.self_registering = false;
        self
    }

    /// Attach the member's advertised mapping set.
    pub fn with_mappings(mut self, mappings: MappingSet) -> Self {
        self.mappings = mappings;
        self
    }
}

/// A topology change as delivered by the runtime's discovery layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberEvent<I> {
    /// A member joined the topology.
    Joined(MemberInfo<I>),
    /// A member left cleanly.
    Left(MemberInfo<I>),
    /// A member was detected as failed.
    Failed(MemberInfo<I>),
}

impl<I> MemberEvent<I> {
    /// The member the event is about.
    pub fn member(&self) -> &MemberInfo<I> {
        match self {
            Self::Joined(info) | Self::Left(info) | Self::Failed(info) => info,
        }
    }

    /// Short event name for logging.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Joined(_) => "joined",
            Self::Left(_) => "left",
            Self::Failed(_) => "failed",
        }
    }
}

/// The crate's view of the clustering runtime it plugs into.
///
/// `members` must reflect the topology after the event currently being
/// dispatched, include this node itself, and never include client nodes'
/// data responsibilities (clients are reported but flagged). Both methods
/// are synchronous snapshots; implementations should return quickly.
pub trait ClusterRuntime<I>: Send + Sync {
    /// Current topology snapshot, this node included.
    fn members(&self) -> Vec<MemberInfo<I>>;

    /// This process's candidate local addresses.
    fn local_addresses(&self) -> Vec<MemberAddress>;
}

/// Synchronous sink for discovery events.
///
/// Wiring: the runtime calls [`Self::on_event`]; joins of members that
/// cannot register themselves are turned into reconcile requests on the
/// bounded queue (a full queue means one is already pending — the request
/// coalesces); departures record address exclusions with the registrar and
/// drop the peer's learned mappings. Any mapping change rebuilds the
/// translator from the static set plus all remaining peer sets.
pub struct DiscoveryEventListener<I, R, L, C> {
    registrar: Arc<MemberAddressRegistrar<I, R, L, C>>,
    translator: Arc<AddressTranslator>,
    peer_mappings: Arc<PeerMappingTable<I>>,
    static_mappings: MappingSet,
    reconcile_tx: Sender<()>,
}

impl<I, R, L, C> DiscoveryEventListener<I, R, L, C>
where
    I: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    R: MemberRegistry,
    L: DistributedLock,
    C: ClusterRuntime<I>,
{
    /// Wire a listener to its collaborators.
    pub fn new(
        registrar: Arc<MemberAddressRegistrar<I, R, L, C>>,
        translator: Arc<AddressTranslator>,
        peer_mappings: Arc<PeerMappingTable<I>>,
        static_mappings: MappingSet,
        reconcile_tx: Sender<()>,
    ) -> Self {
        Self {
            registrar,
            translator,
            peer_mappings,
            static_mappings,
            reconcile_tx,
        }
    }

    /// Handle one discovery event. Synchronous, non-blocking, cheap.
    pub fn on_event(&self, event: &MemberEvent<I>) {
        let member = event.member();
        if member.is_client {
            debug!(kind = event.kind(), member = ?member.id, "ignoring client node event");
            return;
        }
        debug!(kind = event.kind(), member = ?member.id, "handling discovery event");

        match event {
            MemberEvent::Joined(info) => {
                if !info.mappings.is_empty()
                    && self.peer_mappings.insert(info.id.clone(), info.mappings.clone())
                {
                    self.rebuild_translator();
                }
                // A member that cannot write its own registration needs
                // someone else to reconcile on its behalf.
                if !info.self_registering {
                    self.request_reconcile();
                }
            }
            MemberEvent::Left(info) | MemberEvent::Failed(info) => {
                self.registrar.record_member_departure(&info.id);
                if self.peer_mappings.remove(&info.id) {
                    self.rebuild_translator();
                }
            }
        }
    }

    fn request_reconcile(&self) {
        match self.reconcile_tx.try_send(()) {
            Ok(()) => debug!("queued reconcile request"),
            Err(TrySendError::Full(_)) => {
                debug!("reconcile request already pending, coalescing");
            }
            Err(TrySendError::Closed(_)) => {
                warn!("reconcile queue closed, dropping request");
            }
        }
    }

    fn rebuild_translator(&self) {
        let mut sources = Vec::with_capacity(1 + self.peer_mappings.len());
        sources.push(self.static_mappings.clone());
        sources.extend(self.peer_mappings.snapshot());
        self.translator.rebuild(sources.iter());
    }
}
