//! # member-rendezvous
//!
//! Registry-backed member discovery and address translation for clustered
//! services.
//!
//! When a node binds to one address but must be dialed at another (NAT,
//! container networking, load balancers), and when starting nodes need to
//! find existing members without a hand-maintained seed list, two pieces
//! cooperate: an address translator fed from static configuration and
//! peer-advertised mappings, and a durable member registry reconciled
//! against the live topology under a distributed lock.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Clustering runtime                           │
//! │        (discovery protocol, topology, member attributes)         │
//! └───────┬──────────────────┬───────────────────────┬──────────────┘
//!         │ resolve()        │ seed addresses        │ join/leave/fail
//! ┌───────▼────────┐ ┌───────▼──────────┐ ┌──────────▼──────────────┐
//! │ AddressTrans-  │ │ BootstrapIpFinder│ │ DiscoveryEventListener  │
//! │ lator          │ │ (translated set) │ │ (sync, enqueues work)   │
//! └───────▲────────┘ └───────▲──────────┘ └──────────┬──────────────┘
//!         │ rebuild          │ seeds                 │ reconcile queue
//! ┌───────┴──────────────────┴────────────┐ ┌────────▼──────────────┐
//! │        MemberAddressRegistrar         │◄┤   ReconcileWorker     │
//! │  (register / refresh / reconcile)     │ └───────────────────────┘
//! └───────┬───────────────────┬───────────┘
//!         │                   │
//! ┌───────▼─────────┐ ┌───────▼─────────┐
//! │ MemberRegistry  │ │ DistributedLock │
//! │ (durable store) │ │ (TTL'd, named)  │
//! └─────────────────┘ └─────────────────┘
//! ```
//!
//! ## API Entry Points
//!
//! | API | Use Case |
//! |-----|----------|
//! | [`RendezvousStack`] | Production - full wiring plus lifecycle |
//! | [`MemberAddressRegistrar`] | Manual lifecycle control, custom integration |
//! | [`AddressTranslator`] | Address translation only, bring your own registry |
//!
//! ## Example
//!
//! ```ignore
//! use member_rendezvous::{
//!     LocalIdentity, MemberEvent, MemoryLock, MemoryRegistry, RendezvousConfig,
//!     RendezvousStack,
//! };
//!
//! let config = RendezvousConfig::new("production")
//!     .with_external_host("public.example.com")
//!     .with_external_comm_port_base(48100);
//!
//! let mut stack = RendezvousStack::new(
//!     config,
//!     &LocalIdentity::new("192.168.1.5", "node1"),
//!     registry,   // the host's durable store
//!     lock,       // the host's lock service
//!     runtime,    // the host's clustering runtime
//! )?;
//!
//! // Install stack.finder() and stack.translator() into the runtime,
//! // advertise stack.self_mappings() as member attributes, then:
//! stack.start().await?;
//!
//! // Route discovery events into the listener:
//! stack.listener().on_event(&MemberEvent::Joined(member));
//!
//! // At shutdown:
//! stack.shutdown().await?;
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]
#![allow(clippy::type_complexity)]

mod address;
mod config;
mod error;
mod events;
mod finder;
mod lock;
mod registrar;
pub mod registry;
mod stack;
mod translator;
mod worker;

#[cfg(feature = "metrics")]
#[cfg_attr(docsrs, doc(cfg(feature = "metrics")))]
pub mod metrics;

// Re-export address types
pub use address::{AddressParseError, MemberAddress, RegistrationId};

// Re-export config types
pub use config::{PortRange, RendezvousConfig};

// Re-export error types
pub use error::{Error, ErrorKind, Result, StoreError};

// Re-export event and runtime-facing types
pub use events::{ClusterRuntime, DiscoveryEventListener, MemberEvent, MemberInfo};

// Re-export the seed-address finder
pub use finder::BootstrapIpFinder;

// Re-export lock types
pub use lock::{DistributedLock, LockError, LockToken, MemoryLock};

// Re-export registrar types
pub use registrar::{
    CleanupAction, FailureCleanup, MemberAddressRegistrar, ReconcileOutcome, RegistrationState,
    MEMBER_NAMESPACE,
};

// Re-export registry types
pub use registry::{
    KeyPrefix, MemberRegistry, MemoryRegistry, RegistryKey, RegistryValue, SwitchableRegistry,
};

// Re-export stack assembly
pub use stack::RendezvousStack;

// Re-export translation types
pub use translator::{
    build_self_mappings, build_self_mappings_with, AddressTranslator, ExternalHost, LocalIdentity,
    MappingSet, PeerMappingTable, TranslatorStats,
};

// Re-export the background worker
pub use worker::ReconcileWorker;
