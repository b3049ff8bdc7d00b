//! Seed-address source for the discovery runtime.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::address::MemberAddress;
use crate::translator::AddressTranslator;

/// The address set the clustering runtime dials before its own discovery
/// protocol has located any peer.
///
/// Seeded from the member registry at startup and mutated by the runtime as
/// it registers/unregisters addresses while running. Every address is passed
/// through the [`AddressTranslator`] once, on the way in (first resolved
/// candidate), so consumers only ever see externally reachable addresses.
/// Insertion order is kept: registry seeds stay ahead of later additions, so
/// the runtime tries the most promising contacts first.
pub struct BootstrapIpFinder {
    translator: Arc<AddressTranslator>,
    addresses: Mutex<Vec<MemberAddress>>,
}

impl BootstrapIpFinder {
    /// Create an empty finder.
    pub fn new(translator: Arc<AddressTranslator>) -> Self {
        Self {
            translator,
            addresses: Mutex::new(Vec::new()),
        }
    }

    /// Add addresses, translating each and dropping duplicates.
    pub fn register_addresses(&self, addresses: impl IntoIterator<Item = MemberAddress>) {
        let mut stored = self.addresses.lock();
        for addr in addresses {
            let external = self.translate(&addr);
            if !stored.contains(&external) {
                trace!(local = %addr, %external, "registered seed address");
                stored.push(external);
            }
        }
    }

    /// Remove addresses, translating each the same way registration did.
    pub fn unregister_addresses(&self, addresses: impl IntoIterator<Item = MemberAddress>) {
        let mut stored = self.addresses.lock();
        for addr in addresses {
            let external = self.translate(&addr);
            stored.retain(|a| *a != external);
        }
    }

    /// Current seed set, in insertion order.
    pub fn registered_addresses(&self) -> Vec<MemberAddress> {
        self.addresses.lock().clone()
    }

    /// Number of seed addresses.
    pub fn len(&self) -> usize {
        self.addresses.lock().len()
    }

    /// Whether no seed addresses are known.
    pub fn is_empty(&self) -> bool {
        self.addresses.lock().is_empty()
    }

    /// Seed from registry-loaded addresses, logging the outcome.
    pub(crate) fn seed(&self, addresses: Vec<MemberAddress>) {
        let count = addresses.len();
        self.register_addresses(addresses);
        debug!(count, total = self.len(), "seeded bootstrap addresses");
    }

    fn translate(&self, addr: &MemberAddress) -> MemberAddress {
        let mut resolved = self.translator.resolve(addr);
        resolved.remove(0)
    }
}
