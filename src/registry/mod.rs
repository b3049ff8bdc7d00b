//! Durable member registry abstraction.
//!
//! The registry is the rendezvous point: a shared key-value store (typically
//! the host application's database-backed attribute store) where members
//! advertise their reachable addresses so that starting nodes can bootstrap
//! without a hand-maintained seed list.
//!
//! Keys are composite. Under one namespace, an instance has a canonical
//! address list plus one entry per registration attempt:
//!
//! ```text
//! {namespace, instance}                    -> canonical address list
//! {namespace, instance, registration-id}  -> one member's address(es)
//! ```
//!
//! Backends implement [`MemberRegistry`]. Reads and writes are expected to
//! run inside whatever transaction/retry wrapper the host store provides;
//! this crate treats every backend failure as transient and either propagates
//! it ([`crate::Error::Store`]) or abandons the attempt, depending on the
//! calling path.

use std::future::Future;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::address::{AddressParseError, MemberAddress, RegistrationId};
use crate::error::StoreError;

mod memory;
mod switch;

pub use memory::MemoryRegistry;
pub use switch::SwitchableRegistry;

/// Composite key of one registry row.
///
/// A key without a registration id addresses the instance's canonical list;
/// with one it addresses a single member's registration entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegistryKey {
    namespace: String,
    instance: String,
    registration: Option<RegistrationId>,
}

impl RegistryKey {
    /// Key of the canonical address list for an instance.
    pub fn canonical(namespace: impl Into<String>, instance: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            instance: instance.into(),
            registration: None,
        }
    }

    /// Key of a single registration entry.
    pub fn entry(
        namespace: impl Into<String>,
        instance: impl Into<String>,
        registration: RegistrationId,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            instance: instance.into(),
            registration: Some(registration),
        }
    }

    /// The namespace component.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The instance name component.
    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// The registration id component, absent on the canonical-list key.
    pub const fn registration(&self) -> Option<&RegistrationId> {
        self.registration.as_ref()
    }

    /// Whether this is the canonical-list key.
    pub const fn is_canonical(&self) -> bool {
        self.registration.is_none()
    }
}

impl std::fmt::Display for RegistryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.registration {
            Some(id) => write!(f, "{}/{}/{}", self.namespace, self.instance, id),
            None => write!(f, "{}/{}", self.namespace, self.instance),
        }
    }
}

/// Key prefix for enumeration: a whole namespace, or one instance within it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPrefix {
    namespace: String,
    instance: Option<String>,
}

impl KeyPrefix {
    /// All keys in a namespace.
    pub fn namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            instance: None,
        }
    }

    /// All keys of one instance within a namespace.
    pub fn instance(namespace: impl Into<String>, instance: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            instance: Some(instance.into()),
        }
    }

    /// Whether a key falls under this prefix.
    pub fn matches(&self, key: &RegistryKey) -> bool {
        key.namespace == self.namespace
            && self
                .instance
                .as_deref()
                .map(|instance| key.instance == instance)
                .unwrap_or(true)
    }
}

impl std::fmt::Display for KeyPrefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.instance {
            Some(instance) => write!(f, "{}/{}", self.namespace, instance),
            None => write!(f, "{}", self.namespace),
        }
    }
}

/// Value of one registry row: a single address string, or an ordered list.
///
/// Address strings are stored as written (`host:port`, IPv6 bracketed); they
/// are parsed lazily on read so one malformed entry never poisons a whole
/// enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RegistryValue {
    /// Exactly one address.
    Single(String),
    /// An ordered list of addresses.
    List(Vec<String>),
}

impl RegistryValue {
    /// Build a value from addresses: `Single` for one, `List` otherwise.
    pub fn from_addresses<'a>(addresses: impl IntoIterator<Item = &'a MemberAddress>) -> Self {
        let mut strings: Vec<String> = addresses.into_iter().map(|a| a.to_string()).collect();
        if strings.len() == 1 {
            Self::Single(strings.remove(0))
        } else {
            Self::List(strings)
        }
    }

    /// The raw address strings, in stored order.
    pub fn addresses(&self) -> impl Iterator<Item = &str> {
        match self {
            Self::Single(addr) => std::slice::from_ref(addr).iter().map(String::as_str),
            Self::List(addrs) => addrs.as_slice().iter().map(String::as_str),
        }
    }

    /// The stored addresses parsed one by one.
    ///
    /// Callers skip (and typically warn about) the `Err` items; a malformed
    /// address invalidates only itself.
    pub fn member_addresses(
        &self,
    ) -> impl Iterator<Item = Result<MemberAddress, AddressParseError>> + '_ {
        self.addresses().map(str::parse)
    }

    /// Number of stored address strings.
    pub fn len(&self) -> usize {
        match self {
            Self::Single(_) => 1,
            Self::List(addrs) => addrs.len(),
        }
    }

    /// Whether no address strings are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Durable key-value store the registrar records member addresses in.
///
/// Implementations must tolerate concurrent callers from multiple processes;
/// cross-process write ordering is the registrar's problem (it serializes
/// reconciliation writes through [`crate::DistributedLock`]). Errors are
/// opaque to this crate and always treated as transient.
pub trait MemberRegistry: Send + Sync {
    /// Read one row.
    fn get(
        &self,
        key: &RegistryKey,
    ) -> impl Future<Output = Result<Option<RegistryValue>, StoreError>> + Send;

    /// Write one row, replacing any previous value.
    fn set(
        &self,
        key: RegistryKey,
        value: RegistryValue,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Delete one row, returning the previous value if any.
    fn remove(
        &self,
        key: &RegistryKey,
    ) -> impl Future<Output = Result<Option<RegistryValue>, StoreError>> + Send;

    /// Enumerate rows under a prefix in key order.
    ///
    /// The visitor returns `false` to stop early. It is called with the
    /// backend's internal state borrowed, so it must not call back into the
    /// registry.
    fn visit<F>(
        &self,
        prefix: &KeyPrefix,
        visit: F,
    ) -> impl Future<Output = Result<(), StoreError>> + Send
    where
        F: FnMut(&RegistryKey, &RegistryValue) -> bool + Send;
}

/// Milliseconds since the Unix epoch.
pub fn current_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
