//! Translation between locally bound and externally reachable addresses.
//!
//! A node behind NAT or container networking binds to an address other
//! members cannot dial. The [`AddressTranslator`] answers "which addresses
//! should someone else use to reach `local`?" from an effective mapping
//! merged out of this node's static configuration and mapping sets learned
//! from peers.
//!
//! Lookups consult three mapping tiers. An explicit socket mapping, when
//! one matches, answers alone; otherwise host mappings rewrite the host
//! part and keep the port, collecting candidates from the IP form and the
//! name form in that order:
//!
//! ```text
//! resolve(local)
//!   1. explicit socket mapping   (host:port -> host:port)   match answers
//!   2. host-by-IP mapping        (ip literal -> host, port kept)
//!   3. host-by-name mapping      (host name  -> host, port kept)
//!   none matched               -> { local } (identity)
//! ```
//!
//! The effective mapping is rebuilt as a whole and swapped in atomically
//! under a write lock; readers keep resolving against the previous snapshot
//! until the swap completes. Reads vastly outnumber writes (every outbound
//! connection resolves, rebuilds happen on topology change), hence a
//! reader-writer lock rather than a mutex.

use std::collections::HashMap;
use std::net::{IpAddr, ToSocketAddrs};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace};

use crate::address::MemberAddress;
use crate::config::{PortRange, RendezvousConfig};

#[cfg(feature = "metrics")]
use crate::metrics;

/// One source's contribution of address mappings.
///
/// A source is either this node's static configuration or one peer's
/// advertised mapping set. Within a source each local key maps to a single
/// target (later inserts for the same key replace the target in place);
/// multiple targets per key arise from merging several sources.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MappingSet {
    socket: Vec<(MemberAddress, MemberAddress)>,
    host: Vec<(String, String)>,
}

impl MappingSet {
    /// Create an empty mapping set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Map a full socket address to an external equivalent.
    pub fn add_socket_mapping(&mut self, from: MemberAddress, to: MemberAddress) {
        if let Some(entry) = self.socket.iter_mut().find(|(f, _)| *f == from) {
            entry.1 = to;
        } else {
            self.socket.push((from, to));
        }
    }

    /// Map a host (name or IP literal) to an external host; ports are kept.
    pub fn add_host_mapping(&mut self, from: impl Into<String>, to: impl Into<String>) {
        let from = from.into();
        let to = to.into();
        if let Some(entry) = self.host.iter_mut().find(|(f, _)| *f == from) {
            entry.1 = to;
        } else {
            self.host.push((from, to));
        }
    }

    /// Socket-level mappings in insertion order.
    pub fn socket_mappings(&self) -> &[(MemberAddress, MemberAddress)] {
        &self.socket
    }

    /// Host-level mappings in insertion order.
    pub fn host_mappings(&self) -> &[(String, String)] {
        &self.host
    }

    /// Whether this set contains no mappings at all.
    pub fn is_empty(&self) -> bool {
        self.socket.is_empty() && self.host.is_empty()
    }

    fn contains_socket_key(&self, from: &MemberAddress) -> bool {
        self.socket.iter().any(|(f, _)| f == from)
    }

    fn contains_host_key(&self, from: &str) -> bool {
        self.host.iter().any(|(f, _)| f == from)
    }
}

/// Effective mapping snapshot, consulted by `resolve`.
#[derive(Debug, Default)]
struct EffectiveMappings {
    socket: HashMap<MemberAddress, Vec<MemberAddress>>,
    host_by_ip: HashMap<IpAddr, Vec<String>>,
    host_by_name: HashMap<String, Vec<String>>,
}

impl EffectiveMappings {
    fn merge(&mut self, set: &MappingSet) {
        for (from, to) in &set.socket {
            push_unique(self.socket.entry(from.clone()).or_default(), to.clone());
        }
        for (from, to) in &set.host {
            match from.parse::<IpAddr>() {
                Ok(ip) => push_unique(self.host_by_ip.entry(ip).or_default(), to.clone()),
                Err(_) => push_unique(
                    self.host_by_name.entry(from.clone()).or_default(),
                    to.clone(),
                ),
            }
        }
    }

    fn key_counts(&self) -> (usize, usize) {
        (
            self.socket.len(),
            self.host_by_ip.len() + self.host_by_name.len(),
        )
    }
}

fn push_unique<T: PartialEq>(values: &mut Vec<T>, value: T) {
    if !values.contains(&value) {
        values.push(value);
    }
}

/// Counts of distinct mapped keys in the current effective snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranslatorStats {
    /// Distinct socket-address keys.
    pub socket_keys: usize,
    /// Distinct host keys (IP and name tiers combined).
    pub host_keys: usize,
}

/// Read-mostly map from local addresses to externally reachable equivalents.
///
/// `resolve` is total: an address nobody mapped resolves to itself. See the
/// module docs for tier ordering.
#[derive(Debug, Default)]
pub struct AddressTranslator {
    effective: RwLock<EffectiveMappings>,
}

impl AddressTranslator {
    /// Create a translator with no mappings (everything resolves to itself).
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a local address to its externally reachable equivalents.
    ///
    /// A socket mapping answers alone when one matches; otherwise host
    /// mappings contribute, IP tier before name tier, first-discovered
    /// first within a tier, deduplicated. Never empty: with no mapping
    /// the result is `[addr]`.
    pub fn resolve(&self, addr: &MemberAddress) -> Vec<MemberAddress> {
        let effective = self.effective.read();
        let mut out: Vec<MemberAddress> = Vec::new();

        if let Some(targets) = effective.socket.get(addr) {
            for target in targets {
                push_unique(&mut out, target.clone());
            }
        }

        // Host tiers answer only when no socket mapping matched.
        if out.is_empty() {
            if let Some(ip) = addr.ip() {
                if let Some(hosts) = effective.host_by_ip.get(&ip) {
                    for host in hosts {
                        push_unique(&mut out, addr.with_host(host.clone()));
                    }
                }
            }
            if let Some(hosts) = effective.host_by_name.get(addr.host()) {
                for host in hosts {
                    push_unique(&mut out, addr.with_host(host.clone()));
                }
            }
        }

        if out.is_empty() {
            out.push(addr.clone());
        }
        trace!(%addr, resolved = out.len(), "resolved address");
        out
    }

    /// Recompute the effective mapping from all sources and swap it in.
    ///
    /// Sources are merged in iteration order, so callers pass the static
    /// self-mapping first and learned peer sets after it. Concurrent
    /// `resolve` calls see either the old or the new snapshot, never a
    /// partially merged one.
    pub fn rebuild<'a>(&self, sources: impl IntoIterator<Item = &'a MappingSet>) {
        let mut next = EffectiveMappings::default();
        let mut source_count = 0usize;
        for set in sources {
            next.merge(set);
            source_count += 1;
        }
        let (socket_keys, host_keys) = next.key_counts();

        *self.effective.write() = next;

        debug!(
            sources = source_count,
            socket_keys, host_keys, "rebuilt effective address mappings"
        );
        #[cfg(feature = "metrics")]
        {
            metrics::record_translator_rebuild();
            metrics::set_translator_mappings(socket_keys + host_keys);
        }
    }

    /// Key counts of the current snapshot.
    pub fn stats(&self) -> TranslatorStats {
        let (socket_keys, host_keys) = self.effective.read().key_counts();
        TranslatorStats {
            socket_keys,
            host_keys,
        }
    }
}

/// Mapping sets learned from peers, keyed by node id.
///
/// The event listener inserts a peer's advertised set on join and removes it
/// on leave/fail; either mutation reports whether a translator rebuild is
/// needed.
#[derive(Debug)]
pub struct PeerMappingTable<I> {
    peers: Mutex<HashMap<I, MappingSet>>,
}

impl<I> PeerMappingTable<I>
where
    I: Clone + Eq + std::hash::Hash,
{
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
        }
    }

    /// Learn a peer's mapping set. Returns true if the effective state
    /// changed (new peer with a non-empty set, or a different set than
    /// previously known).
    pub fn insert(&self, id: I, set: MappingSet) -> bool {
        let mut peers = self.peers.lock();
        if set.is_empty() {
            return peers.remove(&id).map(|old| !old.is_empty()).unwrap_or(false);
        }
        match peers.insert(id, set.clone()) {
            Some(old) => old != set,
            None => true,
        }
    }

    /// Forget a departed peer's mappings. Returns true if any were known.
    pub fn remove(&self, id: &I) -> bool {
        self.peers.lock().remove(id).is_some()
    }

    /// Clone out all currently known peer sets.
    pub fn snapshot(&self) -> Vec<MappingSet> {
        self.peers.lock().values().cloned().collect()
    }

    /// Number of peers with known mappings.
    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    /// Whether no peer mappings are known.
    pub fn is_empty(&self) -> bool {
        self.peers.lock().is_empty()
    }
}

impl<I> Default for PeerMappingTable<I>
where
    I: Clone + Eq + std::hash::Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

/// This node's identity as seen from inside: the primary local host plus all
/// candidate addresses and host names the runtime enumerated at startup.
///
/// `new` seeds the candidate lists with the primary values, mirroring how
/// runtimes report the primary among its own candidates.
#[derive(Debug, Clone, Default)]
pub struct LocalIdentity {
    /// Primary local IP address as a string, if known.
    pub primary_address: Option<String>,
    /// Primary local host name, if known.
    pub primary_hostname: Option<String>,
    /// All candidate local addresses (IP literals).
    pub addresses: Vec<String>,
    /// All candidate local host names.
    pub hostnames: Vec<String>,
}

impl LocalIdentity {
    /// Create an identity from the primary local address and host name.
    pub fn new(primary_address: impl Into<String>, primary_hostname: impl Into<String>) -> Self {
        let primary_address = primary_address.into();
        let primary_hostname = primary_hostname.into();
        Self {
            addresses: vec![primary_address.clone()],
            hostnames: vec![primary_hostname.clone()],
            primary_address: Some(primary_address),
            primary_hostname: Some(primary_hostname),
        }
    }

    /// Add further candidate local addresses (builder pattern).
    pub fn with_addresses(mut self, addresses: impl IntoIterator<Item = String>) -> Self {
        for addr in addresses {
            push_unique(&mut self.addresses, addr);
        }
        self
    }

    /// Add further candidate local host names (builder pattern).
    pub fn with_hostnames(mut self, hostnames: impl IntoIterator<Item = String>) -> Self {
        for host in hostnames {
            push_unique(&mut self.hostnames, host);
        }
        self
    }
}

/// The externally reachable identity mappings are built toward.
///
/// Prefers the IP over the name: name resolution adds latency to every
/// inter-node call, so when the external host resolves, peers are pointed at
/// the IP. A loopback or any-local external identity yields neither, which
/// suppresses mapping entirely.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExternalHost {
    /// Resolved external IP, if resolution succeeded.
    pub address: Option<String>,
    /// Configured external host name.
    pub name: Option<String>,
}

impl ExternalHost {
    /// Resolve a configured external host.
    ///
    /// Resolution failure is not an error: the value is kept as an opaque
    /// host name and mapping continues name-based (degraded but functional).
    pub fn resolve(host: &str) -> Self {
        let resolved = (host, 0u16)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .map(|sock| sock.ip());
        match resolved {
            Some(ip) if ip.is_loopback() || ip.is_unspecified() => {
                debug!(host, %ip, "external host is a loopback / any-local address, not mapping");
                Self::default()
            }
            Some(ip) => {
                debug!(host, %ip, "external host resolved");
                Self {
                    address: Some(ip.to_string()),
                    name: Some(host.to_owned()),
                }
            }
            None => {
                info!(host, "external host could not be resolved to an IP");
                if host_is_loopback(host) {
                    Self::default()
                } else {
                    Self {
                        address: None,
                        name: Some(host.to_owned()),
                    }
                }
            }
        }
    }

    /// External identity when no external host is configured: the node's own
    /// primary host, so port-base overrides still produce socket mappings.
    pub fn from_local(local: &LocalIdentity) -> Self {
        match &local.primary_address {
            Some(addr) if !host_is_loopback(addr) && !host_is_any_local(addr) => Self {
                address: Some(addr.clone()),
                name: local.primary_hostname.clone(),
            },
            _ => Self::default(),
        }
    }

    fn is_unusable(&self) -> bool {
        self.address.is_none() && self.name.is_none()
    }
}

fn host_is_loopback(host: &str) -> bool {
    host.eq_ignore_ascii_case("localhost")
        || host
            .parse::<IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false)
}

fn host_is_any_local(host: &str) -> bool {
    host.parse::<IpAddr>()
        .map(|ip| ip.is_unspecified())
        .unwrap_or(false)
}

/// Build this node's static mapping set from its configuration.
///
/// Returns an empty set unless an external host or at least one external
/// port base is configured. The external host is resolved once here; use
/// [`build_self_mappings_with`] to supply a pre-resolved identity.
pub fn build_self_mappings(config: &RendezvousConfig, local: &LocalIdentity) -> MappingSet {
    debug!(
        external_host = config.external_host.as_deref().unwrap_or(""),
        external_disco_base = ?config.discovery_ports.external_base,
        external_comm_base = ?config.comm_ports.external_base,
        external_time_base = ?config.time_ports.external_base,
        "building own address mappings"
    );

    let external_host = config
        .external_host
        .as_deref()
        .map(str::trim)
        .filter(|h| !h.is_empty());
    let any_port_mapped = config.discovery_ports.external_base.is_some()
        || config.comm_ports.external_base.is_some()
        || config.time_ports.external_base.is_some();
    if external_host.is_none() && !any_port_mapped {
        return MappingSet::new();
    }

    let external = match external_host {
        Some(host) => ExternalHost::resolve(host),
        None => ExternalHost::from_local(local),
    };
    build_self_mappings_with(config, local, &external)
}

/// Build the static mapping set toward an already-resolved external identity.
pub fn build_self_mappings_with(
    config: &RendezvousConfig,
    local: &LocalIdentity,
    external: &ExternalHost,
) -> MappingSet {
    let mut mappings = MappingSet::new();
    if external.is_unusable() {
        return mappings;
    }

    map_own_hosts(&mut mappings, local, external);
    map_own_sockets(&mut mappings, local, external, &config.comm_ports);
    map_own_sockets(&mut mappings, local, external, &config.discovery_ports);
    map_own_sockets(&mut mappings, local, external, &config.time_ports);
    mappings
}

fn map_own_hosts(mappings: &mut MappingSet, local: &LocalIdentity, external: &ExternalHost) {
    let local_addr = local.primary_address.as_deref();
    let local_name = local.primary_hostname.as_deref();

    // Host mappings only make sense when the external identity differs from
    // the local one; equal identities leave just the port-offset mappings.
    let differs = external
        .address
        .as_deref()
        .map(|a| Some(a) != local_addr)
        .unwrap_or(false)
        || external
            .name
            .as_deref()
            .map(|n| Some(n) != local_name)
            .unwrap_or(false);
    if !differs {
        return;
    }

    if let Some(la) = local_addr {
        if !host_is_loopback(la) && !host_is_any_local(la) {
            // Primary local address and name, preferring the external IP.
            match (external.address.as_deref(), external.name.as_deref()) {
                (Some(ea), _) if Some(ea) != local_addr => mappings.add_host_mapping(la, ea),
                (_, Some(en)) if Some(en) != local_name => mappings.add_host_mapping(la, en),
                _ => {}
            }
            if let Some(ln) = local_name.filter(|ln| Some(*ln) != local_addr) {
                match (external.address.as_deref(), external.name.as_deref()) {
                    (Some(ea), _) if ea != ln => mappings.add_host_mapping(ln, ea),
                    (_, Some(en)) if en != ln => mappings.add_host_mapping(ln, en),
                    _ => {}
                }
            }
        }
    }

    for host in &local.hostnames {
        if mappings.contains_host_key(host) {
            continue;
        }
        match (external.address.as_deref(), external.name.as_deref()) {
            (Some(ea), _) if ea != host => mappings.add_host_mapping(host.clone(), ea),
            (_, Some(en)) if en != host => mappings.add_host_mapping(host.clone(), en),
            _ => {}
        }
    }

    for addr in &local.addresses {
        if host_is_loopback(addr) || host_is_any_local(addr) {
            continue;
        }
        if mappings.contains_host_key(addr) {
            continue;
        }
        match (external.address.as_deref(), external.name.as_deref()) {
            (Some(ea), _) if ea != addr => mappings.add_host_mapping(addr.clone(), ea),
            (_, Some(en)) if en != addr => mappings.add_host_mapping(addr.clone(), en),
            _ => {}
        }
    }
}

fn map_own_sockets(
    mappings: &mut MappingSet,
    local: &LocalIdentity,
    external: &ExternalHost,
    ports: &PortRange,
) {
    let Some(external_base) = ports.external_base else {
        return;
    };
    if external_base == ports.base {
        return;
    }

    for offset in 0..=ports.range {
        let (Some(local_port), Some(external_port)) = (
            ports.base.checked_add(offset),
            external_base.checked_add(offset),
        ) else {
            break;
        };

        let local_addr = local.primary_address.as_deref();
        let local_name = local.primary_hostname.as_deref();
        if let Some(la) = local_addr {
            if !host_is_loopback(la) && !host_is_any_local(la) {
                // Primary local socket address, preferring the external IP.
                match (external.address.as_deref(), external.name.as_deref()) {
                    (Some(ea), _) if Some(ea) != local_addr => mappings.add_socket_mapping(
                        MemberAddress::new(la, local_port),
                        MemberAddress::new(ea, external_port),
                    ),
                    (_, Some(en)) if Some(en) != local_name => mappings.add_socket_mapping(
                        MemberAddress::new(la, local_port),
                        MemberAddress::new(en, external_port),
                    ),
                    _ => {}
                }
                if let Some(ln) = local_name.filter(|ln| Some(*ln) != local_addr) {
                    match (external.address.as_deref(), external.name.as_deref()) {
                        (Some(ea), _) if ea != ln => mappings.add_socket_mapping(
                            MemberAddress::new(ln, local_port),
                            MemberAddress::new(ea, external_port),
                        ),
                        (_, Some(en)) if en != ln => mappings.add_socket_mapping(
                            MemberAddress::new(ln, local_port),
                            MemberAddress::new(en, external_port),
                        ),
                        _ => {}
                    }
                }
            }
        }

        for host in &local.hostnames {
            let from = MemberAddress::new(host.clone(), local_port);
            if mappings.contains_socket_key(&from) {
                continue;
            }
            if let Some(target) = external.address.as_deref().or(external.name.as_deref()) {
                mappings.add_socket_mapping(from, MemberAddress::new(target, external_port));
            }
        }

        for addr in &local.addresses {
            if host_is_loopback(addr) || host_is_any_local(addr) {
                continue;
            }
            let from = MemberAddress::new(addr.clone(), local_port);
            if mappings.contains_socket_key(&from) {
                continue;
            }
            if let Some(target) = external.address.as_deref().or(external.name.as_deref()) {
                mappings.add_socket_mapping(from, MemberAddress::new(target, external_port));
            }
        }
    }
}
