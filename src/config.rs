//! Configuration for member discovery and registration.

use std::time::Duration;

use crate::address::MemberAddress;
use crate::error::{Error, Result};

/// Local and external port layout of one clustered service.
///
/// A node listens on `base..=base+range` locally; when an external base is
/// configured, `base+k` is advertised as `external_base+k` for every offset
/// `k` in the range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PortRange {
    /// First local port of the service.
    pub base: u16,
    /// Number of ports beyond the base (inclusive range `base..=base+range`).
    pub range: u16,
    /// Externally visible first port, when the service sits behind a port
    /// mapping. `None` means the local ports are reachable as-is.
    pub external_base: Option<u16>,
}

impl PortRange {
    /// Create a port range with no external mapping.
    pub const fn new(base: u16, range: u16) -> Self {
        Self {
            base,
            range,
            external_base: None,
        }
    }

    /// Set the externally visible base port (builder pattern).
    pub const fn with_external_base(mut self, external_base: u16) -> Self {
        self.external_base = Some(external_base);
        self
    }

    /// Whether this range maps to different external ports.
    pub fn is_mapped(&self) -> bool {
        match self.external_base {
            Some(external) => external != self.base,
            None => false,
        }
    }
}

/// Configuration options for the rendezvous subsystem.
///
/// Only `instance_name` is mandatory. External host/port settings are needed
/// only when the address a node binds to differs from the address other
/// members must dial (NAT, container networking, load balancers).
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RendezvousConfig {
    /// Name of the cluster instance this node participates in. Registry keys
    /// are scoped by this name, so multiple instances can share one store.
    ///
    /// Mandatory; `validate()` rejects an empty name.
    pub instance_name: String,

    /// Externally reachable host (name or IP literal) other members should
    /// dial instead of this node's local addresses.
    ///
    /// When resolvable to an IP, the IP is preferred over the name since name
    /// resolution adds latency to inter-node calls. When resolution fails the
    /// value is kept as an opaque hostname mapping (degraded but functional).
    ///
    /// Default: None
    pub external_host: Option<String>,

    /// Host substituted for loopback local addresses at registration time.
    ///
    /// A node that only knows itself as `127.0.0.1` registers
    /// `local_host:port` instead; without this setting such addresses are
    /// skipped with a warning.
    ///
    /// Default: None
    pub local_host: Option<String>,

    /// Port layout of the discovery service.
    ///
    /// Default: base 47500, range 100, no external mapping
    pub discovery_ports: PortRange,

    /// Port layout of the inter-node communication service.
    ///
    /// Default: base 47100, range 100, no external mapping
    pub comm_ports: PortRange,

    /// Port layout of the time-server service.
    ///
    /// Default: base 31100, range 100, no external mapping
    pub time_ports: PortRange,

    /// Registrations older than this many days are presumed abandoned: they
    /// are skipped and purged during seed loading, regardless of which
    /// process wrote them.
    ///
    /// Must be positive. Default: 30
    pub registration_cutoff_age_days: u32,

    /// Comma-separated `host:port` fallback seeds, consulted only when the
    /// registry yields no usable entries (first node of a fresh cluster, or
    /// an empty store). Whitespace around commas is ignored.
    ///
    /// Default: None
    pub initial_members: Option<String>,

    /// TTL on the reconciliation lock, so a crashed holder cannot block
    /// other members forever.
    ///
    /// Default: 10s
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde_impl"))]
    pub lock_ttl: Duration,

    /// Wait between lock attempts during startup self-registration.
    ///
    /// Default: 2.5s
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde_impl"))]
    pub startup_lock_retry_wait: Duration,

    /// Number of lock attempts during startup self-registration before
    /// startup is aborted. Routine reconciliation always uses a single
    /// attempt.
    ///
    /// Default: 5
    pub startup_lock_retry_count: u32,

    /// Capacity of the reconcile-request queue between the event listener
    /// and the background worker. A full queue coalesces the request into
    /// the one already pending.
    ///
    /// Default: 16
    pub reconcile_queue_capacity: usize,

    /// Interval at which the background worker refreshes this node's own
    /// registration entry.
    ///
    /// Set to `Duration::ZERO` to disable periodic refresh.
    ///
    /// Default: 0 (disabled)
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde_impl"))]
    pub refresh_interval: Duration,
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            instance_name: String::new(),
            external_host: None,
            local_host: None,
            discovery_ports: PortRange::new(47500, 100),
            comm_ports: PortRange::new(47100, 100),
            time_ports: PortRange::new(31100, 100),
            registration_cutoff_age_days: 30,
            initial_members: None,
            lock_ttl: Duration::from_secs(10),
            startup_lock_retry_wait: Duration::from_millis(2500),
            startup_lock_retry_count: 5,
            reconcile_queue_capacity: 16,
            refresh_interval: Duration::ZERO,
        }
    }
}

impl RendezvousConfig {
    /// Create a configuration for the named instance with default values.
    pub fn new(instance_name: impl Into<String>) -> Self {
        Self {
            instance_name: instance_name.into(),
            ..Self::default()
        }
    }

    /// Set the externally reachable host (builder pattern).
    pub fn with_external_host(mut self, host: impl Into<String>) -> Self {
        self.external_host = Some(host.into());
        self
    }

    /// Set the loopback-substitution host (builder pattern).
    pub fn with_local_host(mut self, host: impl Into<String>) -> Self {
        self.local_host = Some(host.into());
        self
    }

    /// Set the external base port of the discovery service (builder pattern).
    pub const fn with_external_discovery_port_base(mut self, base: u16) -> Self {
        self.discovery_ports.external_base = Some(base);
        self
    }

    /// Set the external base port of the communication service (builder pattern).
    pub const fn with_external_comm_port_base(mut self, base: u16) -> Self {
        self.comm_ports.external_base = Some(base);
        self
    }

    /// Set the external base port of the time-server service (builder pattern).
    pub const fn with_external_time_port_base(mut self, base: u16) -> Self {
        self.time_ports.external_base = Some(base);
        self
    }

    /// Set the local discovery port layout (builder pattern).
    pub const fn with_discovery_ports(mut self, ports: PortRange) -> Self {
        self.discovery_ports = ports;
        self
    }

    /// Set the local communication port layout (builder pattern).
    pub const fn with_comm_ports(mut self, ports: PortRange) -> Self {
        self.comm_ports = ports;
        self
    }

    /// Set the local time-server port layout (builder pattern).
    pub const fn with_time_ports(mut self, ports: PortRange) -> Self {
        self.time_ports = ports;
        self
    }

    /// Set the registration cutoff age in days (builder pattern).
    pub const fn with_registration_cutoff_age_days(mut self, days: u32) -> Self {
        self.registration_cutoff_age_days = days;
        self
    }

    /// Set the fallback seed list (builder pattern).
    pub fn with_initial_members(mut self, members: impl Into<String>) -> Self {
        self.initial_members = Some(members.into());
        self
    }

    /// Set the reconciliation lock TTL (builder pattern).
    pub const fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    /// Set the startup lock retry wait (builder pattern).
    pub const fn with_startup_lock_retry_wait(mut self, wait: Duration) -> Self {
        self.startup_lock_retry_wait = wait;
        self
    }

    /// Set the startup lock retry count (builder pattern).
    pub const fn with_startup_lock_retry_count(mut self, count: u32) -> Self {
        self.startup_lock_retry_count = count;
        self
    }

    /// Set the reconcile-request queue capacity (builder pattern).
    pub const fn with_reconcile_queue_capacity(mut self, capacity: usize) -> Self {
        self.reconcile_queue_capacity = capacity;
        self
    }

    /// Set the periodic refresh interval (builder pattern).
    pub const fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Validate the configuration.
    ///
    /// Checks everything that should fail process startup: a missing instance
    /// name, a non-positive cutoff age, and malformed `initial_members`.
    pub fn validate(&self) -> Result<()> {
        if self.instance_name.trim().is_empty() {
            return Err(Error::Config("instance_name must not be empty".to_string()));
        }
        if self.registration_cutoff_age_days == 0 {
            return Err(Error::Config(
                "registration_cutoff_age_days must be positive".to_string(),
            ));
        }
        // Fail fast on unparseable fallback seeds rather than at first use.
        self.initial_member_addresses()?;
        Ok(())
    }

    /// Parse the `initial_members` fallback list.
    ///
    /// Tokens are comma-separated with optional surrounding whitespace;
    /// empty tokens are skipped.
    pub fn initial_member_addresses(&self) -> Result<Vec<MemberAddress>> {
        let mut addresses = Vec::new();
        if let Some(members) = &self.initial_members {
            for token in members.split(',') {
                let token = token.trim();
                if token.is_empty() {
                    continue;
                }
                addresses.push(token.parse::<MemberAddress>()?);
            }
        }
        Ok(addresses)
    }

    /// The cutoff age in milliseconds.
    pub fn cutoff_age_ms(&self) -> u64 {
        u64::from(self.registration_cutoff_age_days) * 24 * 60 * 60 * 1000
    }
}

#[cfg(feature = "serde")]
mod humantime_serde_impl {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        } else {
            serializer.serialize_u64(duration.as_millis() as u64)
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            // Simple parsing: expect "Nms" format
            let ms: u64 = s
                .trim_end_matches("ms")
                .parse()
                .map_err(serde::de::Error::custom)?;
            Ok(Duration::from_millis(ms))
        } else {
            let ms = u64::deserialize(deserializer)?;
            Ok(Duration::from_millis(ms))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RendezvousConfig::new("main");
        assert_eq!(config.instance_name, "main");
        assert_eq!(config.registration_cutoff_age_days, 30);
        assert_eq!(config.discovery_ports.base, 47500);
        assert_eq!(config.comm_ports.base, 47100);
        assert_eq!(config.time_ports.base, 31100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let config = RendezvousConfig::new("main")
            .with_external_host("public.example.com")
            .with_external_comm_port_base(1234)
            .with_lock_ttl(Duration::from_secs(5));

        assert_eq!(config.external_host.as_deref(), Some("public.example.com"));
        assert_eq!(config.comm_ports.external_base, Some(1234));
        assert!(config.comm_ports.is_mapped());
        assert_eq!(config.lock_ttl, Duration::from_secs(5));
    }

    #[test]
    fn test_validate_rejects_empty_instance_name() {
        let config = RendezvousConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_cutoff() {
        let config = RendezvousConfig::new("main").with_registration_cutoff_age_days(0);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("cutoff"));
    }

    #[test]
    fn test_initial_members_parsing() {
        let config =
            RendezvousConfig::new("main").with_initial_members("node1:47500 , node2:47500,,");
        let members = config.initial_member_addresses().unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].host(), "node1");
        assert_eq!(members[1].host(), "node2");
    }

    #[test]
    fn test_initial_members_rejects_malformed() {
        let config = RendezvousConfig::new("main").with_initial_members("node1:47500,garbage");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unmapped_port_range() {
        let ports = PortRange::new(47100, 100);
        assert!(!ports.is_mapped());
        // An external base equal to the local base is not a mapping.
        let same = ports.with_external_base(47100);
        assert!(!same.is_mapped());
        let mapped = ports.with_external_base(48100);
        assert!(mapped.is_mapped());
    }

    #[test]
    fn test_cutoff_age_ms() {
        let config = RendezvousConfig::new("main").with_registration_cutoff_age_days(1);
        assert_eq!(config.cutoff_age_ms(), 86_400_000);
    }
}
