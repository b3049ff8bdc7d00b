//! Address and registration identity types.
//!
//! Addresses are plain `host:port` pairs. Equality is exact string plus port;
//! no DNS resolution ever happens inside these types, so `"node1:47500"` and
//! `"10.0.0.5:47500"` are different addresses even when they name the same
//! machine.
//!
//! IPv6 hosts are displayed in bracket notation (`[2001:db8::1]:47500`).
//! Parsing accepts both bracket notation and the legacy unbracketed form,
//! splitting at the last colon, so previously stored entries keep loading.

use std::fmt::{self, Display};
use std::net::IpAddr;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

/// A cluster member address: a host name or IP literal plus a port.
///
/// The host is stored without IPv6 brackets; `Display` re-adds them whenever
/// the host contains a colon.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemberAddress {
    host: String,
    port: u16,
}

impl MemberAddress {
    /// Create an address from a host (name or IP literal) and port.
    ///
    /// Surrounding IPv6 brackets on the host are stripped.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .map(str::to_owned)
            .unwrap_or(host);
        Self { host, port }
    }

    /// The host name or IP literal, without brackets.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The port.
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// The host parsed as an IP literal, if it is one.
    pub fn ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }

    /// Whether the host is a loopback address.
    ///
    /// `localhost` counts as loopback even though it is a name, since the
    /// model never resolves names.
    pub fn is_loopback(&self) -> bool {
        self.host.eq_ignore_ascii_case("localhost")
            || self.ip().map(|ip| ip.is_loopback()).unwrap_or(false)
    }

    /// Whether the host is an any-local (wildcard) address such as `0.0.0.0`.
    pub fn is_any_local(&self) -> bool {
        self.ip().map(|ip| ip.is_unspecified()).unwrap_or(false)
    }

    /// The same port re-homed onto a different host.
    pub fn with_host(&self, host: impl Into<String>) -> Self {
        Self::new(host, self.port)
    }

    /// The same host re-homed onto a different port.
    pub fn with_port(&self, port: u16) -> Self {
        Self {
            host: self.host.clone(),
            port,
        }
    }
}

impl Display for MemberAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for MemberAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(AddressParseError::new(s, "empty address"));
        }

        let (host, port_str) = if let Some(rest) = s.strip_prefix('[') {
            let (host, after) = rest
                .split_once(']')
                .ok_or_else(|| AddressParseError::new(s, "unterminated '[' in host"))?;
            let port = after
                .strip_prefix(':')
                .ok_or_else(|| AddressParseError::new(s, "missing port after ']'"))?;
            (host, port)
        } else {
            // Legacy form: the last colon separates host and port, so
            // unbracketed IPv6 literals stored by older versions still parse.
            s.rsplit_once(':')
                .ok_or_else(|| AddressParseError::new(s, "missing ':' port separator"))?
        };

        if host.is_empty() {
            return Err(AddressParseError::new(s, "empty host"));
        }
        let port: u16 = port_str
            .parse()
            .map_err(|_| AddressParseError::new(s, "invalid port"))?;

        Ok(Self {
            host: host.to_owned(),
            port,
        })
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for MemberAddress {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for MemberAddress {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Error returned when an address string cannot be parsed.
///
/// Encountered during registry enumeration this is not fatal: the offending
/// entry is skipped and enumeration continues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressParseError {
    input: String,
    reason: &'static str,
}

impl AddressParseError {
    fn new(input: &str, reason: &'static str) -> Self {
        Self {
            input: input.to_owned(),
            reason,
        }
    }

    /// The input string that failed to parse.
    pub fn input(&self) -> &str {
        &self.input
    }
}

impl Display for AddressParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid address '{}': {}", self.input, self.reason)
    }
}

impl std::error::Error for AddressParseError {}

/// Identity of one registration attempt: `<epochMillis>@<uuid>`.
///
/// The UUID part is fixed per process (one per [`crate::MemberAddressRegistrar`]),
/// the timestamp part is fresh per registration, so a process can recognize
/// and clean up its own older entries while the timestamp dates the entry for
/// cutoff-age checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegistrationId {
    timestamp: u64,
    uuid: Uuid,
}

impl RegistrationId {
    /// Create a registration id for `uuid` dated now.
    pub fn new(uuid: Uuid) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self { timestamp, uuid }
    }

    /// Create a registration id from raw components (for testing).
    pub const fn from_parts(timestamp: u64, uuid: Uuid) -> Self {
        Self { timestamp, uuid }
    }

    /// Milliseconds since UNIX epoch at which this registration was written.
    pub const fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// The owning process's registration UUID.
    pub const fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Age of this registration relative to `now` (milliseconds since epoch).
    ///
    /// A timestamp in the future yields zero.
    pub fn age_ms(&self, now: u64) -> u64 {
        now.saturating_sub(self.timestamp)
    }

    /// Parse `<epochMillis>@<uuid>`.
    ///
    /// Returns `None` for anything malformed; callers treat such entries the
    /// same way as unparseable addresses (skip and continue).
    pub fn parse(s: &str) -> Option<Self> {
        let (millis, uuid) = s.split_once('@')?;
        let timestamp = millis.parse().ok()?;
        let uuid = Uuid::parse_str(uuid).ok()?;
        Some(Self { timestamp, uuid })
    }
}

impl Display for RegistrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.timestamp, self.uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_address() {
        let addr: MemberAddress = "10.0.0.5:47500".parse().unwrap();
        assert_eq!(addr.host(), "10.0.0.5");
        assert_eq!(addr.port(), 47500);
        assert_eq!(addr.to_string(), "10.0.0.5:47500");
    }

    #[test]
    fn test_parse_hostname_address() {
        let addr: MemberAddress = "node1.internal:47100".parse().unwrap();
        assert_eq!(addr.host(), "node1.internal");
        assert_eq!(addr.port(), 47100);
        assert!(addr.ip().is_none());
    }

    #[test]
    fn test_parse_bracketed_ipv6() {
        let addr: MemberAddress = "[2001:db8::1]:47500".parse().unwrap();
        assert_eq!(addr.host(), "2001:db8::1");
        assert_eq!(addr.port(), 47500);
        assert_eq!(addr.to_string(), "[2001:db8::1]:47500");
    }

    #[test]
    fn test_parse_legacy_unbracketed_ipv6() {
        // Older entries stored v6 literals without brackets; the last colon
        // splits host and port.
        let addr: MemberAddress = "2001:db8::1:47500".parse().unwrap();
        assert_eq!(addr.host(), "2001:db8::1");
        assert_eq!(addr.port(), 47500);
        // Round-trip re-emits brackets.
        assert_eq!(addr.to_string(), "[2001:db8::1]:47500");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!("".parse::<MemberAddress>().is_err());
        assert!("no-port".parse::<MemberAddress>().is_err());
        assert!(":47500".parse::<MemberAddress>().is_err());
        assert!("host:notaport".parse::<MemberAddress>().is_err());
        assert!("host:99999".parse::<MemberAddress>().is_err());
        assert!("[2001:db8::1:47500".parse::<MemberAddress>().is_err());
        assert!("[2001:db8::1]47500".parse::<MemberAddress>().is_err());
    }

    #[test]
    fn test_equality_is_textual() {
        let by_name: MemberAddress = "localhost:47500".parse().unwrap();
        let by_ip: MemberAddress = "127.0.0.1:47500".parse().unwrap();
        assert_ne!(by_name, by_ip);
        assert!(by_name.is_loopback());
        assert!(by_ip.is_loopback());
    }

    #[test]
    fn test_loopback_and_any_local() {
        let v6_loop: MemberAddress = "[::1]:47500".parse().unwrap();
        assert!(v6_loop.is_loopback());
        let wildcard = MemberAddress::new("0.0.0.0", 47500);
        assert!(wildcard.is_any_local());
        let regular = MemberAddress::new("10.0.0.5", 47500);
        assert!(!regular.is_loopback());
        assert!(!regular.is_any_local());
    }

    #[test]
    fn test_with_host_keeps_port() {
        let addr = MemberAddress::new("127.0.0.1", 47500);
        let rehomed = addr.with_host("node1");
        assert_eq!(rehomed.host(), "node1");
        assert_eq!(rehomed.port(), 47500);
    }

    #[test]
    fn test_registration_id_round_trip() {
        let uuid = Uuid::new_v4();
        let id = RegistrationId::from_parts(1_700_000_000_000, uuid);
        let parsed = RegistrationId::parse(&id.to_string()).unwrap();
        assert_eq!(parsed, id);
        assert_eq!(parsed.timestamp(), 1_700_000_000_000);
        assert_eq!(parsed.uuid(), uuid);
    }

    #[test]
    fn test_registration_id_rejects_malformed() {
        assert!(RegistrationId::parse("").is_none());
        assert!(RegistrationId::parse("12345").is_none());
        assert!(RegistrationId::parse("notamillis@not-a-uuid").is_none());
        assert!(RegistrationId::parse("@").is_none());
    }

    #[test]
    fn test_registration_id_age() {
        let id = RegistrationId::from_parts(1_000, Uuid::new_v4());
        assert_eq!(id.age_ms(4_000), 3_000);
        // Clock skew: never negative.
        assert_eq!(id.age_ms(500), 0);
    }
}
