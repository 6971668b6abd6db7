//! Port-mapping lease model and identifier derivation.

use chrono::{DateTime, Duration, Utc};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Transport protocol of a mapping. The discriminant matches the NAT-PMP
/// opcode that requests a mapping for it (1 = UDP, 2 = TCP).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Protocol {
    Udp = 1,
    Tcp = 2,
}

impl Protocol {
    /// Lowercase name as used by iptables and the JSON encoding.
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Udp => "udp",
            Protocol::Tcp => "tcp",
        }
    }

    pub fn from_opcode(op: u8) -> Option<Self> {
        match op {
            1 => Some(Protocol::Udp),
            2 => Some(Protocol::Tcp),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque 128-bit lease identifier.
///
/// Derived deterministically from `(protocol, client ip, internal port)` so
/// that repeated requests for the same triple address the same lease on every
/// peer. Rendered as 32 lowercase hex characters in JSON and in iptables rule
/// comments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LeaseId(u128);

impl LeaseId {
    /// Canonical derivation:
    /// `MD5(proto_name || 0x00 || v4_mapped_16_bytes(ip) || 0x00 || be16(port))`.
    ///
    /// The port is serialized as two big-endian bytes; peers must use this
    /// exact byte layout or they will mint duplicate leases for one client.
    pub fn derive(protocol: Protocol, client_ip: Ipv4Addr, internal_port: u16) -> Self {
        let mut hasher = Md5::new();
        hasher.update(protocol.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(client_ip.to_ipv6_mapped().octets());
        hasher.update([0u8]);
        hasher.update(internal_port.to_be_bytes());
        let digest: [u8; 16] = hasher.finalize().into();
        LeaseId(u128::from_be_bytes(digest))
    }

    pub fn as_u128(&self) -> u128 {
        self.0
    }

    pub fn from_u128(raw: u128) -> Self {
        LeaseId(raw)
    }
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl FromStr for LeaseId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u128::from_str_radix(s, 16).map(LeaseId)
    }
}

impl Serialize for LeaseId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for LeaseId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s.len() != 32 {
            return Err(serde::de::Error::custom("lease id must be 32 hex chars"));
        }
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Liveness window: a lease whose `last_seen` is older than this is ignored
/// by datapath reconciliation but kept in storage (peers may refresh it).
pub fn active_window() -> Duration {
    Duration::minutes(5)
}

/// The persisted port-mapping entity.
///
/// `client_ip`, `client_port` and `protocol` are immutable for the life of
/// the lease; a request differing in any of them derives a different id and
/// therefore a different lease. Only `last_seen` advances after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMappingLease {
    pub id: LeaseId,
    pub created: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub client_ip: Ipv4Addr,
    pub client_port: u16,
    pub protocol: Protocol,
    pub external_port: u16,
}

impl PortMappingLease {
    pub fn new(
        protocol: Protocol,
        client_ip: Ipv4Addr,
        client_port: u16,
        external_port: u16,
        now: DateTime<Utc>,
    ) -> Self {
        PortMappingLease {
            id: LeaseId::derive(protocol, client_ip, client_port),
            created: now,
            last_seen: now,
            client_ip,
            client_port,
            protocol,
            external_port,
        }
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.last_seen >= now - active_window()
    }
}
