//! Daemon configuration.
//!
//! Configuration is merged from three equivalent sources, later ones winning:
//!
//! 1. YAML config file (default `config.yaml`)
//! 2. Environment variables with the `DP_` prefix
//! 3. Command-line flags (applied by `main` on top of the loaded value)
//!
//! The merged `Config` is validated once at startup and then passed frozen to
//! every component; nothing mutates it afterwards.

use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors detected while loading or validating configuration. All of them are
/// fatal: the process reports the error and exits nonzero.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Figment(#[from] Box<figment::Error>),

    #[error("listen-addrs must contain at least one address")]
    NoListenAddrs,

    #[error("listen addr needs to be a specific ipv4 address: {0}")]
    InvalidListenAddr(String),

    #[error("invalid port-range `{0}`: expected `start-end` with 1 <= start < end <= 65535")]
    InvalidPortRange(String),

    #[error("invalid cidr `{0}`")]
    InvalidCidr(String),

    #[error("invalid internal-ports `{0}`: expected `low-high`")]
    InvalidPortSpan(String),

    #[error("no-nat-cidr allows at most 10 entries, got {0}")]
    TooManyNoNatCidrs(usize),

    #[error("replication-secret is required when replication-listen-addr is set")]
    MissingReplicationSecret,

    #[error("invalid replication-listen-addr `{0}`")]
    InvalidReplicationAddr(String),

    #[error("failed to detect external ip: {0}")]
    DetectExternalIp(#[source] std::io::Error),

    #[error("external ip detection returned a non-ipv4 address")]
    ExternalIpNotV4,
}

/// One ordered ACL entry as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AclEntry {
    pub cidr: String,
    pub internal_ports: String,
    #[serde(default)]
    pub deny: bool,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Plain,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Config {
    pub data_dir: PathBuf,
    pub log_level: String,
    pub log_format: LogFormat,
    pub listen_addrs: Vec<String>,
    /// External address reported to clients; autodetected when unset.
    pub external_ip: Option<Ipv4Addr>,
    pub port_range: String,
    pub create_chains: bool,
    pub skip_jump_check: bool,
    pub acl_allow_default: bool,
    pub acl: Vec<AclEntry>,
    pub ebpf_enabled: bool,
    pub no_nat_cidr: Vec<String>,
    pub replication_listen_addr: Option<String>,
    pub replication_secret: Option<String>,
    pub replication_peers: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: PathBuf::from("/var/lib/dynportd"),
            log_level: "info".to_string(),
            log_format: LogFormat::Json,
            listen_addrs: Vec::new(),
            external_ip: None,
            port_range: "10000-19999".to_string(),
            create_chains: true,
            skip_jump_check: false,
            acl_allow_default: false,
            acl: Vec::new(),
            ebpf_enabled: false,
            no_nat_cidr: Vec::new(),
            replication_listen_addr: None,
            replication_secret: None,
            replication_peers: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from the given file (if present) and the `DP_`
    /// environment. CLI flags are applied on top by the caller.
    pub fn load(file: &Path) -> Result<Config, ConfigError> {
        let figment = Figment::from(Serialized::defaults(Config::default()))
            .merge(Yaml::file(file))
            .merge(Env::prefixed("DP_").map(|key| key.as_str().replace('_', "-").into()));
        figment.extract().map_err(|e| ConfigError::Figment(Box::new(e)))
    }

    /// Validate the full key set. Every accessor below re-parses its value,
    /// so a `Config` that passed validation cannot fail later.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen_socket_addrs()?;
        self.external_port_range()?;
        self.no_nat_nets()?;
        for entry in &self.acl {
            entry.cidr.parse::<Ipv4Net>().map_err(|_| ConfigError::InvalidCidr(entry.cidr.clone()))?;
            parse_port_span(&entry.internal_ports)
                .ok_or_else(|| ConfigError::InvalidPortSpan(entry.internal_ports.clone()))?;
        }
        if let Some(addr) = &self.replication_listen_addr {
            addr.parse::<SocketAddr>()
                .map_err(|_| ConfigError::InvalidReplicationAddr(addr.clone()))?;
            match &self.replication_secret {
                Some(secret) if !secret.is_empty() => {}
                _ => return Err(ConfigError::MissingReplicationSecret),
            }
        }
        Ok(())
    }

    /// The validated NAT-PMP listen addresses. Each must be a specific
    /// (non-wildcard, non-multicast) IPv4 address so replies carry a stable
    /// source address.
    pub fn listen_socket_addrs(&self) -> Result<Vec<SocketAddrV4>, ConfigError> {
        if self.listen_addrs.is_empty() {
            return Err(ConfigError::NoListenAddrs);
        }
        let mut addrs = Vec::with_capacity(self.listen_addrs.len());
        for raw in &self.listen_addrs {
            let addr: SocketAddrV4 = raw
                .parse()
                .map_err(|_| ConfigError::InvalidListenAddr(raw.clone()))?;
            if addr.ip().is_unspecified() || addr.ip().is_multicast() {
                return Err(ConfigError::InvalidListenAddr(raw.clone()));
            }
            addrs.push(addr);
        }
        Ok(addrs)
    }

    /// The external port allocation range, `start-end` inclusive.
    pub fn external_port_range(&self) -> Result<RangeInclusive<u16>, ConfigError> {
        parse_port_span(&self.port_range)
            .filter(|span| span.start() < span.end() && *span.start() >= 1)
            .ok_or_else(|| ConfigError::InvalidPortRange(self.port_range.clone()))
    }

    pub fn no_nat_nets(&self) -> Result<Vec<Ipv4Net>, ConfigError> {
        if self.no_nat_cidr.len() > 10 {
            return Err(ConfigError::TooManyNoNatCidrs(self.no_nat_cidr.len()));
        }
        self.no_nat_cidr
            .iter()
            .map(|raw| raw.parse::<Ipv4Net>().map_err(|_| ConfigError::InvalidCidr(raw.clone())))
            .collect()
    }

    /// The external IP: the configured one, or the local address the kernel
    /// picks when dialing a public resolver.
    pub fn resolve_external_ip(&self) -> Result<Ipv4Addr, ConfigError> {
        if let Some(ip) = self.external_ip {
            return Ok(ip);
        }
        detect_external_ip()
    }
}

/// Autodetect the host's externally-routed address: connect a UDP socket
/// toward 8.8.8.8:80 (no packet is sent) and read the chosen local address.
fn detect_external_ip() -> Result<Ipv4Addr, ConfigError> {
    let socket = UdpSocket::bind("0.0.0.0:0").map_err(ConfigError::DetectExternalIp)?;
    socket
        .connect("8.8.8.8:80")
        .map_err(ConfigError::DetectExternalIp)?;
    let local = socket.local_addr().map_err(ConfigError::DetectExternalIp)?;
    match local.ip() {
        std::net::IpAddr::V4(ip) => Ok(ip),
        std::net::IpAddr::V6(_) => Err(ConfigError::ExternalIpNotV4),
    }
}

/// Parse a `low-high` port span where both bounds are decimal port numbers
/// and `low <= high`. Returns `None` on any malformation.
pub(crate) fn parse_port_span(raw: &str) -> Option<RangeInclusive<u16>> {
    let (low, high) = raw.split_once('-')?;
    if low.is_empty() || high.is_empty() {
        return None;
    }
    if !low.bytes().all(|b| b.is_ascii_digit()) || !high.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let low: u16 = low.parse().ok()?;
    let high: u16 = high.parse().ok()?;
    if low > high {
        return None;
    }
    Some(low..=high)
}
