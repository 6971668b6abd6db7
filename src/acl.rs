//! Client admission control for mapping requests.

use crate::config::{parse_port_span, AclEntry, ConfigError};
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use std::ops::RangeInclusive;

/// One compiled ACL rule.
#[derive(Debug, Clone)]
struct AclRule {
    net: Ipv4Net,
    internal_ports: RangeInclusive<u16>,
    deny: bool,
}

/// Ordered ACL over `(client ip, internal port)`, compiled once at startup.
///
/// Evaluation starts from the configured default. Rules are scanned in order;
/// a matching allow rule decides immediately, a matching deny rule records the
/// denial but keeps scanning so that a later allow entry can override it.
#[derive(Debug, Clone)]
pub struct Acl {
    rules: Vec<AclRule>,
    allow_default: bool,
}

impl Acl {
    pub fn compile(entries: &[AclEntry], allow_default: bool) -> Result<Acl, ConfigError> {
        let mut rules = Vec::with_capacity(entries.len());
        for entry in entries {
            let net: Ipv4Net = entry
                .cidr
                .parse()
                .map_err(|_| ConfigError::InvalidCidr(entry.cidr.clone()))?;
            let internal_ports = parse_port_span(&entry.internal_ports)
                .ok_or_else(|| ConfigError::InvalidPortSpan(entry.internal_ports.clone()))?;
            rules.push(AclRule {
                net,
                internal_ports,
                deny: entry.deny,
            });
        }
        Ok(Acl {
            rules,
            allow_default,
        })
    }

    /// Pure decision function: same inputs always yield the same verdict.
    pub fn allows(&self, client_ip: Ipv4Addr, internal_port: u16) -> bool {
        let mut allowed = self.allow_default;
        for rule in &self.rules {
            if rule.net.contains(&client_ip) && rule.internal_ports.contains(&internal_port) {
                allowed = !rule.deny;
                if allowed {
                    break;
                }
            }
        }
        allowed
    }
}
