//! dynportd: a NAT-PMP dynamic port-forwarding gateway.
//!
//! Clients behind the gateway request port mappings over UDP (RFC 6886
//! subset); admitted mappings are persisted as leases and installed into the
//! kernel twice: iptables DNAT/SNAT chains for all traffic, and an optional
//! XDP fast path that rewrites UDP without touching conntrack. Peers can
//! replicate leases over HTTP for active/active pairs of gateways.

pub mod acl;
pub mod config;
pub mod datapath;
pub mod engine;
pub mod event;
pub mod lease;
pub mod replication;
pub mod store;

pub use acl::Acl;
pub use config::{Config, ConfigError};
pub use datapath::{FilterReconciler, XdpManager};
pub use engine::DynPortServer;
pub use event::LeaseEvent;
pub use lease::{LeaseId, PortMappingLease, Protocol};
pub use replication::Replication;
pub use store::{LeaseStore, StoreError};
