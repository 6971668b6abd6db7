//! Lease-change events.
//!
//! The protocol engine and replication only publish onto a broadcast channel;
//! the orchestrator owns the single receiver and dispatches to reconcilers
//! and peer pushes. Components never call each other directly.

use crate::lease::PortMappingLease;

#[derive(Debug, Clone)]
pub enum LeaseEvent {
    /// The protocol engine admitted (created or refreshed) a lease.
    Admitted(PortMappingLease),
    /// Replication merged peer state into the local store.
    Synced,
}
