//! Kernel datapath reconcilers.
//!
//! Two backends keep the kernel in sync with the active lease set: the
//! packet-filter path (iptables chain swaps, TCP and UDP) and the XDP fast
//! path (hash-map driven UDP rewriting that bypasses conntrack). Both run as
//! background workers that reconcile on a timer and on demand.

pub mod filter;
pub mod netinfo;
pub mod xdp;

pub use filter::FilterReconciler;
pub use xdp::XdpManager;

use std::net::IpAddr;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug, Error)]
pub enum DatapathError {
    #[error("failed to run {command}: {source}")]
    Exec {
        command: String,
        source: std::io::Error,
    },

    #[error("{command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("table {table} is missing chain {chain}")]
    MissingChain { table: String, chain: String },

    #[error("table {table} chain {chain} is missing jump to {target}")]
    MissingJump {
        table: String,
        chain: String,
        target: String,
    },

    #[error("failed to load xdp program: {0}")]
    Load(#[from] aya::BpfError),

    #[error("xdp program error: {0}")]
    Program(#[from] aya::programs::ProgramError),

    #[error("xdp map error: {0}")]
    Map(#[from] aya::maps::MapError),

    #[error("program not found: {0}")]
    ProgramNotFound(String),

    #[error("map not found: {0}")]
    MapNotFound(String),

    #[error("netlink error: {0}")]
    Netlink(#[from] rtnetlink::Error),

    #[error("no route to {0}")]
    NoRoute(IpAddr),

    #[error("interface {0} not found")]
    LinkNotFound(u32),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DatapathError>;

/// Handle to a running reconciler worker.
///
/// `kick` is a level-triggered "reconcile soon" signal: the channel holds at
/// most one pending request, so any number of kicks between passes coalesce
/// into a single run.
pub struct ReconcileHandle {
    kick: mpsc::Sender<()>,
    shutdown: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl ReconcileHandle {
    pub(crate) fn new(
        kick: mpsc::Sender<()>,
        shutdown: mpsc::Sender<()>,
        task: JoinHandle<()>,
    ) -> Self {
        ReconcileHandle {
            kick,
            shutdown,
            task,
        }
    }

    /// Request a reconciliation pass. Never blocks; a pass is already pending
    /// when the send fails, which is exactly the coalescing we want.
    pub fn kick(&self) {
        let _ = self.kick.try_send(());
    }

    /// A clonable kick endpoint for the event fan-out task.
    pub fn kicker(&self) -> mpsc::Sender<()> {
        self.kick.clone()
    }

    /// Signal the worker to stop and wait for it to drain.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(()).await;
        if let Err(e) = self.task.await {
            debug!(error = %e, "reconciler worker ended abnormally");
        }
    }
}
