//! XDP fast-path reconciler.
//!
//! A separately-built XDP object rewrites UDP packets straight at the driver,
//! bypassing conntrack. Userspace owns two hash maps the program consumes:
//! `sources` keyed by (client ip, client port) rewriting outbound packets to
//! the external address, and `destinations` keyed by (external ip, external
//! port) rewriting inbound packets to the client. Only UDP leases are
//! materialized; TCP stays on the packet-filter path.
//!
//! Map value layout is a contract with the XDP program: `#[repr(C)]`, ports
//! and addresses in network byte order, MAC fields zeroed when neighbour
//! resolution failed (the program drops zero-MAC entries instead of emitting
//! a bogus frame).

use super::netinfo::NetInfo;
use super::{DatapathError, ReconcileHandle, Result};
use crate::lease::{PortMappingLease, Protocol};
use crate::store::LeaseStore;
use aya::maps::{HashMap as BpfHashMap, MapData};
use aya::programs::xdp::XdpLinkId;
use aya::programs::{Xdp, XdpFlags};
use aya::{Bpf, BpfLoader};
use ipnet::Ipv4Net;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Installed location of the compiled XDP object.
const OBJECT_PATH: &str = "/usr/lib/dynportd/xdp_nat_forward.o";

const PROGRAM_NAME: &str = "xdp_nat_forward";
const MAP_SOURCES: &str = "sources";
const MAP_DESTINATIONS: &str = "destinations";
const MAP_SETTINGS: &str = "settings";

const RECONCILE_INTERVAL: Duration = Duration::from_secs(120);

/// Probe address used to find the default gateway's neighbour entry.
const GATEWAY_PROBE: Ipv4Addr = Ipv4Addr::new(1, 1, 1, 1);

const MAX_NO_NAT_CIDRS: usize = 10;

/// 6-byte map key: IPv4 address and port, both big-endian.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NatKey {
    pub addr: [u8; 4],
    pub port: [u8; 2],
}

impl NatKey {
    pub fn new(addr: Ipv4Addr, port: u16) -> Self {
        NatKey {
            addr: addr.octets(),
            port: port.to_be_bytes(),
        }
    }
}

unsafe impl aya::Pod for NatKey {}

/// Rewrite record: the replacement address/port plus the frame header fields
/// needed to re-emit the packet on `ifindex`.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Remapping {
    pub ifindex: u32,
    pub addr: [u8; 4],
    pub port: [u8; 2],
    pub dst_mac: [u8; 6],
    pub src_mac: [u8; 6],
    _pad: [u8; 2],
}

impl Remapping {
    pub fn new(ifindex: u32, addr: Ipv4Addr, port: u16, dst_mac: [u8; 6], src_mac: [u8; 6]) -> Self {
        Remapping {
            ifindex,
            addr: addr.octets(),
            port: port.to_be_bytes(),
            dst_mac,
            src_mac,
            _pad: [0; 2],
        }
    }
}

unsafe impl aya::Pod for Remapping {}

/// One no-NAT prefix, host byte order, as the program's matcher expects.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct NoNatCidr {
    pub addr: u32,
    pub mask: u32,
}

unsafe impl aya::Pod for NoNatCidr {}

/// Singleton settings entry: traffic toward these prefixes bypasses source
/// rewriting. Unused slots stay zeroed.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct Settings {
    pub no_nat: [NoNatCidr; MAX_NO_NAT_CIDRS],
}

unsafe impl aya::Pod for Settings {}

impl Settings {
    fn from_nets(nets: &[Ipv4Net]) -> Self {
        let mut settings = Settings {
            no_nat: [NoNatCidr { addr: 0, mask: 0 }; MAX_NO_NAT_CIDRS],
        };
        for (slot, net) in settings.no_nat.iter_mut().zip(nets) {
            slot.addr = u32::from(net.addr());
            slot.mask = u32::from(net.netmask());
        }
        settings
    }
}

struct Loaded {
    bpf: Bpf,
    links: Vec<XdpLinkId>,
}

pub struct XdpManager {
    netinfo: NetInfo,
    external_ip: Ipv4Addr,
    loaded: Option<Mutex<Loaded>>,
}

impl XdpManager {
    /// A disabled manager: every operation is a no-op.
    pub fn disabled(netinfo: NetInfo, external_ip: Ipv4Addr) -> Self {
        XdpManager {
            netinfo,
            external_ip,
            loaded: None,
        }
    }

    pub fn enabled(&self) -> bool {
        self.loaded.is_some()
    }

    /// Load the XDP object, seed the settings map and attach the program to
    /// every interface the external IP or a listen address routes through.
    pub async fn load(
        netinfo: NetInfo,
        external_ip: Ipv4Addr,
        listen_ips: Vec<Ipv4Addr>,
        no_nat: Vec<Ipv4Net>,
    ) -> Result<Self> {
        let mut bpf = BpfLoader::new().load_file(OBJECT_PATH)?;

        {
            let mut settings: BpfHashMap<&mut MapData, u8, Settings> = bpf
                .map_mut(MAP_SETTINGS)
                .ok_or_else(|| DatapathError::MapNotFound(MAP_SETTINGS.to_string()))?
                .try_into()?;
            settings.insert(0u8, Settings::from_nets(&no_nat), 0)?;
        }

        let mut ifindices = vec![netinfo.route_to(external_ip).await?.ifindex];
        for ip in &listen_ips {
            ifindices.push(netinfo.route_to(*ip).await?.ifindex);
        }
        ifindices.sort_unstable();
        ifindices.dedup();

        let program: &mut Xdp = bpf
            .program_mut(PROGRAM_NAME)
            .ok_or_else(|| DatapathError::ProgramNotFound(PROGRAM_NAME.to_string()))?
            .try_into()?;
        program.load()?;

        let mut links = Vec::with_capacity(ifindices.len());
        for ifindex in &ifindices {
            let ifname = netinfo.link_name(*ifindex).await?;
            let link = match program.attach(&ifname, XdpFlags::default()) {
                Ok(link) => link,
                Err(e) => {
                    warn!(error = %e, iface = %ifname, "driver-mode attach failed, retrying in skb mode");
                    match program.attach(&ifname, XdpFlags::SKB_MODE) {
                        Ok(link) => link,
                        Err(e) => {
                            // Roll back already-attached interfaces before bailing.
                            for link in links {
                                if let Err(e) = program.detach(link) {
                                    error!(error = %e, "failed to detach xdp program");
                                }
                            }
                            return Err(e.into());
                        }
                    }
                }
            };
            info!(iface = %ifname, ifindex, "xdp program attached");
            links.push(link);
        }

        Ok(XdpManager {
            netinfo,
            external_ip,
            loaded: Some(Mutex::new(Loaded { bpf, links })),
        })
    }

    /// Detach the program from all interfaces.
    pub async fn teardown(&self) {
        let Some(loaded) = &self.loaded else { return };
        let mut guard = loaded.lock().await;
        let Loaded { bpf, links } = &mut *guard;

        let program: Result<&mut Xdp> = bpf
            .program_mut(PROGRAM_NAME)
            .ok_or_else(|| DatapathError::ProgramNotFound(PROGRAM_NAME.to_string()))
            .and_then(|p| p.try_into().map_err(DatapathError::Program));
        match program {
            Ok(program) => {
                for link in links.drain(..) {
                    if let Err(e) = program.detach(link) {
                        error!(error = %e, "failed to detach xdp program");
                    }
                }
                info!("xdp program detached");
            }
            Err(e) => error!(error = %e, "failed to access xdp program for teardown"),
        }
    }

    /// Bring both maps in line with the active UDP leases: upsert every
    /// desired entry, then sweep stale keys. Per-entry failures are logged
    /// and skipped so one bad lease cannot stall the rest.
    pub async fn ensure_mappings(&self, leases: &[PortMappingLease]) {
        let Some(loaded) = &self.loaded else { return };
        let mut guard = loaded.lock().await;

        let uplink = match self.resolve_uplink().await {
            Ok(uplink) => uplink,
            Err(e) => {
                error!(error = %e, "failed to resolve uplink for xdp mappings");
                return;
            }
        };

        let mut sources: HashMap<NatKey, Remapping> = HashMap::new();
        let mut destinations: HashMap<NatKey, Remapping> = HashMap::new();

        for lease in leases.iter().filter(|l| l.protocol == Protocol::Udp) {
            debug!(
                client = %lease.client_ip,
                port = lease.client_port,
                external_port = lease.external_port,
                "updating xdp mapping"
            );
            sources.insert(
                NatKey::new(lease.client_ip, lease.client_port),
                Remapping::new(
                    uplink.ifindex,
                    self.external_ip,
                    lease.external_port,
                    uplink.gateway_mac,
                    uplink.mac,
                ),
            );

            match self.resolve_client(lease.client_ip).await {
                Ok((ifindex, src_mac, dst_mac)) => {
                    destinations.insert(
                        NatKey::new(self.external_ip, lease.external_port),
                        Remapping::new(
                            ifindex,
                            lease.client_ip,
                            lease.client_port,
                            dst_mac,
                            src_mac,
                        ),
                    );
                }
                Err(e) => {
                    error!(error = %e, client = %lease.client_ip, "failed to resolve client route");
                    continue;
                }
            }
        }

        if let Err(e) = apply_map(&mut guard.bpf, MAP_SOURCES, &sources) {
            error!(error = %e, map = MAP_SOURCES, "failed to reconcile xdp map");
        }
        if let Err(e) = apply_map(&mut guard.bpf, MAP_DESTINATIONS, &destinations) {
            error!(error = %e, map = MAP_DESTINATIONS, "failed to reconcile xdp map");
        }
    }

    /// Egress side toward the internet: interface MAC as source, the default
    /// gateway's MAC as destination.
    async fn resolve_uplink(&self) -> Result<Uplink> {
        let route = self.netinfo.route_to(self.external_ip).await?;
        let mac = self.netinfo.link_mac(route.ifindex).await?;

        let gateway = self.netinfo.route_to(GATEWAY_PROBE).await?.gateway;
        let gateway_mac = match gateway {
            Some(gw) => self
                .netinfo
                .neighbour_mac(route.ifindex, gw)
                .await?
                .unwrap_or([0u8; 6]),
            None => [0u8; 6],
        };

        Ok(Uplink {
            ifindex: route.ifindex,
            mac,
            gateway_mac,
        })
    }

    /// Ingress side toward one client: (ifindex, our MAC, client MAC).
    async fn resolve_client(&self, client_ip: Ipv4Addr) -> Result<(u32, [u8; 6], [u8; 6])> {
        let route = self.netinfo.route_to(client_ip).await?;
        let src_mac = self.netinfo.link_mac(route.ifindex).await?;
        let dst_mac = self
            .netinfo
            .neighbour_mac(route.ifindex, client_ip)
            .await?
            .unwrap_or([0u8; 6]);
        Ok((route.ifindex, src_mac, dst_mac))
    }

    /// Spawn the background worker; identical cadence to the filter
    /// reconciler.
    pub fn spawn_worker(self: Arc<Self>, store: Arc<LeaseStore>) -> ReconcileHandle {
        let (kick_tx, mut kick_rx) = mpsc::channel::<()>(1);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let task = tokio::spawn(async move {
            let mut ticker = interval(RECONCILE_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.reconcile(&store).await,
                    Some(_) = kick_rx.recv() => self.reconcile(&store).await,
                    _ = shutdown_rx.recv() => {
                        debug!("xdp reconciler worker stopping");
                        return;
                    }
                }
            }
        });

        ReconcileHandle::new(kick_tx, shutdown_tx, task)
    }

    async fn reconcile(&self, store: &LeaseStore) {
        if !self.enabled() {
            return;
        }
        debug!("reconcile xdp maps");
        let leases = match store.get_active() {
            Ok(leases) => leases,
            Err(e) => {
                error!(error = %e, "failed to load active leases");
                return;
            }
        };
        self.ensure_mappings(&leases).await;
    }
}

struct Uplink {
    ifindex: u32,
    mac: [u8; 6],
    gateway_mac: [u8; 6],
}

fn apply_map(bpf: &mut Bpf, name: &str, desired: &HashMap<NatKey, Remapping>) -> Result<()> {
    let mut map: BpfHashMap<&mut MapData, NatKey, Remapping> = bpf
        .map_mut(name)
        .ok_or_else(|| DatapathError::MapNotFound(name.to_string()))?
        .try_into()?;

    for (key, value) in desired {
        if let Err(e) = map.insert(key, value, 0) {
            error!(error = %e, map = name, "failed to upsert map entry");
        }
    }

    let stale: Vec<NatKey> = map
        .keys()
        .filter_map(|key| key.ok())
        .filter(|key| !desired.contains_key(key))
        .collect();
    for key in stale {
        let ip = Ipv4Addr::from(key.addr);
        let port = u16::from_be_bytes(key.port);
        debug!(map = name, %ip, port, "removing stale map entry");
        if let Err(e) = map.remove(&key) {
            error!(error = %e, map = name, "failed to remove stale map entry");
        }
    }
    Ok(())
}
