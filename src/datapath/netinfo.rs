//! Route, link and neighbour lookups over rtnetlink.
//!
//! The XDP reconciler needs to know, for a given destination, which
//! interface the kernel would send through and which MAC addresses to stamp
//! into rewritten frames. Resolution is best effort: a missing neighbour
//! entry yields a zeroed MAC, which the XDP program treats as "not ready,
//! fall through".

use super::{DatapathError, Result};
use futures::TryStreamExt;
use netlink_packet_route::link::LinkAttribute;
use netlink_packet_route::neighbour::{NeighbourAddress, NeighbourAttribute};
use netlink_packet_route::route::{RouteAddress, RouteAttribute, RouteHeader};
use rtnetlink::{Handle, IpVersion};
use std::net::Ipv4Addr;

/// Result of a route lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub ifindex: u32,
    pub gateway: Option<Ipv4Addr>,
}

/// One netlink connection shared by all lookups.
#[derive(Clone)]
pub struct NetInfo {
    handle: Handle,
}

impl NetInfo {
    pub fn connect() -> Result<Self> {
        let (connection, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(connection);
        Ok(NetInfo { handle })
    }

    /// The main-table route the kernel would pick for `dest`: longest
    /// matching prefix wins, the default route is the fallback.
    pub async fn route_to(&self, dest: Ipv4Addr) -> Result<Route> {
        let mut routes = self.handle.route().get(IpVersion::V4).execute();

        let mut best: Option<(u8, Route)> = None;
        while let Some(route) = routes.try_next().await? {
            if route.header.table != RouteHeader::RT_TABLE_MAIN {
                continue;
            }

            let prefix_len = route.header.destination_prefix_length;
            let mut destination: Option<Ipv4Addr> = None;
            let mut gateway: Option<Ipv4Addr> = None;
            let mut oif: Option<u32> = None;
            for attr in &route.attributes {
                match attr {
                    RouteAttribute::Destination(RouteAddress::Inet(v4)) => {
                        destination = Some(*v4)
                    }
                    RouteAttribute::Gateway(RouteAddress::Inet(v4)) => gateway = Some(*v4),
                    RouteAttribute::Oif(idx) => oif = Some(*idx),
                    _ => {}
                }
            }

            let Some(ifindex) = oif else { continue };
            let network = destination.unwrap_or(Ipv4Addr::UNSPECIFIED);
            if !prefix_contains(network, prefix_len, dest) {
                continue;
            }
            if best.map_or(true, |(len, _)| prefix_len > len) {
                best = Some((prefix_len, Route { ifindex, gateway }));
            }
        }

        best.map(|(_, route)| route)
            .ok_or(DatapathError::NoRoute(dest.into()))
    }

    /// MAC address of a local interface; zeroed when the link carries none.
    pub async fn link_mac(&self, ifindex: u32) -> Result<[u8; 6]> {
        let mut links = self.handle.link().get().match_index(ifindex).execute();
        let link = links
            .try_next()
            .await?
            .ok_or(DatapathError::LinkNotFound(ifindex))?;

        for attr in &link.attributes {
            if let LinkAttribute::Address(addr) = attr {
                if addr.len() == 6 {
                    let mut mac = [0u8; 6];
                    mac.copy_from_slice(addr);
                    return Ok(mac);
                }
            }
        }
        Ok([0u8; 6])
    }

    /// Interface name, needed to attach XDP programs.
    pub async fn link_name(&self, ifindex: u32) -> Result<String> {
        let mut links = self.handle.link().get().match_index(ifindex).execute();
        let link = links
            .try_next()
            .await?
            .ok_or(DatapathError::LinkNotFound(ifindex))?;

        for attr in &link.attributes {
            if let LinkAttribute::IfName(name) = attr {
                return Ok(name.clone());
            }
        }
        Err(DatapathError::LinkNotFound(ifindex))
    }

    /// ARP entry for `ip` on the given interface, if the kernel has one.
    pub async fn neighbour_mac(&self, ifindex: u32, ip: Ipv4Addr) -> Result<Option<[u8; 6]>> {
        let mut neighbours = self
            .handle
            .neighbours()
            .get()
            .set_family(IpVersion::V4)
            .execute();

        while let Some(neighbour) = neighbours.try_next().await? {
            if neighbour.header.ifindex != ifindex {
                continue;
            }
            let matches_ip = neighbour.attributes.iter().any(|attr| {
                matches!(
                    attr,
                    NeighbourAttribute::Destination(NeighbourAddress::Inet(v4)) if *v4 == ip
                )
            });
            if !matches_ip {
                continue;
            }
            for attr in &neighbour.attributes {
                if let NeighbourAttribute::LinkLocalAddress(addr) = attr {
                    if addr.len() == 6 {
                        let mut mac = [0u8; 6];
                        mac.copy_from_slice(addr);
                        return Ok(Some(mac));
                    }
                }
            }
        }
        Ok(None)
    }
}

fn prefix_contains(network: Ipv4Addr, prefix_len: u8, addr: Ipv4Addr) -> bool {
    if prefix_len == 0 {
        return true;
    }
    if prefix_len > 32 {
        return false;
    }
    let mask = u32::MAX << (32 - prefix_len);
    (u32::from(network) & mask) == (u32::from(addr) & mask)
}
