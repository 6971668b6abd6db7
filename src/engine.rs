//! NAT-PMP protocol engine.
//!
//! One reader task per configured listen socket; each datagram is parsed,
//! checked against the ACL, turned into a lease upsert and answered in place.
//! Malformed datagrams beyond the version/opcode checks and any storage
//! failure produce no response at all; clients retry.

use crate::acl::Acl;
use crate::event::LeaseEvent;
use crate::lease::{PortMappingLease, Protocol};
use crate::store::LeaseStore;
use chrono::Utc;
use rand::Rng;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// NAT-PMP result codes used by this server.
const RESULT_OK: u16 = 0;
const RESULT_UNSUPPORTED_VERSION: u16 = 1;
const RESULT_NOT_AUTHORIZED: u16 = 2;
const RESULT_UNSUPPORTED_OPCODE: u16 = 5;

/// Response opcodes set bit 7 of the request opcode.
const RESPONSE_BIT: u8 = 128;

const OPCODE_EXTERNAL_ADDRESS: u8 = 0;

/// How many random probes the allocator makes before giving up.
const ALLOCATION_ATTEMPTS: usize = 10;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unsupported version {0}")]
    UnsupportedVersion(u8),

    #[error("unsupported opcode {0}")]
    UnsupportedOpcode(u8),

    #[error("truncated datagram ({0} bytes)")]
    Truncated(usize),

    #[error("failed to bind udp socket on {addr}: {source}")]
    Bind {
        addr: SocketAddrV4,
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

pub struct DynPortServer {
    listen_addrs: Vec<SocketAddrV4>,
    external_ip: Ipv4Addr,
    port_range: RangeInclusive<u16>,
    acl: Acl,
    store: Arc<LeaseStore>,
    events: broadcast::Sender<LeaseEvent>,
    started: Instant,
}

/// Running listener tasks; dropping the tasks closes the sockets and
/// unblocks the reader loops.
pub struct EngineHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    pub fn stop(self) {
        for task in self.tasks {
            task.abort();
        }
        info!("protocol engine stopped");
    }
}

impl DynPortServer {
    pub fn new(
        listen_addrs: Vec<SocketAddrV4>,
        external_ip: Ipv4Addr,
        port_range: RangeInclusive<u16>,
        acl: Acl,
        store: Arc<LeaseStore>,
        events: broadcast::Sender<LeaseEvent>,
    ) -> Self {
        DynPortServer {
            listen_addrs,
            external_ip,
            port_range,
            acl,
            store,
            events,
            started: Instant::now(),
        }
    }

    /// Bind all listen sockets and spawn one reader task per socket.
    pub async fn start(self: Arc<Self>) -> Result<EngineHandle> {
        let mut tasks = Vec::with_capacity(self.listen_addrs.len());
        for addr in &self.listen_addrs {
            let socket = UdpSocket::bind(SocketAddr::V4(*addr))
                .await
                .map_err(|source| ProtocolError::Bind { addr: *addr, source })?;
            info!(addr = %addr, "listening for nat-pmp requests");

            let server = Arc::clone(&self);
            tasks.push(tokio::spawn(async move {
                let mut buf = [0u8; 1500];
                loop {
                    let (len, src) = match socket.recv_from(&mut buf).await {
                        Ok(read) => read,
                        Err(e) => {
                            error!(error = %e, "udp receive failed");
                            return;
                        }
                    };
                    let SocketAddr::V4(src) = src else {
                        continue;
                    };
                    debug!(len, src = %src, "received datagram");
                    if let Some(response) = server.handle_datagram(*src.ip(), &buf[..len]).await {
                        if let Err(e) = socket.send_to(&response, SocketAddr::V4(src)).await {
                            warn!(error = %e, src = %src, "failed to send response");
                        }
                    }
                }
            }));
        }
        Ok(EngineHandle { tasks })
    }

    /// Process one datagram; returns the response bytes to send back, if any.
    pub(crate) async fn handle_datagram(&self, client_ip: Ipv4Addr, buf: &[u8]) -> Option<Vec<u8>> {
        if buf.is_empty() {
            warn!(client = %client_ip, error = %ProtocolError::Truncated(0), "dropping datagram");
            return None;
        }
        if buf[0] != 0 {
            warn!(client = %client_ip, error = %ProtocolError::UnsupportedVersion(buf[0]), "rejecting datagram");
            return Some(self.error_response(RESULT_UNSUPPORTED_VERSION));
        }
        if buf.len() < 2 {
            warn!(client = %client_ip, error = %ProtocolError::Truncated(buf.len()), "rejecting datagram");
            return Some(self.error_response(RESULT_UNSUPPORTED_OPCODE));
        }

        match buf[1] {
            OPCODE_EXTERNAL_ADDRESS => Some(self.external_address_response()),
            op if Protocol::from_opcode(op).is_some() => {
                self.handle_mapping_request(op, client_ip, &buf[4.min(buf.len())..])
                    .await
            }
            op => {
                warn!(client = %client_ip, error = %ProtocolError::UnsupportedOpcode(op), "rejecting datagram");
                Some(self.error_response(RESULT_UNSUPPORTED_OPCODE))
            }
        }
    }

    async fn handle_mapping_request(
        &self,
        op: u8,
        client_ip: Ipv4Addr,
        body: &[u8],
    ) -> Option<Vec<u8>> {
        if body.len() < 8 {
            warn!(client = %client_ip, error = %ProtocolError::Truncated(body.len() + 4), "dropping mapping request");
            return None;
        }
        let internal_port = u16::from_be_bytes([body[0], body[1]]);
        let requested_external = u16::from_be_bytes([body[2], body[3]]);
        let lifetime = u32::from_be_bytes([body[4], body[5], body[6], body[7]]);
        // The protocol is implied by the opcode; the requested external port
        // is advisory and ignored, the server always chooses.
        let protocol = Protocol::from_opcode(op)?;

        info!(
            client = %client_ip,
            internal_port,
            requested_external,
            lifetime,
            protocol = %protocol,
            "received mapping request"
        );

        if !self.acl.allows(client_ip, internal_port) {
            warn!(client = %client_ip, internal_port, "port mapping not allowed");
            return Some(self.mapping_response(
                op,
                RESULT_NOT_AUTHORIZED,
                internal_port,
                requested_external,
                lifetime,
            ));
        }

        let existing = match self.store.get_by_client(client_ip, internal_port, protocol) {
            Ok(existing) => existing,
            Err(e) => {
                error!(error = %e, client = %client_ip, "failed to look up existing lease");
                return None;
            }
        };

        let now = Utc::now();
        let lease = match existing {
            Some(mut lease) => {
                lease.last_seen = now;
                lease
            }
            None => {
                let external_port = match self.allocate_external_port() {
                    Some(port) => port,
                    None => {
                        error!(client = %client_ip, "no free external port after {ALLOCATION_ATTEMPTS} attempts");
                        return None;
                    }
                };
                PortMappingLease::new(protocol, client_ip, internal_port, external_port, now)
            }
        };

        if let Err(e) = self.store.upsert(&lease) {
            error!(error = %e, lease = %lease.id, "failed to upsert lease");
            return None;
        }

        debug!(
            client = %client_ip,
            internal_port,
            external_port = lease.external_port,
            lease = %lease.id,
            "mapping admitted"
        );
        // Fire-and-forget: subscribers run on their own tasks and their
        // errors never reach the request path.
        let _ = self.events.send(LeaseEvent::Admitted(lease.clone()));

        Some(self.mapping_response(
            op,
            RESULT_OK,
            internal_port,
            lease.external_port,
            lifetime,
        ))
    }

    fn allocate_external_port(&self) -> Option<u16> {
        let mut rng = rand::thread_rng();
        for _ in 0..ALLOCATION_ATTEMPTS {
            let candidate = rng.gen_range(self.port_range.clone());
            match self.store.is_external_port_in_use(candidate) {
                Ok(false) => return Some(candidate),
                Ok(true) => continue,
                // A failed probe counts as a collision.
                Err(e) => {
                    error!(error = %e, candidate, "external port probe failed");
                    continue;
                }
            }
        }
        None
    }

    /// Saturating seconds since the server started, the protocol's
    /// "Seconds Since Start of Epoch" field.
    fn epoch_seconds(&self) -> u32 {
        u32::try_from(self.started.elapsed().as_secs()).unwrap_or(u32::MAX)
    }

    fn error_response(&self, code: u16) -> Vec<u8> {
        let mut res = vec![0u8; 8];
        res[2..4].copy_from_slice(&code.to_be_bytes());
        res[4..8].copy_from_slice(&self.epoch_seconds().to_be_bytes());
        res
    }

    fn external_address_response(&self) -> Vec<u8> {
        let mut res = vec![0u8; 12];
        res[1] = RESPONSE_BIT + OPCODE_EXTERNAL_ADDRESS;
        res[2..4].copy_from_slice(&RESULT_OK.to_be_bytes());
        res[4..8].copy_from_slice(&self.epoch_seconds().to_be_bytes());
        res[8..12].copy_from_slice(&self.external_ip.octets());
        res
    }

    fn mapping_response(
        &self,
        op: u8,
        code: u16,
        internal_port: u16,
        external_port: u16,
        lifetime: u32,
    ) -> Vec<u8> {
        let mut res = vec![0u8; 16];
        res[1] = RESPONSE_BIT + op;
        res[2..4].copy_from_slice(&code.to_be_bytes());
        res[4..8].copy_from_slice(&self.epoch_seconds().to_be_bytes());
        res[8..10].copy_from_slice(&internal_port.to_be_bytes());
        res[10..12].copy_from_slice(&external_port.to_be_bytes());
        res[12..16].copy_from_slice(&lifetime.to_be_bytes());
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AclEntry;

    struct Fixture {
        _dir: tempfile::TempDir,
        server: DynPortServer,
        store: Arc<LeaseStore>,
        events: broadcast::Receiver<LeaseEvent>,
    }

    fn fixture(acl_entries: &[AclEntry], allow_default: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LeaseStore::open(dir.path()).unwrap());
        let (tx, rx) = broadcast::channel(16);
        let server = DynPortServer::new(
            vec!["192.0.2.1:5351".parse().unwrap()],
            Ipv4Addr::new(198, 51, 100, 7),
            10000..=19999,
            Acl::compile(acl_entries, allow_default).unwrap(),
            Arc::clone(&store),
            tx,
        );
        Fixture {
            _dir: dir,
            server,
            store,
            events: rx,
        }
    }

    // version 0, opcode 1 (UDP), internal port 4242, external 0, lifetime 1800
    const UDP_MAPPING_REQUEST: [u8; 12] =
        [0x00, 0x01, 0x00, 0x00, 0x10, 0x92, 0x00, 0x00, 0x00, 0x00, 0x07, 0x08];

    #[tokio::test]
    async fn udp_mapping_request_creates_lease() {
        let mut fx = fixture(&[], true);
        let client = Ipv4Addr::new(192, 168, 1, 10);

        let res = fx
            .server
            .handle_datagram(client, &UDP_MAPPING_REQUEST)
            .await
            .expect("expected a response");

        assert_eq!(res.len(), 16);
        assert_eq!(&res[0..4], &[0x00, 0x81, 0x00, 0x00]);
        assert_eq!(&res[8..10], &[0x10, 0x92]);
        let external = u16::from_be_bytes([res[10], res[11]]);
        assert!((10000..=19999).contains(&external));
        assert_eq!(&res[12..16], &[0x00, 0x00, 0x07, 0x08]);

        let leases = fx.store.get_all().unwrap();
        assert_eq!(leases.len(), 1);
        assert_eq!(leases[0].client_ip, client);
        assert_eq!(leases[0].client_port, 4242);
        assert_eq!(leases[0].protocol, Protocol::Udp);
        assert_eq!(leases[0].external_port, external);

        match fx.events.try_recv().unwrap() {
            LeaseEvent::Admitted(lease) => assert_eq!(lease.external_port, external),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn repeated_request_keeps_external_port() {
        let fx = fixture(&[], true);
        let client = Ipv4Addr::new(192, 168, 1, 10);

        let first = fx
            .server
            .handle_datagram(client, &UDP_MAPPING_REQUEST)
            .await
            .unwrap();
        let first_seen = fx.store.get_all().unwrap()[0].last_seen;

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let second = fx
            .server
            .handle_datagram(client, &UDP_MAPPING_REQUEST)
            .await
            .unwrap();

        assert_eq!(&first[10..12], &second[10..12]);
        let leases = fx.store.get_all().unwrap();
        assert_eq!(leases.len(), 1);
        assert!(leases[0].last_seen > first_seen);
    }

    #[tokio::test]
    async fn unsupported_opcode_gets_result_code_5() {
        let fx = fixture(&[], true);
        let res = fx
            .server
            .handle_datagram(Ipv4Addr::new(192, 168, 1, 10), &[0x00, 0x03])
            .await
            .unwrap();
        assert_eq!(res.len(), 8);
        assert_eq!(&res[2..4], &[0x00, 0x05]);
    }

    #[tokio::test]
    async fn unsupported_version_gets_result_code_1() {
        let fx = fixture(&[], true);
        let res = fx
            .server
            .handle_datagram(Ipv4Addr::new(192, 168, 1, 10), &[0x01, 0x01])
            .await
            .unwrap();
        assert_eq!(res.len(), 8);
        assert_eq!(&res[2..4], &[0x00, 0x01]);
    }

    #[tokio::test]
    async fn denied_client_gets_result_code_2_and_no_lease() {
        let fx = fixture(
            &[AclEntry {
                cidr: "10.0.0.0/8".to_string(),
                internal_ports: "1-65535".to_string(),
                deny: true,
            }],
            true,
        );
        let res = fx
            .server
            .handle_datagram(Ipv4Addr::new(10, 0, 0, 5), &UDP_MAPPING_REQUEST)
            .await
            .unwrap();
        assert_eq!(res.len(), 16);
        assert_eq!(&res[2..4], &[0x00, 0x02]);
        assert!(fx.store.get_all().unwrap().is_empty());
    }

    #[tokio::test]
    async fn external_address_request_echoes_configured_ip() {
        let fx = fixture(&[], true);
        let res = fx
            .server
            .handle_datagram(Ipv4Addr::new(192, 168, 1, 10), &[0x00, 0x00])
            .await
            .unwrap();
        assert_eq!(res.len(), 12);
        assert_eq!(res[1], 0x80);
        assert_eq!(&res[2..4], &[0x00, 0x00]);
        assert_eq!(&res[8..12], &[198, 51, 100, 7]);
    }

    #[tokio::test]
    async fn truncated_mapping_request_gets_no_response() {
        let fx = fixture(&[], true);
        let res = fx
            .server
            .handle_datagram(Ipv4Addr::new(192, 168, 1, 10), &[0x00, 0x01, 0x00, 0x00, 0x10])
            .await;
        assert!(res.is_none());
        assert!(fx.store.get_all().unwrap().is_empty());
    }

    #[tokio::test]
    async fn tcp_mapping_is_distinct_from_udp() {
        let fx = fixture(&[], true);
        let client = Ipv4Addr::new(192, 168, 1, 10);

        fx.server
            .handle_datagram(client, &UDP_MAPPING_REQUEST)
            .await
            .unwrap();

        let mut tcp_request = UDP_MAPPING_REQUEST;
        tcp_request[1] = 0x02;
        let res = fx.server.handle_datagram(client, &tcp_request).await.unwrap();
        assert_eq!(res[1], 0x82);

        let leases = fx.store.get_all().unwrap();
        assert_eq!(leases.len(), 2);
    }
}
