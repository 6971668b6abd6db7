//! Replication HTTP endpoint integration tests.
//!
//! Spins the real router on an OS-assigned port with a temp-dir store and a
//! plain reqwest client, covering auth, the lease endpoints and last-writer-
//! wins merging end to end.

use chrono::{Duration, Utc};
use dynportd::{LeaseId, LeaseStore, PortMappingLease, Protocol, Replication};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

const SECRET: &str = "test-secret";

struct TestServer {
    addr: SocketAddr,
    client: reqwest::Client,
    store: Arc<LeaseStore>,
    _dir: tempfile::TempDir,
    shutdown_tx: tokio::sync::oneshot::Sender<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(LeaseStore::open(dir.path()).expect("open store"));
        let (events_tx, _) = broadcast::channel(16);

        let replication = Arc::new(
            Replication::new(
                Some("127.0.0.1:0".parse().unwrap()),
                Some(SECRET.to_string()),
                Vec::new(),
                Arc::clone(&store),
                events_tx,
            )
            .expect("replication"),
        );
        let router = Arc::clone(&replication).router();

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().unwrap();

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .expect("server error");
        });

        TestServer {
            addr,
            client: reqwest::Client::new(),
            store,
            _dir: dir,
            shutdown_tx,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn get_leases(&self) -> reqwest::Response {
        self.client
            .get(self.url("/leases"))
            .basic_auth("repl", Some(SECRET))
            .send()
            .await
            .expect("request failed")
    }

    async fn put_lease(&self, lease: &PortMappingLease) -> reqwest::Response {
        self.client
            .put(self.url(&format!("/leases/{}", lease.id)))
            .basic_auth("repl", Some(SECRET))
            .json(lease)
            .send()
            .await
            .expect("request failed")
    }

    async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
    }
}

fn sample_lease() -> PortMappingLease {
    PortMappingLease::new(
        Protocol::Udp,
        Ipv4Addr::new(192, 168, 1, 10),
        4242,
        10123,
        Utc::now(),
    )
}

#[tokio::test]
async fn requests_without_credentials_are_rejected() {
    let server = TestServer::spawn().await;

    let response = reqwest::get(server.url("/leases")).await.unwrap();
    assert_eq!(response.status(), 401);

    let response = reqwest::Client::new()
        .get(server.url("/leases"))
        .basic_auth("repl", Some("wrong"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    server.shutdown().await;
}

#[tokio::test]
async fn put_then_get_round_trips_a_lease() {
    let server = TestServer::spawn().await;
    let lease = sample_lease();

    let response = server.put_lease(&lease).await;
    assert_eq!(response.status(), 200);

    let response = server.get_leases().await;
    assert_eq!(response.status(), 200);
    let leases: Vec<PortMappingLease> = response.json().await.unwrap();
    assert_eq!(leases, vec![lease]);

    server.shutdown().await;
}

#[tokio::test]
async fn stale_put_keeps_local_last_seen() {
    let server = TestServer::spawn().await;
    let lease = sample_lease();
    server.store.upsert(&lease).expect("seed lease");

    let mut stale = lease.clone();
    stale.last_seen = lease.last_seen - Duration::seconds(1);
    let response = server.put_lease(&stale).await;
    assert_eq!(response.status(), 200);
    assert_eq!(
        server.store.get_by_id(lease.id).unwrap().unwrap().last_seen,
        lease.last_seen
    );

    let mut newer = lease.clone();
    newer.last_seen = lease.last_seen + Duration::seconds(1);
    let response = server.put_lease(&newer).await;
    assert_eq!(response.status(), 200);
    assert_eq!(
        server.store.get_by_id(lease.id).unwrap().unwrap().last_seen,
        newer.last_seen
    );

    server.shutdown().await;
}

#[tokio::test]
async fn conflicting_external_port_is_rejected_with_409() {
    let server = TestServer::spawn().await;
    let lease = sample_lease();
    server.store.upsert(&lease).expect("seed lease");

    // A different client triple that claims the same external port.
    let conflicting = PortMappingLease::new(
        Protocol::Udp,
        Ipv4Addr::new(192, 168, 1, 11),
        4242,
        lease.external_port,
        Utc::now(),
    );
    let response = server.put_lease(&conflicting).await;
    assert_eq!(response.status(), 409);
    assert_eq!(server.store.get_by_id(conflicting.id).unwrap(), None);

    server.shutdown().await;
}

#[tokio::test]
async fn mismatched_path_and_body_id_is_a_bad_request() {
    let server = TestServer::spawn().await;
    let lease = sample_lease();
    let other_id = LeaseId::from_u128(lease.id.as_u128() ^ 1);

    let response = server
        .client
        .put(server.url(&format!("/leases/{other_id}")))
        .basic_auth("repl", Some(SECRET))
        .json(&lease)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    server.shutdown().await;
}

#[tokio::test]
async fn full_sync_pulls_peer_state() {
    // Peer A holds a lease; B full-syncs from A and ends up with it.
    let peer_a = TestServer::spawn().await;
    let lease = sample_lease();
    peer_a.store.upsert(&lease).expect("seed lease");

    let dir_b = tempfile::tempdir().unwrap();
    let store_b = Arc::new(LeaseStore::open(dir_b.path()).unwrap());
    let (events_tx, mut events_rx) = broadcast::channel(16);
    let replication_b = Arc::new(
        Replication::new(
            Some("127.0.0.1:0".parse().unwrap()),
            Some(SECRET.to_string()),
            vec![peer_a.addr.to_string()],
            Arc::clone(&store_b),
            events_tx,
        )
        .unwrap(),
    );

    replication_b.run_full_sync().await;

    assert_eq!(store_b.get_by_id(lease.id).unwrap(), Some(lease));
    // Merging emits a sync event for the reconcilers.
    assert!(matches!(
        events_rx.try_recv(),
        Ok(dynportd::LeaseEvent::Synced)
    ));

    peer_a.shutdown().await;
}
