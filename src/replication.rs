//! Peer lease replication.
//!
//! Best-effort, last-writer-wins synchronization between gateways: a pull of
//! the full lease set on startup and every five minutes, plus a push of each
//! admitted lease as it happens. All conflict resolution lives in the store's
//! `upsert`; this module only moves JSON over HTTP/1.1 with a shared-secret
//! basic auth.

use crate::event::LeaseEvent;
use crate::lease::{LeaseId, PortMappingLease};
use crate::store::{LeaseStore, StoreError};
use axum::extract::{Path, Request, State};
use axum::http::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// Fixed basic-auth username; the password is the configured shared secret.
const REPL_USER: &str = "repl";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const FULL_SYNC_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("http client error: {0}")]
    Client(#[from] reqwest::Error),

    #[error("failed to bind replication listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, ReplicationError>;

pub struct Replication {
    store: Arc<LeaseStore>,
    events: broadcast::Sender<LeaseEvent>,
    client: reqwest::Client,
    listen_addr: Option<SocketAddr>,
    peers: Vec<String>,
    secret: String,
}

impl Replication {
    /// `listen_addr = None` disables replication entirely: the server never
    /// starts and sync/push become no-ops.
    pub fn new(
        listen_addr: Option<SocketAddr>,
        secret: Option<String>,
        peers: Vec<String>,
        store: Arc<LeaseStore>,
        events: broadcast::Sender<LeaseEvent>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Replication {
            store,
            events,
            client,
            listen_addr,
            peers,
            secret: secret.unwrap_or_default(),
        })
    }

    pub fn enabled(&self) -> bool {
        self.listen_addr.is_some()
    }

    /// Start the HTTP server, if replication is enabled.
    pub async fn spawn_server(self: Arc<Self>) -> Result<Option<JoinHandle<()>>> {
        let Some(addr) = self.listen_addr else {
            info!("replication is not enabled");
            return Ok(None);
        };

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ReplicationError::Bind { addr, source })?;
        info!(addr = %addr, "replication server listening");

        let router = self.router();
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                error!(error = %e, "replication server failed");
            }
        });
        Ok(Some(task))
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/leases", get(list_leases))
            .route("/leases/{id}", put(put_lease))
            .layer(middleware::from_fn_with_state(
                Arc::clone(&self),
                require_basic_auth,
            ))
            .layer(CatchPanicLayer::new())
            .layer(TraceLayer::new_for_http())
            .with_state(self)
    }

    /// Start the periodic full-sync task (first run immediately), if
    /// replication is enabled.
    pub fn spawn_full_sync(self: Arc<Self>) -> Option<JoinHandle<()>> {
        if !self.enabled() {
            return None;
        }
        let repl = self;
        Some(tokio::spawn(async move {
            let mut ticker = interval(FULL_SYNC_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                repl.run_full_sync().await;
            }
        }))
    }

    /// Pull every peer's lease set and merge it locally, then let the
    /// reconcilers pick up whatever changed.
    pub async fn run_full_sync(&self) {
        if !self.enabled() {
            return;
        }
        for peer in &self.peers {
            let url = format!("http://{peer}/leases");
            let response = match self
                .client
                .get(&url)
                .basic_auth(REPL_USER, Some(&self.secret))
                .send()
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    warn!(error = %e, url = %url, "failed to get leases");
                    continue;
                }
            };
            if response.status() != StatusCode::OK {
                warn!(url = %url, status = %response.status(), "unexpected response status");
                continue;
            }
            let leases: Vec<PortMappingLease> = match response.json().await {
                Ok(leases) => leases,
                Err(e) => {
                    warn!(error = %e, url = %url, "failed to decode leases");
                    continue;
                }
            };
            debug!(url = %url, count = leases.len(), "merging peer leases");
            for lease in &leases {
                if let Err(e) = self.store.upsert(lease) {
                    warn!(error = %e, lease = %lease.id, url = %url, "failed to merge peer lease");
                }
            }
        }
        let _ = self.events.send(LeaseEvent::Synced);
    }

    /// Push one admitted lease to every peer. Failures are logged and
    /// dropped; the periodic full sync heals missed updates.
    pub async fn push_to_peers(&self, lease: PortMappingLease) {
        if !self.enabled() {
            return;
        }
        debug!(lease = %lease.id, "pushing lease to peers");
        for peer in &self.peers {
            let url = format!("http://{peer}/leases/{}", lease.id);
            let response = match self
                .client
                .put(&url)
                .basic_auth(REPL_USER, Some(&self.secret))
                .json(&lease)
                .send()
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    warn!(error = %e, url = %url, "failed to put lease");
                    continue;
                }
            };
            if response.status() != StatusCode::OK {
                warn!(url = %url, status = %response.status(), "unexpected response status");
            }
        }
    }
}

async fn require_basic_auth(
    State(repl): State<Arc<Replication>>,
    request: Request,
    next: Next,
) -> Response {
    let authorized = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(|value| check_basic_auth(value, &repl.secret))
        .unwrap_or(false);

    if !authorized {
        return (
            StatusCode::UNAUTHORIZED,
            [(WWW_AUTHENTICATE, "Basic realm=\"replication\"")],
        )
            .into_response();
    }
    next.run(request).await
}

fn check_basic_auth(header: &str, secret: &str) -> bool {
    let Some(encoded) = header.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = BASE64.decode(encoded.trim()) else {
        return false;
    };
    let Ok(credentials) = String::from_utf8(decoded) else {
        return false;
    };
    let Some((user, password)) = credentials.split_once(':') else {
        return false;
    };
    user == REPL_USER && constant_time_eq(password.as_bytes(), secret.as_bytes())
}

/// Length-leaking but content-constant comparison; good enough for a shared
/// secret on a trusted replication network.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

async fn list_leases(State(repl): State<Arc<Replication>>) -> Response {
    match repl.store.get_all() {
        Ok(leases) => Json(leases).into_response(),
        Err(e) => {
            error!(error = %e, "failed to list leases");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn put_lease(
    State(repl): State<Arc<Replication>>,
    Path(id): Path<String>,
    Json(lease): Json<PortMappingLease>,
) -> StatusCode {
    match id.parse::<LeaseId>() {
        Ok(id) if id == lease.id => {}
        _ => return StatusCode::BAD_REQUEST,
    }

    match repl.store.upsert(&lease) {
        Ok(()) => {
            let _ = repl.events.send(LeaseEvent::Synced);
            StatusCode::OK
        }
        Err(StoreError::ExternalPortConflict(port)) => {
            warn!(lease = %lease.id, port, "rejecting peer lease with conflicting external port");
            StatusCode::CONFLICT
        }
        Err(e) => {
            error!(error = %e, lease = %lease.id, "failed to upsert peer lease");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
