//! dynportd daemon entry point: configuration, wiring and lifecycle.

use anyhow::Context;
use clap::Parser;
use dynportd::config::{Config, LogFormat};
use dynportd::datapath::netinfo::NetInfo;
use dynportd::{Acl, DynPortServer, FilterReconciler, LeaseEvent, LeaseStore, Replication, XdpManager};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dynportd")]
#[command(about = "NAT-PMP dynamic port-forwarding gateway")]
struct Args {
    /// Config file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Directory to use for storing data
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,

    /// Log format (plain/json)
    #[arg(long, value_parser = parse_log_format)]
    log_format: Option<LogFormat>,

    /// IP to report to clients as external (default auto detect)
    #[arg(long)]
    external_ip: Option<Ipv4Addr>,

    /// Addresses to listen on for NAT-PMP requests, each a specific ip:port
    #[arg(long = "listen-addrs", value_delimiter = ',')]
    listen_addrs: Vec<String>,

    /// External port range to allocate from
    #[arg(long)]
    port_range: Option<String>,

    /// Create required iptables chains
    #[arg(long)]
    create_chains: Option<bool>,

    /// Disable the check for jumps into the managed chains
    #[arg(long)]
    skip_jump_check: Option<bool>,

    /// Allow port mappings by default
    #[arg(long)]
    acl_allow_default: Option<bool>,

    /// Use XDP to bypass iptables and conntrack for UDP
    #[arg(long)]
    ebpf_enabled: Option<bool>,

    /// Don't NAT these CIDRs (max 10)
    #[arg(long = "no-nat-cidr", value_delimiter = ',')]
    no_nat_cidr: Vec<String>,

    /// Enable replication and listen for peer requests on this address
    #[arg(long)]
    replication_listen_addr: Option<String>,

    /// Shared secret for replication basic auth
    #[arg(long)]
    replication_secret: Option<String>,

    /// Peers to replicate with, host:port
    #[arg(long = "replication-peers", value_delimiter = ',')]
    replication_peers: Vec<String>,
}

fn parse_log_format(raw: &str) -> Result<LogFormat, String> {
    match raw {
        "plain" => Ok(LogFormat::Plain),
        "json" => Ok(LogFormat::Json),
        other => Err(format!("unknown log format `{other}` (plain/json)")),
    }
}

fn apply_overrides(cfg: &mut Config, args: &Args) {
    if let Some(v) = &args.data_dir {
        cfg.data_dir = v.clone();
    }
    if let Some(v) = &args.log_level {
        cfg.log_level = v.clone();
    }
    if let Some(v) = args.log_format {
        cfg.log_format = v;
    }
    if args.external_ip.is_some() {
        cfg.external_ip = args.external_ip;
    }
    if !args.listen_addrs.is_empty() {
        cfg.listen_addrs = args.listen_addrs.clone();
    }
    if let Some(v) = &args.port_range {
        cfg.port_range = v.clone();
    }
    if let Some(v) = args.create_chains {
        cfg.create_chains = v;
    }
    if let Some(v) = args.skip_jump_check {
        cfg.skip_jump_check = v;
    }
    if let Some(v) = args.acl_allow_default {
        cfg.acl_allow_default = v;
    }
    if let Some(v) = args.ebpf_enabled {
        cfg.ebpf_enabled = v;
    }
    if !args.no_nat_cidr.is_empty() {
        cfg.no_nat_cidr = args.no_nat_cidr.clone();
    }
    if args.replication_listen_addr.is_some() {
        cfg.replication_listen_addr = args.replication_listen_addr.clone();
    }
    if args.replication_secret.is_some() {
        cfg.replication_secret = args.replication_secret.clone();
    }
    if !args.replication_peers.is_empty() {
        cfg.replication_peers = args.replication_peers.clone();
    }
}

fn init_tracing(cfg: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.log_level.clone()));
    match cfg.log_format {
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
        LogFormat::Plain => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut cfg = Config::load(&args.config).context("failed to load configuration")?;
    apply_overrides(&mut cfg, &args);

    init_tracing(&cfg);
    cfg.validate().context("invalid configuration")?;

    let listen_addrs = cfg.listen_socket_addrs()?;
    let port_range = cfg.external_port_range()?;
    let acl = Acl::compile(&cfg.acl, cfg.acl_allow_default)?;
    let external_ip = cfg.resolve_external_ip()?;
    info!(external_ip = %external_ip, "dynportd starting");

    tokio::fs::create_dir_all(&cfg.data_dir)
        .await
        .context("failed to create data directory")?;
    let store = Arc::new(LeaseStore::open(&cfg.data_dir).context("failed to open lease store")?);

    let filter = Arc::new(FilterReconciler::new(external_ip));
    filter
        .check_prerequisites(cfg.create_chains, cfg.skip_jump_check)
        .await
        .context("iptables prerequisite check failed")?;

    let netinfo = NetInfo::connect().context("failed to open netlink connection")?;
    let xdp = if cfg.ebpf_enabled {
        let listen_ips = listen_addrs.iter().map(|a| *a.ip()).collect();
        XdpManager::load(netinfo.clone(), external_ip, listen_ips, cfg.no_nat_nets()?)
            .await
            .context("failed to load xdp program")?
    } else {
        XdpManager::disabled(netinfo, external_ip)
    };
    let xdp = Arc::new(xdp);

    let filter_worker = Arc::clone(&filter).spawn_worker(Arc::clone(&store));
    let xdp_worker = Arc::clone(&xdp).spawn_worker(Arc::clone(&store));

    let (events_tx, events_rx) = broadcast::channel::<LeaseEvent>(64);

    let replication = Arc::new(Replication::new(
        cfg.replication_listen_addr
            .as_deref()
            .map(|raw| raw.parse())
            .transpose()
            .context("invalid replication listen addr")?,
        cfg.replication_secret.clone(),
        cfg.replication_peers.clone(),
        Arc::clone(&store),
        events_tx.clone(),
    )?);
    let replication_server = Arc::clone(&replication).spawn_server().await?;
    let full_sync_task = Arc::clone(&replication).spawn_full_sync();

    let engine = Arc::new(DynPortServer::new(
        listen_addrs,
        external_ip,
        port_range,
        acl,
        Arc::clone(&store),
        events_tx.clone(),
    ));
    let engine_handle = Arc::clone(&engine)
        .start()
        .await
        .context("failed to start nat-pmp listeners")?;

    // The orchestrator owns the fan-out: components only publish events.
    let fanout_task = tokio::spawn(fan_out(
        events_rx,
        filter_worker.kicker(),
        xdp_worker.kicker(),
        Arc::clone(&replication),
    ));

    let mut sigint = signal(SignalKind::interrupt()).context("failed to register SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to register SIGTERM handler")?;
    tokio::select! {
        _ = sigint.recv() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }

    info!("shutting down");
    engine_handle.stop();
    fanout_task.abort();
    if let Some(task) = full_sync_task {
        task.abort();
    }
    if let Some(task) = replication_server {
        task.abort();
    }
    filter_worker.shutdown().await;
    xdp_worker.shutdown().await;
    xdp.teardown().await;

    drop(engine);
    drop(replication);
    match Arc::try_unwrap(store) {
        Ok(store) => store.close(),
        Err(_) => warn!("lease store still referenced at shutdown"),
    }

    info!("dynportd stopped");
    Ok(())
}

/// Dispatch lease events: every change kicks both reconcilers, and admitted
/// leases are additionally pushed to peers off the hot path.
async fn fan_out(
    mut events: broadcast::Receiver<LeaseEvent>,
    filter_kick: tokio::sync::mpsc::Sender<()>,
    xdp_kick: tokio::sync::mpsc::Sender<()>,
    replication: Arc<Replication>,
) {
    loop {
        match events.recv().await {
            Ok(LeaseEvent::Admitted(lease)) => {
                let _ = filter_kick.try_send(());
                let _ = xdp_kick.try_send(());
                let replication = Arc::clone(&replication);
                tokio::spawn(async move { replication.push_to_peers(lease).await });
            }
            Ok(LeaseEvent::Synced) => {
                let _ = filter_kick.try_send(());
                let _ = xdp_kick.try_send(());
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "lease event receiver lagged; forcing reconcile");
                let _ = filter_kick.try_send(());
                let _ = xdp_kick.try_send(());
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}
