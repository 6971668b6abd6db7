//! Packet-filter reconciler: renders the desired iptables rule set from the
//! active leases and swaps it in atomically.
//!
//! Each logical chain (`port-mapping`, `port-mapping-pre`,
//! `port-mapping-post`) only ever holds a single jump into a suffixed
//! working chain. A reconciliation pass builds a freshly-suffixed chain,
//! flips the jump, then garbage-collects every older suffixed chain. The
//! datapath therefore always sees either the complete old rule set or the
//! complete new one, never a partially-populated chain.

use super::{DatapathError, ReconcileHandle, Result};
use crate::lease::PortMappingLease;
use crate::store::LeaseStore;
use rand::Rng;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

const TABLE_FILTER: &str = "filter";
const TABLE_NAT: &str = "nat";
const CHAIN_FORWARD: &str = "FORWARD";
const CHAIN_PREROUTING: &str = "PREROUTING";
const CHAIN_POSTROUTING: &str = "POSTROUTING";
const CHAIN_PORT_MAPPING: &str = "port-mapping";
const CHAIN_PORT_MAPPING_PRE: &str = "port-mapping-pre";
const CHAIN_PORT_MAPPING_POST: &str = "port-mapping-post";

const RECONCILE_INTERVAL: Duration = Duration::from_secs(120);
const SUFFIX_LEN: usize = 6;

/// Thin wrapper around the `iptables` binary. Listing goes through `-S`,
/// whose output is the same rule-spec syntax the mutation commands take.
#[derive(Debug, Default)]
struct Iptables;

impl Iptables {
    async fn run(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("iptables")
            .args(args)
            .output()
            .await
            .map_err(|source| DatapathError::Exec {
                command: format!("iptables {}", args.join(" ")),
                source,
            })?;
        if !output.status.success() {
            return Err(DatapathError::CommandFailed {
                command: format!("iptables {}", args.join(" ")),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn chain_exists(&self, table: &str, chain: &str) -> bool {
        self.run(&["-t", table, "-S", chain]).await.is_ok()
    }

    async fn new_chain(&self, table: &str, chain: &str) -> Result<()> {
        self.run(&["-t", table, "-N", chain]).await.map(|_| ())
    }

    async fn clear_chain(&self, table: &str, chain: &str) -> Result<()> {
        self.run(&["-t", table, "-F", chain]).await.map(|_| ())
    }

    async fn clear_and_delete_chain(&self, table: &str, chain: &str) -> Result<()> {
        self.clear_chain(table, chain).await?;
        self.run(&["-t", table, "-X", chain]).await.map(|_| ())
    }

    async fn append(&self, table: &str, chain: &str, rule: &[String]) -> Result<()> {
        let mut args = vec!["-t", table, "-A", chain];
        args.extend(rule.iter().map(String::as_str));
        self.run(&args).await.map(|_| ())
    }

    async fn insert_jump(&self, table: &str, chain: &str, target: &str) -> Result<()> {
        self.run(&["-t", table, "-I", chain, "1", "-j", target])
            .await
            .map(|_| ())
    }

    async fn delete_rule(&self, table: &str, chain: &str, rule: &[String]) -> Result<()> {
        let mut args = vec!["-t", table, "-D", chain];
        args.extend(rule.iter().map(String::as_str));
        self.run(&args).await.map(|_| ())
    }

    /// The rules of one chain as argument vectors, `-N`/`-A <chain>` prefixes
    /// stripped.
    async fn list_rules(&self, table: &str, chain: &str) -> Result<Vec<Vec<String>>> {
        let output = self.run(&["-t", table, "-S", chain]).await?;
        Ok(parse_rule_listing(&output))
    }

    /// All chain names in a table.
    async fn list_chains(&self, table: &str) -> Result<Vec<String>> {
        let output = self.run(&["-t", table, "-S"]).await?;
        Ok(output
            .lines()
            .filter_map(|line| line.strip_prefix("-N "))
            .map(|name| name.trim().to_string())
            .collect())
    }
}

pub struct FilterReconciler {
    ipt: Iptables,
    external_ip: Ipv4Addr,
}

impl FilterReconciler {
    pub fn new(external_ip: Ipv4Addr) -> Self {
        FilterReconciler {
            ipt: Iptables,
            external_ip,
        }
    }

    /// Verify (or create) the three base chains and, unless skipped, the
    /// jumps that route traffic from the built-in chains into them.
    pub async fn check_prerequisites(&self, create_chains: bool, skip_jump_check: bool) -> Result<()> {
        self.check_chain(TABLE_FILTER, CHAIN_PORT_MAPPING, create_chains)
            .await?;
        self.check_chain(TABLE_NAT, CHAIN_PORT_MAPPING_PRE, create_chains)
            .await?;
        self.check_chain(TABLE_NAT, CHAIN_PORT_MAPPING_POST, create_chains)
            .await?;

        if !skip_jump_check {
            self.check_jump(TABLE_FILTER, CHAIN_FORWARD, CHAIN_PORT_MAPPING)
                .await?;
            self.check_jump(TABLE_NAT, CHAIN_PREROUTING, CHAIN_PORT_MAPPING_PRE)
                .await?;
            self.check_jump(TABLE_NAT, CHAIN_POSTROUTING, CHAIN_PORT_MAPPING_POST)
                .await?;
        }
        Ok(())
    }

    async fn check_chain(&self, table: &str, chain: &str, create: bool) -> Result<()> {
        if self.ipt.chain_exists(table, chain).await {
            return Ok(());
        }
        if create {
            self.ipt.new_chain(table, chain).await
        } else {
            Err(DatapathError::MissingChain {
                table: table.to_string(),
                chain: chain.to_string(),
            })
        }
    }

    async fn check_jump(&self, table: &str, chain: &str, target: &str) -> Result<()> {
        let rules = self.ipt.list_rules(table, chain).await?;
        if rules.iter().any(|rule| jump_target(rule) == Some(target)) {
            return Ok(());
        }
        Err(DatapathError::MissingJump {
            table: table.to_string(),
            chain: chain.to_string(),
            target: target.to_string(),
        })
    }

    /// One reconciliation pass over all three chains. A failing chain is
    /// logged and left on its previous consistent rule set; the others are
    /// still attempted.
    pub async fn ensure_mappings(&self, leases: &[PortMappingLease]) {
        let suffix = random_suffix();
        let plans: [(&str, &str, Vec<Vec<String>>); 3] = [
            (
                TABLE_FILTER,
                CHAIN_PORT_MAPPING,
                leases.iter().map(forward_rule).collect(),
            ),
            (
                TABLE_NAT,
                CHAIN_PORT_MAPPING_PRE,
                leases.iter().map(prerouting_rule).collect(),
            ),
            (
                TABLE_NAT,
                CHAIN_PORT_MAPPING_POST,
                leases.iter().map(|l| postrouting_rule(self.external_ip, l)).collect(),
            ),
        ];

        for (table, base, desired) in plans {
            if let Err(e) = self.ensure_in(table, base, &suffix, desired).await {
                error!(error = %e, table, chain = base, "failed to reconcile chain");
            }
        }
    }

    async fn ensure_in(
        &self,
        table: &str,
        base: &str,
        suffix: &str,
        desired: Vec<Vec<String>>,
    ) -> Result<()> {
        if let Some(current) = self.current_rules(table, base).await {
            if current == desired {
                debug!(table, chain = base, "no changes to chain");
                return Ok(());
            }
        }

        let chain = format!("{base}-{suffix}");
        if self.ipt.chain_exists(table, &chain).await {
            self.ipt.clear_chain(table, &chain).await?;
        } else {
            self.ipt.new_chain(table, &chain).await?;
        }
        for rule in &desired {
            self.ipt.append(table, &chain, rule).await?;
        }

        self.activate(table, base, suffix).await?;
        info!(table, chain = %chain, rules = desired.len(), "activated rule chain");
        Ok(())
    }

    /// The rule set currently reachable from the base chain: follow its
    /// single jump and list the target chain. `None` when the base chain is
    /// not in the expected one-jump shape, which forces a rebuild.
    async fn current_rules(&self, table: &str, base: &str) -> Option<Vec<Vec<String>>> {
        let rules = self.ipt.list_rules(table, base).await.ok()?;
        if rules.len() != 1 {
            return None;
        }
        let target = jump_target(&rules[0])?.to_string();
        self.ipt.list_rules(table, &target).await.ok()
    }

    /// Flip the base chain onto the new working chain: insert the jump at
    /// position 1, delete every other rule, then drop all stale suffixed
    /// chains.
    async fn activate(&self, table: &str, base: &str, suffix: &str) -> Result<()> {
        self.ipt
            .insert_jump(table, base, &format!("{base}-{suffix}"))
            .await?;

        let rules = self.ipt.list_rules(table, base).await?;
        for rule in rules.iter().skip(1) {
            self.ipt.delete_rule(table, base, rule).await?;
        }

        self.remove_stale_chains(table, base, suffix).await
    }

    async fn remove_stale_chains(&self, table: &str, base: &str, keep_suffix: &str) -> Result<()> {
        let keep = format!("{base}-{keep_suffix}");
        let prefix = format!("{base}-");
        for chain in self.ipt.list_chains(table).await? {
            if chain.starts_with(&prefix) && chain != keep {
                debug!(table, chain = %chain, "flushing and deleting stale chain");
                if let Err(e) = self.ipt.clear_and_delete_chain(table, &chain).await {
                    error!(error = %e, table, chain = %chain, "failed to delete stale chain");
                }
            }
        }
        Ok(())
    }

    /// Spawn the background worker: reconcile on a 2-minute timer (first
    /// tick immediately) and whenever kicked.
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
                        debug!("filter reconciler worker stopping");
                        return;
                    }
                }
            }
        });

        ReconcileHandle::new(kick_tx, shutdown_tx, task)
    }

    async fn reconcile(&self, store: &LeaseStore) {
        debug!("reconcile iptables");
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

fn forward_rule(lease: &PortMappingLease) -> Vec<String> {
    let proto = lease.protocol.as_str();
    vec![
        "-d".into(),
        format!("{}/32", lease.client_ip),
        "-p".into(),
        proto.into(),
        "-m".into(),
        proto.into(),
        "--dport".into(),
        lease.client_port.to_string(),
        "-m".into(),
        "comment".into(),
        "--comment".into(),
        lease.id.to_string(),
        "-j".into(),
        "ACCEPT".into(),
    ]
}

fn prerouting_rule(lease: &PortMappingLease) -> Vec<String> {
    let proto = lease.protocol.as_str();
    vec![
        "-p".into(),
        proto.into(),
        "-m".into(),
        proto.into(),
        "--dport".into(),
        lease.external_port.to_string(),
        "-m".into(),
        "comment".into(),
        "--comment".into(),
        lease.id.to_string(),
        "-j".into(),
        "DNAT".into(),
        "--to-destination".into(),
        format!("{}:{}", lease.client_ip, lease.client_port),
    ]
}

fn postrouting_rule(external_ip: Ipv4Addr, lease: &PortMappingLease) -> Vec<String> {
    let proto = lease.protocol.as_str();
    vec![
        "-s".into(),
        format!("{}/32", lease.client_ip),
        "-p".into(),
        proto.into(),
        "-m".into(),
        proto.into(),
        "--sport".into(),
        lease.client_port.to_string(),
        "-m".into(),
        "comment".into(),
        "--comment".into(),
        lease.id.to_string(),
        "-j".into(),
        "SNAT".into(),
        "--to-source".into(),
        format!("{}:{}", external_ip, lease.external_port),
    ]
}

/// The `-j` target of a parsed rule, if any.
fn jump_target(rule: &[String]) -> Option<&str> {
    rule.windows(2)
        .find(|pair| pair[0] == "-j")
        .map(|pair| pair[1].as_str())
}

/// Parse `iptables -S` output into rule argument vectors. Chain declarations
/// (`-N`) are skipped and the leading `-A <chain>` is stripped so the result
/// compares directly against rendered rules.
fn parse_rule_listing(output: &str) -> Vec<Vec<String>> {
    let mut rules = Vec::new();
    for line in output.lines() {
        let mut args = split_rule(line);
        if args.is_empty() || args[0] == "-N" {
            continue;
        }
        if args[0] == "-A" && args.len() >= 2 {
            args.drain(0..2);
        }
        rules.push(args);
    }
    rules
}

/// Tokenize one rule line. iptables quotes multi-word arguments (comments)
/// with double quotes and escapes embedded quotes with a backslash.
fn split_rule(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut escaped = false;
    let mut has_token = false;

    for ch in line.chars() {
        if escaped {
            current.push(ch);
            escaped = false;
            continue;
        }
        match ch {
            '\\' => {
                escaped = true;
                has_token = true;
            }
            '"' => {
                in_quotes = !in_quotes;
                has_token = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_token {
                    tokens.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if has_token {
        tokens.push(current);
    }
    tokens
}

/// Random 6-letter chain suffix; randomization keeps a fresh pass from
/// colliding with chains a crashed predecessor left behind.
fn random_suffix() -> String {
    const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
    let mut rng = rand::thread_rng();
    (0..SUFFIX_LEN)
        .map(|_| LETTERS[rng.gen_range(0..LETTERS.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::Protocol;
    use chrono::Utc;

    fn sample_lease() -> PortMappingLease {
        PortMappingLease::new(
            Protocol::Udp,
            Ipv4Addr::new(192, 168, 1, 10),
            4242,
            10123,
            Utc::now(),
        )
    }

    #[test]
    fn forward_rule_shape() {
        let lease = sample_lease();
        let rule = forward_rule(&lease);
        let expected: Vec<String> = [
            "-d",
            "192.168.1.10/32",
            "-p",
            "udp",
            "-m",
            "udp",
            "--dport",
            "4242",
            "-m",
            "comment",
            "--comment",
            &lease.id.to_string(),
            "-j",
            "ACCEPT",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(rule, expected);
    }

    #[test]
    fn prerouting_rule_shape() {
        let lease = sample_lease();
        let rule = prerouting_rule(&lease);
        assert_eq!(rule[rule.len() - 3], "DNAT");
        assert_eq!(rule.last().unwrap(), "192.168.1.10:4242");
        assert!(rule.contains(&"10123".to_string()));
    }

    #[test]
    fn postrouting_rule_shape() {
        let lease = sample_lease();
        let rule = postrouting_rule(Ipv4Addr::new(203, 0, 113, 1), &lease);
        assert_eq!(rule[0], "-s");
        assert_eq!(rule[1], "192.168.1.10/32");
        assert_eq!(rule[rule.len() - 3], "SNAT");
        assert_eq!(rule.last().unwrap(), "203.0.113.1:10123");
    }

    #[test]
    fn rendered_rules_survive_listing_round_trip() {
        // Simulate what `iptables -S port-mapping-abcdef` prints for a chain
        // we populated, and check it parses back to the rendered vector. An
        // unchanged rule set must compare equal or every pass would rebuild
        // the chain.
        let lease = sample_lease();
        let rendered = forward_rule(&lease);

        let listing = format!(
            "-N port-mapping-abcdef\n-A port-mapping-abcdef -d 192.168.1.10/32 -p udp -m udp --dport 4242 -m comment --comment \"{}\" -j ACCEPT\n",
            lease.id
        );
        let parsed = parse_rule_listing(&listing);
        assert_eq!(parsed, vec![rendered]);
    }

    #[test]
    fn split_rule_handles_quoted_comments() {
        let tokens = split_rule(r#"-A c -m comment --comment "two words" -j ACCEPT"#);
        assert_eq!(
            tokens,
            vec!["-A", "c", "-m", "comment", "--comment", "two words", "-j", "ACCEPT"]
        );

        let tokens = split_rule(r#"--comment "say \"hi\"""#);
        assert_eq!(tokens, vec!["--comment", r#"say "hi""#]);
    }

    #[test]
    fn jump_target_extraction() {
        let rule: Vec<String> = ["-j", "port-mapping-xyzabc"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(jump_target(&rule), Some("port-mapping-xyzabc"));
        assert_eq!(jump_target(&[]), None);
    }

    #[test]
    fn parse_rule_listing_skips_declarations() {
        let listing = "-N port-mapping\n-A port-mapping -j port-mapping-abcdef\n";
        let parsed = parse_rule_listing(listing);
        assert_eq!(parsed.len(), 1);
        assert_eq!(jump_target(&parsed[0]), Some("port-mapping-abcdef"));
    }

    #[test]
    fn random_suffix_is_six_letters() {
        for _ in 0..50 {
            let suffix = random_suffix();
            assert_eq!(suffix.len(), SUFFIX_LEN);
            assert!(suffix.chars().all(|c| c.is_ascii_alphabetic()));
        }
    }

    #[test]
    fn desired_rules_are_order_sensitive() {
        let a = sample_lease();
        let b = PortMappingLease::new(
            Protocol::Tcp,
            Ipv4Addr::new(192, 168, 1, 11),
            80,
            10124,
            Utc::now(),
        );
        let forward: Vec<Vec<String>> = [&a, &b].iter().map(|l| forward_rule(l)).collect();
        let reversed: Vec<Vec<String>> = [&b, &a].iter().map(|l| forward_rule(l)).collect();
        assert_ne!(forward, reversed);
    }
}
