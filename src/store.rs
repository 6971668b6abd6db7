//! Persistent lease index backed by an embedded redb database.
//!
//! The store is the sole owner of on-disk state. Everything else either reads
//! snapshots (`get_all` / `get_active`) or funnels writes through `upsert`,
//! which runs its read-compare-write cycle inside a single write transaction
//! so concurrent refreshes from the protocol engine and replication cannot
//! lose updates.

use crate::lease::{LeaseId, PortMappingLease, Protocol};
use chrono::Utc;
use redb::{Database, ReadableTable, TableDefinition};
use std::net::Ipv4Addr;
use std::path::Path;
use thiserror::Error;
use tracing::info;

/// Primary table: lease id -> canonical JSON encoding of the lease.
const TABLE_LEASES: TableDefinition<u128, &[u8]> = TableDefinition::new("leases");

/// Secondary index over the immutable client triple. Keyed by
/// `(ip, internal port, protocol, id)` so duplicates introduced by a peer
/// push are observable instead of silently shadowed.
const TABLE_IDX_CLIENT: TableDefinition<(u32, u16, u8, u128), ()> =
    TableDefinition::new("idx_client");

/// Secondary index over allocated external ports, keyed `(port, id)`.
/// External-port uniqueness holds across all stored leases, active or not.
const TABLE_IDX_EXTERNAL: TableDefinition<(u16, u128), ()> =
    TableDefinition::new("idx_external");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("lease encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("multiple leases match client {ip}:{port}/{protocol}")]
    MultipleMatches {
        ip: Ipv4Addr,
        port: u16,
        protocol: Protocol,
    },

    #[error("external port {0} is already allocated to another lease")]
    ExternalPortConflict(u16),

    #[error("index entry {0} points to a missing lease")]
    Corrupted(LeaseId),
}

pub type Result<T> = std::result::Result<T, StoreError>;

pub struct LeaseStore {
    db: Database,
}

impl LeaseStore {
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let db_path = data_dir.as_ref().join("leases.redb");
        let db = Database::create(&db_path)?;

        let txn = db.begin_write()?;
        txn.open_table(TABLE_LEASES)?;
        txn.open_table(TABLE_IDX_CLIENT)?;
        txn.open_table(TABLE_IDX_EXTERNAL)?;
        txn.commit()?;

        info!(path = %db_path.display(), "lease store opened");
        Ok(LeaseStore { db })
    }

    /// Every stored lease, regardless of liveness.
    pub fn get_all(&self) -> Result<Vec<PortMappingLease>> {
        let txn = self.db.begin_read()?;
        let leases = txn.open_table(TABLE_LEASES)?;

        let mut result = Vec::new();
        for item in leases.iter()? {
            let (_, value) = item?;
            result.push(serde_json::from_slice(value.value())?);
        }
        Ok(result)
    }

    /// Leases inside the liveness window; the input to datapath
    /// reconciliation.
    pub fn get_active(&self) -> Result<Vec<PortMappingLease>> {
        let now = Utc::now();
        let mut leases = self.get_all()?;
        leases.retain(|lease| lease.is_active(now));
        Ok(leases)
    }

    pub fn get_by_id(&self, id: LeaseId) -> Result<Option<PortMappingLease>> {
        let txn = self.db.begin_read()?;
        let leases = txn.open_table(TABLE_LEASES)?;
        match leases.get(id.as_u128())? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    /// Exactly-one lookup over the client triple. More than one match means
    /// the invariant that the triple determines the lease was broken (for
    /// example by a malformed peer push) and is surfaced as a hard error.
    pub fn get_by_client(
        &self,
        ip: Ipv4Addr,
        port: u16,
        protocol: Protocol,
    ) -> Result<Option<PortMappingLease>> {
        let txn = self.db.begin_read()?;
        let idx = txn.open_table(TABLE_IDX_CLIENT)?;

        let prefix = (u32::from(ip), port, protocol as u8);
        let range = idx.range(
            (prefix.0, prefix.1, prefix.2, 0u128)..=(prefix.0, prefix.1, prefix.2, u128::MAX),
        )?;

        let mut found: Option<LeaseId> = None;
        for item in range {
            let (key, _) = item?;
            let (_, _, _, raw_id) = key.value();
            if found.is_some() {
                return Err(StoreError::MultipleMatches { ip, port, protocol });
            }
            found = Some(LeaseId::from_u128(raw_id));
        }

        match found {
            Some(id) => {
                let leases = txn.open_table(TABLE_LEASES)?;
                match leases.get(id.as_u128())? {
                    Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
                    None => Err(StoreError::Corrupted(id)),
                }
            }
            None => Ok(None),
        }
    }

    /// Existence probe over all stored leases, used by port allocation.
    pub fn is_external_port_in_use(&self, port: u16) -> Result<bool> {
        let txn = self.db.begin_read()?;
        let idx = txn.open_table(TABLE_IDX_EXTERNAL)?;
        let mut range = idx.range((port, 0u128)..=(port, u128::MAX))?;
        Ok(range.next().transpose()?.is_some())
    }

    /// Insert-or-refresh.
    ///
    /// A new id is inserted verbatim, unless its external port is already
    /// indexed under a different id (`ExternalPortConflict`; replication maps
    /// this to HTTP 409). A known id only ever advances `last_seen`, and only
    /// when the incoming value is strictly greater: last writer wins, ties
    /// favor the stored value. All other fields are immutable and kept from
    /// storage.
    pub fn upsert(&self, lease: &PortMappingLease) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut leases = txn.open_table(TABLE_LEASES)?;
            let mut idx_client = txn.open_table(TABLE_IDX_CLIENT)?;
            let mut idx_external = txn.open_table(TABLE_IDX_EXTERNAL)?;

            let existing: Option<PortMappingLease> = match leases.get(lease.id.as_u128())? {
                Some(value) => Some(serde_json::from_slice(value.value())?),
                None => None,
            };

            match existing {
                None => {
                    {
                        let range = idx_external
                            .range((lease.external_port, 0u128)..=(lease.external_port, u128::MAX))?;
                        for item in range {
                            let (key, _) = item?;
                            if key.value().1 != lease.id.as_u128() {
                                return Err(StoreError::ExternalPortConflict(lease.external_port));
                            }
                        }
                    }

                    let encoded = serde_json::to_vec(lease)?;
                    leases.insert(lease.id.as_u128(), encoded.as_slice())?;
                    idx_client.insert(
                        (
                            u32::from(lease.client_ip),
                            lease.client_port,
                            lease.protocol as u8,
                            lease.id.as_u128(),
                        ),
                        (),
                    )?;
                    idx_external.insert((lease.external_port, lease.id.as_u128()), ())?;
                }
                Some(mut stored) => {
                    if lease.last_seen > stored.last_seen {
                        stored.last_seen = lease.last_seen;
                        let encoded = serde_json::to_vec(&stored)?;
                        leases.insert(stored.id.as_u128(), encoded.as_slice())?;
                    }
                }
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Flush and release the on-disk database. Dropping the store has the
    /// same effect; this only exists so shutdown order is explicit.
    pub fn close(self) {
        info!("lease store closed");
        drop(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn open_store() -> (tempfile::TempDir, LeaseStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = LeaseStore::open(dir.path()).unwrap();
        (dir, store)
    }

    fn lease(ip: [u8; 4], port: u16, proto: Protocol, external: u16) -> PortMappingLease {
        PortMappingLease::new(proto, Ipv4Addr::from(ip), port, external, Utc::now())
    }

    #[test]
    fn insert_and_lookup() {
        let (_dir, store) = open_store();
        let l = lease([192, 168, 1, 10], 4242, Protocol::Udp, 10001);
        store.upsert(&l).unwrap();

        assert_eq!(store.get_by_id(l.id).unwrap(), Some(l.clone()));
        assert_eq!(
            store
                .get_by_client(l.client_ip, l.client_port, l.protocol)
                .unwrap(),
            Some(l.clone())
        );
        assert!(store.is_external_port_in_use(10001).unwrap());
        assert!(!store.is_external_port_in_use(10002).unwrap());
        assert_eq!(store.get_all().unwrap(), vec![l]);
    }

    #[test]
    fn missing_lookups_return_none() {
        let (_dir, store) = open_store();
        let l = lease([192, 168, 1, 10], 4242, Protocol::Udp, 10001);
        assert_eq!(store.get_by_id(l.id).unwrap(), None);
        assert_eq!(
            store
                .get_by_client(Ipv4Addr::new(1, 2, 3, 4), 80, Protocol::Tcp)
                .unwrap(),
            None
        );
    }

    #[test]
    fn upsert_refresh_advances_last_seen_only() {
        let (_dir, store) = open_store();
        let original = lease([10, 0, 0, 1], 5000, Protocol::Udp, 10500);
        store.upsert(&original).unwrap();

        // Refresh with a later timestamp and (bogus) different external port:
        // only last_seen may change.
        let mut refresh = original.clone();
        refresh.last_seen = original.last_seen + Duration::seconds(30);
        refresh.external_port = 19999;
        store.upsert(&refresh).unwrap();

        let stored = store.get_by_id(original.id).unwrap().unwrap();
        assert_eq!(stored.last_seen, refresh.last_seen);
        assert_eq!(stored.external_port, original.external_port);
        assert_eq!(stored.created, original.created);
    }

    #[test]
    fn upsert_ignores_stale_last_seen() {
        let (_dir, store) = open_store();
        let original = lease([10, 0, 0, 1], 5000, Protocol::Udp, 10500);
        store.upsert(&original).unwrap();

        let mut stale = original.clone();
        stale.last_seen = original.last_seen - Duration::seconds(1);
        store.upsert(&stale).unwrap();

        let stored = store.get_by_id(original.id).unwrap().unwrap();
        assert_eq!(stored.last_seen, original.last_seen);

        // Equal timestamps are also a no-op: ties favor the local value.
        store.upsert(&original).unwrap();
        assert_eq!(
            store.get_by_id(original.id).unwrap().unwrap().last_seen,
            original.last_seen
        );
    }

    #[test]
    fn upsert_monotonicity_over_shuffled_timestamps() {
        let (_dir, store) = open_store();
        let base = lease([10, 0, 0, 7], 6000, Protocol::Tcp, 10700);
        let offsets = [5i64, 1, 9, 3, 9, 2];

        let mut max_seen = base.last_seen;
        for off in offsets {
            let mut update = base.clone();
            update.last_seen = base.last_seen + Duration::seconds(off);
            max_seen = max_seen.max(update.last_seen);
            store.upsert(&update).unwrap();
        }

        let stored = store.get_by_id(base.id).unwrap().unwrap();
        assert_eq!(stored.last_seen, max_seen);
    }

    #[test]
    fn external_port_conflict_is_rejected() {
        let (_dir, store) = open_store();
        let first = lease([10, 0, 0, 1], 5000, Protocol::Udp, 10500);
        store.upsert(&first).unwrap();

        // Different client triple, hence different id, same external port.
        let second = lease([10, 0, 0, 2], 5000, Protocol::Udp, 10500);
        assert!(matches!(
            store.upsert(&second),
            Err(StoreError::ExternalPortConflict(10500))
        ));
        assert_eq!(store.get_by_id(second.id).unwrap(), None);
    }

    #[test]
    fn external_ports_stay_unique_across_snapshots() {
        let (_dir, store) = open_store();
        for i in 0..20u16 {
            let l = lease([10, 0, (i >> 8) as u8, i as u8], 5000, Protocol::Udp, 10000 + i);
            store.upsert(&l).unwrap();

            let all = store.get_all().unwrap();
            let mut ports: Vec<u16> = all.iter().map(|l| l.external_port).collect();
            ports.sort_unstable();
            ports.dedup();
            assert_eq!(ports.len(), all.len());
        }
    }

    #[test]
    fn duplicate_triple_surfaces_multiple_matches() {
        let (_dir, store) = open_store();
        let genuine = lease([10, 0, 0, 1], 5000, Protocol::Udp, 10500);
        store.upsert(&genuine).unwrap();

        // A peer with a divergent id derivation pushes the same triple under
        // a different id.
        let mut rogue = genuine.clone();
        rogue.id = LeaseId::from_u128(genuine.id.as_u128() ^ 1);
        rogue.external_port = 10501;
        store.upsert(&rogue).unwrap();

        assert!(matches!(
            store.get_by_client(genuine.client_ip, genuine.client_port, genuine.protocol),
            Err(StoreError::MultipleMatches { .. })
        ));
    }

    #[test]
    fn get_active_filters_expired_leases() {
        let (_dir, store) = open_store();
        let fresh = lease([10, 0, 0, 1], 5000, Protocol::Udp, 10500);
        store.upsert(&fresh).unwrap();

        let mut expired = lease([10, 0, 0, 2], 5001, Protocol::Udp, 10501);
        expired.created = expired.created - Duration::minutes(10);
        expired.last_seen = expired.last_seen - Duration::minutes(10);
        store.upsert(&expired).unwrap();

        let active = store.get_active().unwrap();
        assert_eq!(active, vec![fresh]);
        // Expired leases stay in storage.
        assert_eq!(store.get_all().unwrap().len(), 2);
    }

    #[test]
    fn store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let l = lease([192, 168, 1, 10], 4242, Protocol::Udp, 10001);
        {
            let store = LeaseStore::open(dir.path()).unwrap();
            store.upsert(&l).unwrap();
            store.close();
        }
        let store = LeaseStore::open(dir.path()).unwrap();
        assert_eq!(store.get_by_id(l.id).unwrap(), Some(l));
    }
}
