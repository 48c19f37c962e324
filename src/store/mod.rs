//! Shared metadata store: the only channel agents coordinate through.
//!
//! The store is treated as durable and linearizable. Every method here is a
//! single atomic document operation from other readers' point of view.

mod mem;
mod meta;

use std::collections::HashMap;

use crate::oplog::TxnId;
use crate::utils::{PitrError, Timestamp};

use async_trait::async_trait;

pub use mem::MemStore;
pub use meta::{
    BackupConf, BackupMeta, BackupReplset, BackupRsNomination, Command,
    Condition, Config, DistTxnStat, LockData, LockHeader, NodeInfo,
    OplogChunk, RestoreMeta, RestoreReplset, RestoreTxn, Shard, Status,
    TxnState,
};

/// Operations the agents need from the shared metadata store. Lookups of
/// absent records return an error of kind `NotFound`.
#[async_trait]
pub trait MetaStore: Send + Sync {
    /// Current cluster (logical) time.
    async fn cluster_time(&self) -> Result<Timestamp, PitrError>;

    /// Cluster-level configuration.
    async fn get_config(&self) -> Result<Config, PitrError>;

    /// Creates the restore record; fails if one with the same name exists.
    async fn set_restore_meta(&self, meta: RestoreMeta)
        -> Result<(), PitrError>;

    async fn get_restore_meta(&self, name: &str)
        -> Result<RestoreMeta, PitrError>;

    /// Adds a replica set entry to the restore record if not present.
    async fn add_restore_rs_meta(
        &self,
        name: &str,
        rs: RestoreReplset,
    ) -> Result<(), PitrError>;

    /// Sets the global status and error, appending a condition.
    async fn change_restore_state(
        &self,
        name: &str,
        status: Status,
        msg: &str,
    ) -> Result<(), PitrError>;

    /// Sets one replica set's status and error, appending a condition.
    async fn change_restore_rs_state(
        &self,
        name: &str,
        rs: &str,
        status: Status,
        msg: &str,
    ) -> Result<(), PitrError>;

    /// Refreshes the global heartbeat.
    async fn set_restore_hb(
        &self,
        name: &str,
        hb: Timestamp,
    ) -> Result<(), PitrError>;

    /// Publishes a replica set's rolling window of committed transactions.
    async fn set_restore_rs_txn(
        &self,
        name: &str,
        rs: &str,
        txn: Vec<RestoreTxn>,
    ) -> Result<(), PitrError>;

    /// Union of the committed transactions published by all replica sets.
    async fn restore_committed_txn(
        &self,
        name: &str,
    ) -> Result<HashMap<TxnId, Timestamp>, PitrError>;

    /// Records a replica set's distributed transaction counters.
    async fn set_restore_rs_stat(
        &self,
        name: &str,
        rs: &str,
        stat: DistTxnStat,
    ) -> Result<(), PitrError>;

    /// Takes the lock; fails if the same lock is already held.
    async fn acquire_lock(&self, lock: LockData) -> Result<(), PitrError>;

    async fn get_lock_data(
        &self,
        header: &LockHeader,
    ) -> Result<LockData, PitrError>;

    async fn set_lock_hb(
        &self,
        header: &LockHeader,
        hb: Timestamp,
    ) -> Result<(), PitrError>;

    async fn release_lock(&self, header: &LockHeader)
        -> Result<(), PitrError>;

    /// Chunks of `rs` overlapping `[from, to]`, ordered by start timestamp.
    async fn pitr_chunks_slice(
        &self,
        rs: &str,
        from: Timestamp,
        to: Timestamp,
    ) -> Result<Vec<OplogChunk>, PitrError>;

    async fn get_backup_meta(&self, name: &str)
        -> Result<BackupMeta, PitrError>;

    /// Adds an empty nomination for `rs`; a no-op if one exists already.
    async fn set_rs_nomination(
        &self,
        bcp: &str,
        rs: &str,
    ) -> Result<(), PitrError>;

    /// Replaces the candidate list of an existing nomination.
    async fn set_rs_nominees(
        &self,
        bcp: &str,
        rs: &str,
        nodes: Vec<String>,
    ) -> Result<(), PitrError>;

    /// Records the acknowledging node of an existing nomination.
    async fn set_rs_nominee_ack(
        &self,
        bcp: &str,
        rs: &str,
        node: &str,
    ) -> Result<(), PitrError>;

    /// Nomination of `rs` for the given backup.
    async fn get_rs_nominees(
        &self,
        bcp: &str,
        rs: &str,
    ) -> Result<BackupRsNomination, PitrError> {
        let bcp_meta = self.get_backup_meta(bcp).await?;
        bcp_meta
            .nomination
            .into_iter()
            .find(|n| n.rs == rs)
            .ok_or_else(|| {
                PitrError::not_found(format!(
                    "no nomination for replset {} in backup {}",
                    rs, bcp
                ))
            })
    }
}
