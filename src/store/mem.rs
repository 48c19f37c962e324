//! In-memory `MetaStore` used by tests and single-process setups.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::oplog::TxnId;
use crate::store::{
    BackupMeta, BackupRsNomination, Condition, Config, DistTxnStat, LockData,
    LockHeader, MetaStore, OplogChunk, RestoreMeta, RestoreReplset,
    RestoreTxn, Status, TxnState,
};
use crate::utils::{PitrError, Timestamp};

use async_trait::async_trait;

#[derive(Debug, Default)]
struct State {
    /// Cluster time; only moves when told to.
    clock: Timestamp,
    config: Config,
    restores: HashMap<String, RestoreMeta>,
    locks: HashMap<LockHeader, LockData>,
    chunks: Vec<OplogChunk>,
    backups: HashMap<String, BackupMeta>,

    /// Number of global restore status writes.
    global_writes: usize,

    /// Makes committed-txn publishing fail.
    fail_txn_publish: bool,
}

/// Store keeping every record in one mutex-protected state. Each trait
/// method takes the mutex exactly once, so every call is atomic to other
/// callers. Clones share the same state.
#[derive(Debug, Default, Clone)]
pub struct MemStore {
    state: Arc<Mutex<State>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_cluster_time(&self, ts: Timestamp) {
        self.lock().clock = ts;
    }

    /// Moves cluster time forward by `secs` seconds.
    pub fn advance_clock(&self, secs: u32) {
        let mut state = self.lock();
        state.clock = Timestamp::new(state.clock.t + secs, 0);
    }

    pub fn set_config(&self, config: Config) {
        self.lock().config = config;
    }

    pub fn put_chunk(&self, chunk: OplogChunk) {
        self.lock().chunks.push(chunk);
    }

    pub fn put_backup_meta(&self, meta: BackupMeta) {
        self.lock().backups.insert(meta.name.clone(), meta);
    }

    /// How many times the global restore status got written.
    pub fn global_status_writes(&self) -> usize {
        self.lock().global_writes
    }

    pub fn set_fail_txn_publish(&self, fail: bool) {
        self.lock().fail_txn_publish = fail;
    }
}

fn restore_not_found(name: &str) -> PitrError {
    PitrError::not_found(format!("restore '{}' not found", name))
}

fn rs_not_found(name: &str, rs: &str) -> PitrError {
    PitrError::not_found(format!(
        "replset {} not found in restore '{}'",
        rs, name
    ))
}

fn nomination_mut<'s>(
    state: &'s mut State,
    bcp: &str,
    rs: &str,
) -> Result<&'s mut BackupRsNomination, PitrError> {
    state
        .backups
        .get_mut(bcp)
        .ok_or_else(|| {
            PitrError::not_found(format!("backup '{}' not found", bcp))
        })?
        .nomination
        .iter_mut()
        .find(|n| n.rs == rs)
        .ok_or_else(|| {
            PitrError::not_found(format!(
                "no nomination for replset {} in backup {}",
                rs, bcp
            ))
        })
}

#[async_trait]
impl MetaStore for MemStore {
    async fn cluster_time(&self) -> Result<Timestamp, PitrError> {
        Ok(self.lock().clock)
    }

    async fn get_config(&self) -> Result<Config, PitrError> {
        Ok(self.lock().config.clone())
    }

    async fn set_restore_meta(
        &self,
        meta: RestoreMeta,
    ) -> Result<(), PitrError> {
        let mut state = self.lock();
        if state.restores.contains_key(&meta.name) {
            return Err(PitrError::msg(format!(
                "restore '{}' already exists",
                meta.name
            )));
        }
        state.restores.insert(meta.name.clone(), meta);
        Ok(())
    }

    async fn get_restore_meta(
        &self,
        name: &str,
    ) -> Result<RestoreMeta, PitrError> {
        self.lock()
            .restores
            .get(name)
            .cloned()
            .ok_or_else(|| restore_not_found(name))
    }

    async fn add_restore_rs_meta(
        &self,
        name: &str,
        rs: RestoreReplset,
    ) -> Result<(), PitrError> {
        let mut state = self.lock();
        let meta = state
            .restores
            .get_mut(name)
            .ok_or_else(|| restore_not_found(name))?;
        if meta.replset(&rs.name).is_none() {
            meta.replsets.push(rs);
        }
        Ok(())
    }

    async fn change_restore_state(
        &self,
        name: &str,
        status: Status,
        msg: &str,
    ) -> Result<(), PitrError> {
        let mut state = self.lock();
        let now = state.clock;
        let meta = state
            .restores
            .get_mut(name)
            .ok_or_else(|| restore_not_found(name))?;
        meta.status = status;
        meta.error = msg.into();
        meta.conditions.push(Condition {
            timestamp: now,
            status,
            error: msg.into(),
        });
        state.global_writes += 1;
        Ok(())
    }

    async fn change_restore_rs_state(
        &self,
        name: &str,
        rs: &str,
        status: Status,
        msg: &str,
    ) -> Result<(), PitrError> {
        let mut state = self.lock();
        let now = state.clock;
        let rs_meta = state
            .restores
            .get_mut(name)
            .ok_or_else(|| restore_not_found(name))?
            .replsets
            .iter_mut()
            .find(|r| r.name == rs)
            .ok_or_else(|| rs_not_found(name, rs))?;
        rs_meta.status = status;
        rs_meta.error = msg.into();
        rs_meta.conditions.push(Condition {
            timestamp: now,
            status,
            error: msg.into(),
        });
        Ok(())
    }

    async fn set_restore_hb(
        &self,
        name: &str,
        hb: Timestamp,
    ) -> Result<(), PitrError> {
        let mut state = self.lock();
        let meta = state
            .restores
            .get_mut(name)
            .ok_or_else(|| restore_not_found(name))?;
        meta.hb = hb;
        Ok(())
    }

    async fn set_restore_rs_txn(
        &self,
        name: &str,
        rs: &str,
        txn: Vec<RestoreTxn>,
    ) -> Result<(), PitrError> {
        let mut state = self.lock();
        if state.fail_txn_publish {
            return Err(PitrError::msg("txn publish failing"));
        }
        let rs_meta = state
            .restores
            .get_mut(name)
            .ok_or_else(|| restore_not_found(name))?
            .replsets
            .iter_mut()
            .find(|r| r.name == rs)
            .ok_or_else(|| rs_not_found(name, rs))?;
        rs_meta.committed_txn = txn;
        rs_meta.txn_set = true;
        Ok(())
    }

    async fn restore_committed_txn(
        &self,
        name: &str,
    ) -> Result<HashMap<TxnId, Timestamp>, PitrError> {
        let state = self.lock();
        let meta = state
            .restores
            .get(name)
            .ok_or_else(|| restore_not_found(name))?;
        Ok(meta
            .replsets
            .iter()
            .flat_map(|r| r.committed_txn.iter())
            .filter(|t| t.state == TxnState::Commit)
            .map(|t| (t.id.clone(), t.ctime))
            .collect())
    }

    async fn set_restore_rs_stat(
        &self,
        name: &str,
        rs: &str,
        stat: DistTxnStat,
    ) -> Result<(), PitrError> {
        let mut state = self.lock();
        let rs_meta = state
            .restores
            .get_mut(name)
            .ok_or_else(|| restore_not_found(name))?
            .replsets
            .iter_mut()
            .find(|r| r.name == rs)
            .ok_or_else(|| rs_not_found(name, rs))?;
        rs_meta.stat = Some(stat);
        Ok(())
    }

    async fn acquire_lock(&self, lock: LockData) -> Result<(), PitrError> {
        let mut state = self.lock();
        if let Some(held) = state.locks.get(&lock.header) {
            return Err(PitrError::msg(format!(
                "lock {} already held by {}",
                lock.header, held.node
            )));
        }
        state.locks.insert(lock.header.clone(), lock);
        Ok(())
    }

    async fn get_lock_data(
        &self,
        header: &LockHeader,
    ) -> Result<LockData, PitrError> {
        self.lock().locks.get(header).cloned().ok_or_else(|| {
            PitrError::not_found(format!("lock {} not found", header))
        })
    }

    async fn set_lock_hb(
        &self,
        header: &LockHeader,
        hb: Timestamp,
    ) -> Result<(), PitrError> {
        match self.lock().locks.get_mut(header) {
            Some(lock) => {
                lock.heartbeat = hb;
                Ok(())
            }
            None => Err(PitrError::not_found(format!(
                "lock {} not found",
                header
            ))),
        }
    }

    async fn release_lock(
        &self,
        header: &LockHeader,
    ) -> Result<(), PitrError> {
        self.lock().locks.remove(header);
        Ok(())
    }

    async fn pitr_chunks_slice(
        &self,
        rs: &str,
        from: Timestamp,
        to: Timestamp,
    ) -> Result<Vec<OplogChunk>, PitrError> {
        let mut chunks: Vec<OplogChunk> = self
            .lock()
            .chunks
            .iter()
            .filter(|c| c.rs == rs && c.start_ts <= to && c.end_ts >= from)
            .cloned()
            .collect();
        chunks.sort_by_key(|c| c.start_ts);
        Ok(chunks)
    }

    async fn get_backup_meta(
        &self,
        name: &str,
    ) -> Result<BackupMeta, PitrError> {
        self.lock().backups.get(name).cloned().ok_or_else(|| {
            PitrError::not_found(format!("backup '{}' not found", name))
        })
    }

    async fn set_rs_nomination(
        &self,
        bcp: &str,
        rs: &str,
    ) -> Result<(), PitrError> {
        let mut state = self.lock();
        let meta = state.backups.get_mut(bcp).ok_or_else(|| {
            PitrError::not_found(format!("backup '{}' not found", bcp))
        })?;
        // set semantics: an identical empty nomination is not added twice,
        // and an existing one for the replset is kept as is
        if !meta.nomination.iter().any(|n| n.rs == rs) {
            meta.nomination.push(BackupRsNomination {
                rs: rs.into(),
                ..Default::default()
            });
        }
        Ok(())
    }

    async fn set_rs_nominees(
        &self,
        bcp: &str,
        rs: &str,
        nodes: Vec<String>,
    ) -> Result<(), PitrError> {
        let mut state = self.lock();
        nomination_mut(&mut state, bcp, rs)?.nodes = nodes;
        Ok(())
    }

    async fn set_rs_nominee_ack(
        &self,
        bcp: &str,
        rs: &str,
        node: &str,
    ) -> Result<(), PitrError> {
        let mut state = self.lock();
        nomination_mut(&mut state, bcp, rs)?.ack = node.into();
        Ok(())
    }
}
