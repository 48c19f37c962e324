//! Per-shard driver of a point-in-time restore.
//!
//! Phases, each closed by a cluster-wide barrier:
//!   starting -> running -> dumpDone -> done
//! The chunk slice is validated before leaving `starting`, oplog replay and
//! transaction resolution happen in `running`, and the shard lock goes away
//! right before `done`. Any failure is reported as this shard's error
//! status, which fails the barrier for everyone.

use std::collections::HashMap;
use std::sync::Arc;

use crate::compress::Decompressor;
use crate::oplog::{IndexCatalog, IndexSpec, MongoVersion, OplogApplier};
use crate::restore::heartbeat::{spawn_lock_hb, spawn_restore_hb};
use crate::restore::{
    chunks, get_backup_meta, make_reverse_rs_map_func, ApplyOplogOptions,
    Coordinator, OplogReplayer, ReplayOutcome, StoreEvidence,
};
use crate::storage::Storage;
use crate::store::{
    Command, DistTxnStat, LockData, LockHeader, NodeInfo, RestoreMeta,
    RestoreReplset, Shard, Status,
};
use crate::utils::{LogEvent, PitrError, ResultExt, Timestamp};

use tokio::task::JoinHandle;

/// A point-in-time restore request, the same on every shard.
#[derive(Debug, Clone, Default)]
pub struct PitrRequest {
    /// Restore name, also the key of its record.
    pub name: String,
    pub opid: String,

    /// Base backup the oplog gets replayed on top of.
    pub backup: String,

    /// First timestamp to replay; zero means the base backup's last write.
    pub from: Timestamp,

    /// Target time. Replay stops right before it.
    pub to: Timestamp,

    /// Shards taking part.
    pub shards: Vec<Shard>,

    /// Backup-side replica set name -> restore-side name.
    pub rs_map: HashMap<String, String>,

    /// Namespaces to restore; empty means all.
    pub nss: Vec<String>,

    pub unsafe_apply: bool,
}

/// What one shard did.
#[derive(Debug, Default, PartialEq)]
pub struct PitrReport {
    pub outcome: ReplayOutcome,
    pub stat: DistTxnStat,

    /// Index builds collected from the oplog, to run after replay.
    pub indexes: Vec<(String, IndexSpec)>,
}

/// Restore agent of one shard, running next to its node.
pub struct ShardAgent {
    coord: Coordinator,
    storage: Arc<dyn Storage>,
    decompressor: Arc<dyn Decompressor>,
    node_info: NodeInfo,
    version: MongoVersion,
}

impl ShardAgent {
    pub fn new(
        coord: Coordinator,
        storage: Arc<dyn Storage>,
        decompressor: Arc<dyn Decompressor>,
        node_info: NodeInfo,
        version: MongoVersion,
    ) -> Self {
        ShardAgent {
            coord,
            storage,
            decompressor,
            node_info,
            version,
        }
    }

    #[inline]
    pub fn node_info(&self) -> &NodeInfo {
        &self.node_info
    }

    /// Runs the restore on this shard. The leader also creates the restore
    /// record and keeps its heartbeat.
    pub async fn restore_pitr(
        &self,
        req: &PitrRequest,
        node: &mut dyn OplogApplier,
    ) -> Result<PitrReport, PitrError> {
        let ev = LogEvent::restore(&req.name, &self.node_info.set_name);
        let store = self.coord.store().clone();

        let restore_hb = if self.node_info.is_leader() {
            let hb = store.cluster_time().await.wrap_err("read cluster time")?;
            let mut meta = RestoreMeta::new(&req.name, &req.opid, hb);
            meta.backup = req.backup.clone();
            meta.pitr = req.to;
            store
                .set_restore_meta(meta)
                .await
                .wrap_err("write restore meta to db")?;
            pf_info!(ev; "restore record created");
            Some(spawn_restore_hb(
                store.clone(),
                &req.name,
                self.coord.config().hb_interval(),
                self.coord.rx_term(),
            ))
        } else {
            None
        };

        let res = self.run(req, node, &ev).await;
        if let Some(hb) = restore_hb {
            hb.abort();
        }
        match &res {
            Ok(report) => pf_info!(ev; "restore finished, {} ops applied",
                                       report.outcome.applied),
            Err(e) => pf_error!(ev; "restore failed: {}", e),
        }
        res
    }

    async fn run(
        &self,
        req: &PitrRequest,
        node: &mut dyn OplogApplier,
        ev: &LogEvent,
    ) -> Result<PitrReport, PitrError> {
        self.coord
            .wait_for_status(&req.name, Status::Starting)
            .await
            .wrap_err("waiting for restore record")?;
        self.check_cancelled()?;

        let store = self.coord.store().clone();
        let rs = self.node_info.set_name.clone();
        let lock = LockHeader {
            cmd: Command::Restore,
            opid: req.opid.clone(),
            replset: rs.clone(),
        };

        let mut lock_hb = None;
        let res = self.phases(req, node, ev, &lock, &mut lock_hb).await;
        // the heartbeat runs exactly while this agent holds the lock
        let held = lock_hb.is_some();
        if let Some(hb) = lock_hb.take() {
            hb.abort();
        }

        if let Err(e) = &res {
            // the record entry may not be there if we failed early
            if let Err(err) = store
                .add_restore_rs_meta(
                    &req.name,
                    RestoreReplset::new(&rs, Status::Error),
                )
                .await
            {
                pf_error!(ev; "add shard's metadata: {}", err);
            }
            if let Err(err) = store
                .change_restore_rs_state(
                    &req.name,
                    &rs,
                    Status::Error,
                    &e.to_string(),
                )
                .await
            {
                pf_error!(ev; "set shard's error status: {}", err);
            }
            // after the error status, so the leader sees a failed shard
            // rather than a lost one
            if held {
                if let Err(err) = store.release_lock(&lock).await {
                    pf_error!(ev; "release lock: {}", err);
                }
            }
        }
        res
    }

    async fn phases(
        &self,
        req: &PitrRequest,
        node: &mut dyn OplogApplier,
        ev: &LogEvent,
        lock: &LockHeader,
        lock_hb: &mut Option<JoinHandle<()>>,
    ) -> Result<PitrReport, PitrError> {
        let store = self.coord.store().clone();
        let config = self.coord.config().clone();
        let rs = &self.node_info.set_name;

        // lock first, so that a shard entry in the record always comes
        // with a lock to check
        let hb = store.cluster_time().await.wrap_err("read cluster time")?;
        store
            .acquire_lock(LockData {
                header: lock.clone(),
                node: self.node_info.me.clone(),
                heartbeat: hb,
            })
            .await
            .wrap_err("acquire lock")?;
        *lock_hb = Some(spawn_lock_hb(
            store.clone(),
            lock.clone(),
            config.hb_interval(),
            self.coord.rx_term(),
        ));
        store
            .add_restore_rs_meta(
                &req.name,
                RestoreReplset::new(rs, Status::Starting),
            )
            .await
            .wrap_err("add shard's metadata")?;

        let from = if req.from.is_zero() {
            let bcp = get_backup_meta(
                store.as_ref(),
                self.storage.as_ref(),
                &req.backup,
            )
            .await
            .wrap_err_with(|| format!("get backup {} metadata", req.backup))?;
            bcp.last_write_ts
        } else {
            req.from
        };
        pf_info!(ev; "replaying oplog {} - {}", from, req.to);

        let map_rev_rs = make_reverse_rs_map_func(&req.rs_map);
        let chunks = chunks(
            store.as_ref(),
            self.storage.as_ref(),
            from,
            req.to,
            rs,
            &*map_rev_rs,
        )
        .await
        .wrap_err("verify oplog slice")?;

        self.to_state(req, Status::Running).await?;
        self.check_cancelled()?;

        let evidence = Arc::new(StoreEvidence::new(
            store.clone(),
            config.clone(),
            &req.name,
            &req.opid,
            rs,
            req.shards.clone(),
            self.coord.rx_term(),
        ));
        let replayer = OplogReplayer::new(
            self.storage.clone(),
            self.decompressor.clone(),
            evidence,
            self.version,
            config.txn_window,
            ev.clone(),
        );
        let options = ApplyOplogOptions {
            start: Some(from),
            end: Some(req.to),
            nss: req.nss.clone(),
            unsafe_apply: req.unsafe_apply,
            filter: None,
        };
        let mut catalog = IndexCatalog::new();
        let mut stat = DistTxnStat::default();
        // cross-shard transactions need more than one shard
        let sharded = req.shards.len() > 1;
        let outcome = replayer
            .apply_oplog(
                node,
                &chunks,
                &options,
                sharded,
                &mut catalog,
                &mut stat,
            )
            .await
            .wrap_err("oplog apply")?;

        store
            .set_restore_rs_stat(&req.name, rs, stat)
            .await
            .wrap_err("write txn stat")?;

        self.to_state(req, Status::DumpDone).await?;
        self.check_cancelled()?;

        if let Some(hb) = lock_hb.take() {
            hb.abort();
        }
        store.release_lock(lock).await.wrap_err("release lock")?;

        self.to_state(req, Status::Done).await?;

        Ok(PitrReport {
            outcome,
            stat,
            indexes: catalog.queued(),
        })
    }

    /// Moves this shard to `status`, waiting for the cluster to follow.
    async fn to_state(
        &self,
        req: &PitrRequest,
        status: Status,
    ) -> Result<(), PitrError> {
        self.coord
            .to_state(
                &req.name,
                &req.opid,
                status,
                &self.node_info,
                &req.shards,
                None,
            )
            .await
    }

    fn check_cancelled(&self) -> Result<(), PitrError> {
        if self.coord.cancelled() {
            return logged_err!("restore cancelled");
        }
        Ok(())
    }
}
