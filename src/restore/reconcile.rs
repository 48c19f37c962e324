//! Cross-shard resolution of transactions left open at the end of replay.
//!
//! A distributed transaction is prepared on every participating shard but
//! its commit marker may land after the restore target on some of them.
//! Each shard publishes the commits it did see; a leftover is committed
//! locally only if some shard saw its commit.

use std::collections::HashMap;
use std::sync::Arc;

use crate::oplog::{Txn, TxnId};
use crate::restore::heartbeat::check_shard_alive;
use crate::restore::CoordConfig;
use crate::store::{MetaStore, RestoreTxn, Shard, Status};
use crate::utils::{ErrorKind, LogEvent, PitrError, ResultExt, Timestamp};

use async_trait::async_trait;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

/// Shared record of transaction commits seen by the shards of a restore.
#[async_trait]
pub trait TxnEvidence: Send + Sync {
    /// Publishes this shard's most recent commits.
    async fn publish(&self, txns: Vec<RestoreTxn>) -> Result<(), PitrError>;

    /// Commits seen by any shard, keyed by transaction id, valued by
    /// commit time.
    async fn fetch(&self) -> Result<HashMap<TxnId, Timestamp>, PitrError>;
}

/// `TxnEvidence` kept in the restore record of the metadata store.
pub struct StoreEvidence {
    store: Arc<dyn MetaStore>,
    config: CoordConfig,
    name: String,
    opid: String,

    /// Replica set this agent publishes as.
    rs: String,

    shards: Vec<Shard>,
    rx_term: watch::Receiver<bool>,
}

impl StoreEvidence {
    pub fn new(
        store: Arc<dyn MetaStore>,
        config: CoordConfig,
        name: impl Into<String>,
        opid: impl Into<String>,
        rs: impl Into<String>,
        shards: Vec<Shard>,
        rx_term: watch::Receiver<bool>,
    ) -> Self {
        StoreEvidence {
            store,
            config,
            name: name.into(),
            opid: opid.into(),
            rs: rs.into(),
            shards,
            rx_term,
        }
    }

    /// Shards which have not published yet. Fails if one of them failed or
    /// went silent.
    async fn pending_shards(&self) -> Result<Vec<String>, PitrError> {
        let meta = self
            .store
            .get_restore_meta(&self.name)
            .await
            .wrap_err("get restore metadata")?;
        let cluster_time = self
            .store
            .cluster_time()
            .await
            .wrap_err("read cluster time")?;

        let mut pending = Vec::new();
        for shard in &self.shards {
            match meta.replset(&shard.rs) {
                Some(rs) if rs.status == Status::Error => {
                    return Err(PitrError::new(
                        ErrorKind::ShardFailed,
                        format!("shard {} failed with: {}", rs.name, rs.error),
                    ));
                }
                Some(rs) if rs.txn_set => {}
                Some(rs) => {
                    if rs.name != self.rs {
                        check_shard_alive(
                            self.store.as_ref(),
                            &self.opid,
                            &rs.name,
                            cluster_time,
                            self.config.stale_frame_sec,
                        )
                        .await?;
                    }
                    pending.push(rs.name.clone());
                }
                None => pending.push(shard.rs.clone()),
            }
        }
        Ok(pending)
    }
}

#[async_trait]
impl TxnEvidence for StoreEvidence {
    async fn publish(&self, txns: Vec<RestoreTxn>) -> Result<(), PitrError> {
        self.store
            .set_restore_rs_txn(&self.name, &self.rs, txns)
            .await
    }

    /// Waits for every shard to publish, up to the configured bound, then
    /// reads the union of what got published.
    async fn fetch(&self) -> Result<HashMap<TxnId, Timestamp>, PitrError> {
        let deadline = Instant::now() + self.config.txn_wait();
        let mut ticker = time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut rx_term = self.rx_term.clone();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let pending = self.pending_shards().await?;
                    if pending.is_empty() {
                        break;
                    }
                    if Instant::now() >= deadline {
                        pf_warn!("no committed txns from shards {:?}, going on",
                                 pending);
                        break;
                    }
                },

                res = rx_term.changed() => {
                    if res.is_err() || *rx_term.borrow() {
                        break;
                    }
                },
            }
        }

        self.store
            .restore_committed_txn(&self.name)
            .await
            .wrap_err("get committed txns")
    }
}

/// Publishes in the background. Failures are logged, never returned.
pub fn publish_detached(
    evidence: Arc<dyn TxnEvidence>,
    txns: Vec<RestoreTxn>,
    ev: LogEvent,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = evidence.publish(txns).await {
            pf_error!(ev; "write last committed txns: {}", e);
        }
    })
}

/// Leftover transactions sorted by what the evidence says about them.
#[derive(Debug, Default, PartialEq)]
pub struct TxnResolution {
    /// Fully prepared here and committed elsewhere, with the commit time.
    pub resolvable: Vec<(Txn, Timestamp)>,

    /// Committed elsewhere but without all statements here.
    pub incomplete: Vec<Txn>,

    /// No shard saw a commit.
    pub orphaned: Vec<Txn>,
}

impl TxnResolution {
    /// Count of transactions that stay uncommitted.
    pub fn uncommitted_count(&self) -> usize {
        self.incomplete.len() + self.orphaned.len()
    }
}

pub fn classify_leftovers(
    leftovers: Vec<Txn>,
    commits: &HashMap<TxnId, Timestamp>,
) -> TxnResolution {
    let mut res = TxnResolution::default();
    for txn in leftovers {
        match commits.get(&txn.id) {
            Some(&ctime) if txn.prepared => res.resolvable.push((txn, ctime)),
            Some(_) => res.incomplete.push(txn),
            None => res.orphaned.push(txn),
        }
    }
    res
}

#[cfg(test)]
mod reconcile_tests {
    use super::*;
    use crate::store::{
        Command, LockData, LockHeader, MemStore, RestoreMeta, RestoreReplset,
        TxnState,
    };
    use tokio::time::Duration;

    fn txn(id: &str, prepared: bool) -> Txn {
        Txn {
            id: TxnId::from(id),
            ops: Vec::new(),
            prepared,
            first_ts: Timestamp::new(10, 0),
            last_ts: Timestamp::new(10, 0),
        }
    }

    fn committed(id: &str, t: u32) -> RestoreTxn {
        RestoreTxn {
            id: TxnId::from(id),
            ctime: Timestamp::new(t, 0),
            state: TxnState::Commit,
        }
    }

    #[test]
    fn classify() {
        let commits = HashMap::from([
            (TxnId::from("t1"), Timestamp::new(50, 0)),
            (TxnId::from("t2"), Timestamp::new(51, 0)),
        ]);
        let res = classify_leftovers(
            vec![txn("t1", true), txn("t2", false), txn("t3", true)],
            &commits,
        );
        assert_eq!(
            res.resolvable,
            vec![(txn("t1", true), Timestamp::new(50, 0))]
        );
        assert_eq!(res.incomplete, vec![txn("t2", false)]);
        assert_eq!(res.orphaned, vec![txn("t3", true)]);
        assert_eq!(res.uncommitted_count(), 2);
    }

    async fn setup() -> Result<(Arc<MemStore>, Vec<Shard>), PitrError> {
        let store = Arc::new(MemStore::new());
        let now = Timestamp::new(100, 0);
        store.set_cluster_time(now);
        store.set_restore_meta(RestoreMeta::new("r1", "op1", now)).await?;
        let mut shards = Vec::new();
        for rs in ["rs0", "rs1"] {
            store
                .add_restore_rs_meta(
                    "r1",
                    RestoreReplset::new(rs, Status::Running),
                )
                .await?;
            store
                .acquire_lock(LockData {
                    header: LockHeader {
                        cmd: Command::Restore,
                        opid: "op1".into(),
                        replset: rs.into(),
                    },
                    node: "n0:27017".into(),
                    heartbeat: Timestamp::new(100, 0),
                })
                .await?;
            shards.push(Shard::new(rs));
        }
        Ok((store, shards))
    }

    fn evidence(
        store: Arc<MemStore>,
        rs: &str,
        shards: &[Shard],
        rx_term: watch::Receiver<bool>,
    ) -> StoreEvidence {
        StoreEvidence::new(
            store,
            CoordConfig::default(),
            "r1",
            "op1",
            rs,
            shards.to_vec(),
            rx_term,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_waits_for_all_shards() -> Result<(), PitrError> {
        let (store, shards) = setup().await?;
        let (_tx, rx_term) = watch::channel(false);
        let rs0 = evidence(store.clone(), "rs0", &shards, rx_term.clone());
        let rs1 = Arc::new(evidence(store.clone(), "rs1", &shards, rx_term));
        rs0.publish(vec![committed("t1", 50)]).await?;

        let late = tokio::spawn(async move {
            time::sleep(Duration::from_secs(3)).await;
            rs1.publish(vec![committed("t2", 60)]).await
        });
        let commits = rs0.fetch().await?;
        late.await??;
        assert_eq!(commits.len(), 2);
        assert_eq!(commits[&TxnId::from("t2")], Timestamp::new(60, 0));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_gives_up_after_wait() -> Result<(), PitrError> {
        let (store, shards) = setup().await?;
        let mut config = CoordConfig::default();
        config.txn_wait_sec = 5;
        let (_tx, rx_term) = watch::channel(false);
        let rs0 = StoreEvidence::new(
            store.clone(),
            config,
            "r1",
            "op1",
            "rs0",
            shards,
            rx_term,
        );
        rs0.publish(vec![committed("t1", 50)]).await?;
        let commits = rs0.fetch().await?;
        assert_eq!(commits.len(), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_fails_on_failed_shard() -> Result<(), PitrError> {
        let (store, shards) = setup().await?;
        store
            .change_restore_rs_state("r1", "rs1", Status::Error, "oom")
            .await?;
        let (_tx, rx_term) = watch::channel(false);
        let rs0 = StoreEvidence::new(
            store.clone(),
            CoordConfig::default(),
            "r1",
            "op1",
            "rs0",
            shards,
            rx_term,
        );
        let e = rs0.fetch().await.unwrap_err();
        assert!(e.is(ErrorKind::ShardFailed));
        Ok(())
    }

    #[tokio::test]
    async fn detached_publish_failure_is_swallowed() -> Result<(), PitrError> {
        let (store, shards) = setup().await?;
        store.set_fail_txn_publish(true);
        let (_tx, rx_term) = watch::channel(false);
        let ev: Arc<dyn TxnEvidence> =
            Arc::new(evidence(store.clone(), "rs0", &shards, rx_term));
        let log_ev = LogEvent::restore("r1", "rs0");
        publish_detached(ev, vec![committed("t1", 50)], log_ev).await?;
        assert!(store.restore_committed_txn("r1").await?.is_empty());
        Ok(())
    }
}
