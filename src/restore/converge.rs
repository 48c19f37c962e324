//! Cluster-wide restore status convergence.
//!
//! Every shard agent reports its own replica set status in the restore
//! record. The leader polls those until all shards reach the target, then
//! commits the target as the global status exactly once. Everyone, the
//! leader included, then waits for the global status to move.

use std::sync::Arc;

use crate::restore::heartbeat::check_shard_alive;
use crate::restore::CoordConfig;
use crate::store::{MetaStore, NodeInfo, Shard, Status};
use crate::utils::{ErrorKind, PitrError, ResultExt};

use tokio::sync::watch;
use tokio::time::{self, Duration, MissedTickBehavior};

/// Drives the status state machine of restores through the metadata store.
pub struct Coordinator {
    store: Arc<dyn MetaStore>,
    config: CoordConfig,

    /// Cancellation signal; true or a dropped sender stops all loops.
    rx_term: watch::Receiver<bool>,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn MetaStore>,
        config: CoordConfig,
        rx_term: watch::Receiver<bool>,
    ) -> Self {
        Coordinator {
            store,
            config,
            rx_term,
        }
    }

    #[inline]
    pub fn config(&self) -> &CoordConfig {
        &self.config
    }

    #[inline]
    pub fn store(&self) -> &Arc<dyn MetaStore> {
        &self.store
    }

    #[inline]
    pub fn rx_term(&self) -> watch::Receiver<bool> {
        self.rx_term.clone()
    }

    /// True once cancellation was requested or its sender went away.
    pub fn cancelled(&self) -> bool {
        *self.rx_term.borrow() || self.rx_term.has_changed().is_err()
    }

    /// Moves this node's replica set to `status` and returns once the whole
    /// cluster is there. A leader first drives convergence, bounded by
    /// `wait` (or the configured default) if given.
    pub async fn to_state(
        &self,
        name: &str,
        opid: &str,
        status: Status,
        node: &NodeInfo,
        shards: &[Shard],
        wait: Option<Duration>,
    ) -> Result<(), PitrError> {
        pf_info!("moving to state {}", status);
        self.store
            .change_restore_rs_state(name, &node.set_name, status, "")
            .await
            .wrap_err("set shard's status")?;

        if node.is_leader() {
            pf_info!("waiting for shards {}", status);
            let res = match wait.or_else(|| self.config.converge_timeout()) {
                Some(t) => {
                    self.converge_cluster_with_timeout(
                        name, opid, shards, status, t,
                    )
                    .await
                }
                None => self.converge_cluster(name, opid, shards, status).await,
            };
            if let Err(e) = res {
                return Err(if e.is(ErrorKind::Timeout) {
                    e.wrap("couldn't get response from all shards")
                } else {
                    e.wrap(format!("check cluster for restore `{}`", status))
                });
            }
        }

        pf_info!("waiting for cluster {}", status);
        self.wait_for_status(name, status)
            .await
            .wrap_err_with(|| format!("waiting for {}", status))
    }

    /// Polls until the cluster converges to `status`. Returns `Ok` as well
    /// if cancelled.
    pub async fn converge_cluster(
        &self,
        name: &str,
        opid: &str,
        shards: &[Shard],
        status: Status,
    ) -> Result<(), PitrError> {
        self.converge_loop(name, opid, shards, status, None).await
    }

    /// Same as `converge_cluster`, failing with a `Timeout` error once `t`
    /// has elapsed.
    pub async fn converge_cluster_with_timeout(
        &self,
        name: &str,
        opid: &str,
        shards: &[Shard],
        status: Status,
        t: Duration,
    ) -> Result<(), PitrError> {
        self.converge_loop(name, opid, shards, status, Some(t)).await
    }

    async fn converge_loop(
        &self,
        name: &str,
        opid: &str,
        shards: &[Shard],
        status: Status,
        timeout: Option<Duration>,
    ) -> Result<(), PitrError> {
        let mut ticker = time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let deadline = time::sleep(timeout.unwrap_or(Duration::ZERO));
        tokio::pin!(deadline);
        let mut rx_term = self.rx_term.clone();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.cancelled() {
                        pf_info!("restore {} converge on {} cancelled",
                                 name, status);
                        return Ok(());
                    }
                    if self.converged(name, opid, shards, status).await? {
                        return Ok(());
                    }
                },

                _ = &mut deadline, if timeout.is_some() => {
                    return Err(PitrError::new(
                        ErrorKind::Timeout,
                        "reached converge timeout",
                    ));
                },

                _ = rx_term.changed() => {
                    if self.cancelled() {
                        pf_info!("restore {} converge on {} cancelled",
                                 name, status);
                        return Ok(());
                    }
                },
            }
        }
    }

    /// One convergence check. Returns true once every shard reached
    /// `status`, in which case the global status got committed; calling
    /// again after that is a pure read.
    pub async fn converged(
        &self,
        name: &str,
        opid: &str,
        shards: &[Shard],
        status: Status,
    ) -> Result<bool, PitrError> {
        let meta = self
            .store
            .get_restore_meta(name)
            .await
            .wrap_err("get restore metadata")?;
        if meta.status == status {
            return Ok(true);
        }
        if meta.status == Status::Error {
            return Err(PitrError::new(
                ErrorKind::ShardFailed,
                format!("restore failed: {}", meta.error),
            ));
        }

        // a failed shard is reported before any liveness issue
        for shard in shards {
            let rs = match meta.replset(&shard.rs) {
                Some(rs) if rs.status == Status::Error => rs,
                _ => continue,
            };
            let msg = format!(
                "restore on the shard {} failed with: {}",
                rs.name, rs.error
            );
            if let Err(e) = self
                .store
                .change_restore_state(name, Status::Error, &msg)
                .await
            {
                pf_error!("update restore meta with error: {}", e);
            }
            return Err(PitrError::new(ErrorKind::ShardFailed, msg));
        }

        let cluster_time = self
            .store
            .cluster_time()
            .await
            .wrap_err("read cluster time")?;

        let mut to_finish = shards.len();
        for shard in shards {
            let rs = match meta.replset(&shard.rs) {
                Some(rs) => rs,
                None => continue,
            };
            // locks are released on the way to done
            if status != Status::Done {
                check_shard_alive(
                    self.store.as_ref(),
                    opid,
                    &rs.name,
                    cluster_time,
                    self.config.stale_frame_sec,
                )
                .await?;
            }
            if rs.status == status {
                to_finish -= 1;
            }
        }

        if to_finish == 0 {
            self.store
                .change_restore_state(name, status, "")
                .await
                .wrap_err_with(|| {
                    format!("update restore meta with status {}", status)
                })?;
            pf_info!("restore {} converged on {}", name, status);
            return Ok(true);
        }
        Ok(false)
    }

    /// Polls the global status until it equals `status`. A record not
    /// created yet is waited for; a stale global heartbeat or the error
    /// status fails the wait. Returns `Ok` as well if cancelled.
    pub async fn wait_for_status(
        &self,
        name: &str,
        status: Status,
    ) -> Result<(), PitrError> {
        let mut ticker = time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut rx_term = self.rx_term.clone();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.cancelled() {
                        return Ok(());
                    }
                    let meta = match self.store.get_restore_meta(name).await {
                        Ok(meta) => meta,
                        Err(e) if e.is_not_found() => continue,
                        Err(e) => return Err(e.wrap("get restore metadata")),
                    };

                    if meta.status == status {
                        return Ok(());
                    }
                    if meta.status == Status::Error {
                        return Err(PitrError::new(
                            ErrorKind::ShardFailed,
                            format!("cluster failed: {}", meta.error),
                        ));
                    }

                    let cluster_time = self
                        .store
                        .cluster_time()
                        .await
                        .wrap_err("read cluster time")?;
                    let frame = self.config.stale_frame_sec;
                    if meta.hb.is_stale(cluster_time, frame) {
                        return Err(PitrError::new(
                            ErrorKind::Liveness,
                            format!("restore stuck, last beat ts: {}", meta.hb),
                        ));
                    }
                },

                _ = rx_term.changed() => {
                    if self.cancelled() {
                        return Ok(());
                    }
                },
            }
        }
    }
}
