//! Heartbeat refreshing and liveness checks.

use std::sync::Arc;

use crate::store::{Command, LockHeader, MetaStore};
use crate::utils::{ErrorKind, PitrError, ResultExt, Timestamp};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, MissedTickBehavior};

/// What a heartbeat task keeps fresh.
#[derive(Debug, Clone)]
enum Beat {
    Restore(String),
    Lock(LockHeader),
}

/// Spawns a task refreshing the global heartbeat of restore `name` every
/// `interval`, until `rx_term` turns true or the returned handle gets
/// aborted.
pub fn spawn_restore_hb(
    store: Arc<dyn MetaStore>,
    name: &str,
    interval: Duration,
    rx_term: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(heartbeat_thread(
        store,
        Beat::Restore(name.into()),
        interval,
        rx_term,
    ))
}

/// Spawns a task refreshing the heartbeat of the given lock.
pub fn spawn_lock_hb(
    store: Arc<dyn MetaStore>,
    header: LockHeader,
    interval: Duration,
    rx_term: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(heartbeat_thread(
        store,
        Beat::Lock(header),
        interval,
        rx_term,
    ))
}

async fn heartbeat_thread(
    store: Arc<dyn MetaStore>,
    beat: Beat,
    interval: Duration,
    mut rx_term: watch::Receiver<bool>,
) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = beat_once(store.as_ref(), &beat).await {
                    pf_warn!("send heartbeat for {:?}: {}", beat, e);
                }
            },

            res = rx_term.changed() => {
                if res.is_err() || *rx_term.borrow() {
                    pf_debug!("heartbeat for {:?} stopped", beat);
                    break;
                }
            },
        }
    }
}

async fn beat_once(
    store: &dyn MetaStore,
    beat: &Beat,
) -> Result<(), PitrError> {
    let ts = store.cluster_time().await.wrap_err("read cluster time")?;
    match beat {
        Beat::Restore(name) => store.set_restore_hb(name, ts).await,
        Beat::Lock(header) => store.set_lock_hb(header, ts).await,
    }
}

/// Checks the restore lock of shard `rs`, held for operation `opid`, was
/// refreshed within `stale_frame_sec` of cluster time `now`.
pub(crate) async fn check_shard_alive(
    store: &dyn MetaStore,
    opid: &str,
    rs: &str,
    now: Timestamp,
    stale_frame_sec: u32,
) -> Result<(), PitrError> {
    let header = LockHeader {
        cmd: Command::Restore,
        opid: opid.into(),
        replset: rs.into(),
    };
    match store.get_lock_data(&header).await {
        Ok(lock) if lock.heartbeat.is_stale(now, stale_frame_sec) => {
            Err(PitrError::new(
                ErrorKind::Liveness,
                format!("lost shard {}, last beat ts: {}", rs, lock.heartbeat),
            ))
        }
        Ok(_) => Ok(()),
        Err(e) if e.is_not_found() => Err(PitrError::new(
            ErrorKind::Liveness,
            format!("no lock for shard {}", rs),
        )),
        Err(e) => Err(e.wrap(format!("unable to read lock for shard {}", rs))),
    }
}
