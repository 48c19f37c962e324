//! Election of the node taking a replica set's backup.
//!
//! The backup leader opens a nomination per replica set and offers it to
//! one priority group at a time. A candidate agent acknowledges; the first
//! acknowledgement recorded wins. Without one in time the next group gets
//! the offer.

use std::sync::Arc;

use crate::backup::NodesPriority;
use crate::store::MetaStore;
use crate::utils::{ErrorKind, LogEvent, PitrError, ResultExt};

use tokio::sync::watch;
use tokio::time::{self, Duration, Instant, MissedTickBehavior};

/// Leader side of the nomination.
pub struct Nominator {
    store: Arc<dyn MetaStore>,
    poll_interval: Duration,

    /// How long each priority group gets to acknowledge.
    ack_wait: Duration,

    rx_term: watch::Receiver<bool>,
}

impl Nominator {
    pub fn new(
        store: Arc<dyn MetaStore>,
        poll_interval: Duration,
        ack_wait: Duration,
        rx_term: watch::Receiver<bool>,
    ) -> Self {
        Nominator {
            store,
            poll_interval,
            ack_wait,
            rx_term,
        }
    }

    /// Offers the backup of `rs` to its candidates, best group first.
    /// Returns the node that acknowledged.
    pub async fn nominate(
        &self,
        bcp: &str,
        rs: &str,
        prio: &NodesPriority,
    ) -> Result<String, PitrError> {
        let ev = LogEvent::backup(bcp, rs);
        self.store
            .set_rs_nomination(bcp, rs)
            .await
            .wrap_err("set nomination")?;

        for group in prio.rs(rs) {
            pf_debug!(ev; "nominating {:?}", group);
            self.store
                .set_rs_nominees(bcp, rs, group.clone())
                .await
                .wrap_err("set nominees")?;
            if let Some(node) = self.wait_for_ack(bcp, rs, &group).await? {
                pf_info!(ev; "node {} acknowledged", node);
                return Ok(node);
            }
        }

        Err(PitrError::new(
            ErrorKind::Liveness,
            format!("no node of replset {} accepted backup {}", rs, bcp),
        ))
    }

    async fn wait_for_ack(
        &self,
        bcp: &str,
        rs: &str,
        group: &[String],
    ) -> Result<Option<String>, PitrError> {
        let deadline = Instant::now() + self.ack_wait;
        let mut ticker = time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut rx_term = self.rx_term.clone();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let nm = self
                        .store
                        .get_rs_nominees(bcp, rs)
                        .await
                        .wrap_err("get nomination")?;
                    if !nm.ack.is_empty() && group.contains(&nm.ack) {
                        return Ok(Some(nm.ack));
                    }
                    if Instant::now() >= deadline {
                        return Ok(None);
                    }
                },

                res = rx_term.changed() => {
                    if res.is_err() || *rx_term.borrow() {
                        return Err(PitrError::msg("nomination cancelled"));
                    }
                },
            }
        }
    }
}

/// Candidate side: acknowledges the nomination of `rs` if `node` is among
/// the current nominees and nobody acknowledged yet. Returns true if `node`
/// holds the acknowledgement afterwards.
pub async fn try_accept(
    store: &dyn MetaStore,
    bcp: &str,
    rs: &str,
    node: &str,
) -> Result<bool, PitrError> {
    let nm = store
        .get_rs_nominees(bcp, rs)
        .await
        .wrap_err("get nomination")?;
    if !nm.ack.is_empty() {
        return Ok(nm.ack == node);
    }
    if !nm.nodes.iter().any(|n| n == node) {
        return Ok(false);
    }

    store
        .set_rs_nominee_ack(bcp, rs, node)
        .await
        .wrap_err("set nominee ack")?;
    // concurrent candidates overwrite each other; the last write decides
    let nm = store
        .get_rs_nominees(bcp, rs)
        .await
        .wrap_err("get nomination")?;
    Ok(nm.ack == node)
}

#[cfg(test)]
mod nomination_tests {
    use super::*;
    use crate::store::{BackupMeta, MemStore};

    fn setup() -> Arc<MemStore> {
        let store = Arc::new(MemStore::new());
        store.put_backup_meta(BackupMeta {
            name: "b1".into(),
            ..Default::default()
        });
        store
    }

    fn prio() -> NodesPriority {
        let mut prio = NodesPriority::new();
        prio.add("rs0", "a:27017", 2.0);
        prio.add("rs0", "b:27017", 1.0);
        prio
    }

    #[tokio::test]
    async fn lookup_without_nomination() {
        let store = setup();
        let e = store.get_rs_nominees("b1", "rs0").await.unwrap_err();
        assert!(e.is_not_found());
        let e = try_accept(store.as_ref(), "b1", "rs0", "a:27017")
            .await
            .unwrap_err();
        assert!(e.is_not_found());
    }

    #[tokio::test(start_paused = true)]
    async fn best_group_acknowledges() -> Result<(), PitrError> {
        let store = setup();
        let (_tx, rx_term) = watch::channel(false);
        let nominator = Nominator::new(
            store.clone(),
            Duration::from_millis(500),
            Duration::from_secs(5),
            rx_term,
        );

        let candidate = {
            let store = store.clone();
            tokio::spawn(async move {
                for _ in 0..20 {
                    if let Ok(true) =
                        try_accept(store.as_ref(), "b1", "rs0", "a:27017").await
                    {
                        return true;
                    }
                    time::sleep(Duration::from_millis(100)).await;
                }
                false
            })
        };
        let winner = nominator.nominate("b1", "rs0", &prio()).await?;
        assert_eq!(winner, "a:27017");
        assert!(candidate.await?);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn falls_through_to_next_group() -> Result<(), PitrError> {
        let store = setup();
        let (_tx, rx_term) = watch::channel(false);
        let nominator = Nominator::new(
            store.clone(),
            Duration::from_millis(500),
            Duration::from_secs(2),
            rx_term,
        );

        // only b answers, and it is not in the first group
        let candidate = {
            let store = store.clone();
            tokio::spawn(async move {
                loop {
                    if let Ok(true) =
                        try_accept(store.as_ref(), "b1", "rs0", "b:27017").await
                    {
                        return;
                    }
                    time::sleep(Duration::from_millis(200)).await;
                }
            })
        };
        let winner = nominator.nominate("b1", "rs0", &prio()).await?;
        assert_eq!(winner, "b:27017");
        candidate.await?;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn nobody_accepts() {
        let store = setup();
        let (_tx, rx_term) = watch::channel(false);
        let nominator = Nominator::new(
            store,
            Duration::from_millis(500),
            Duration::from_secs(1),
            rx_term,
        );
        let e = nominator.nominate("b1", "rs0", &prio()).await.unwrap_err();
        assert!(e.is(ErrorKind::Liveness));
    }
}
