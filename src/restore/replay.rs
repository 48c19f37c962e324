//! Oplog replay of a validated chunk sequence onto a node.

use std::sync::Arc;

use crate::compress::{CompressionType, Decompressor};
use crate::oplog::{
    IndexCatalog, MongoVersion, OpFilter, OplogApplier, OplogRestore, Txn,
};
use crate::restore::reconcile::{classify_leftovers, publish_detached};
use crate::restore::TxnEvidence;
use crate::storage::Storage;
use crate::store::{DistTxnStat, OplogChunk};
use crate::utils::{ErrorKind, LogEvent, PitrError, ResultExt, Timestamp};

/// What and how to replay.
#[derive(Clone, Default)]
pub struct ApplyOplogOptions {
    /// Inclusive lower bound; `None` is unbounded.
    pub start: Option<Timestamp>,

    /// Exclusive upper bound; `None` is unbounded.
    pub end: Option<Timestamp>,

    /// Namespaces to replay, `db.coll` or `db.*`; empty means all.
    pub nss: Vec<String>,

    /// Tolerate out of order entries instead of failing.
    pub unsafe_apply: bool,

    /// Final say on each operation surviving the other filters.
    pub filter: Option<OpFilter>,
}

/// Result of a replay.
#[derive(Debug, Default, PartialEq)]
pub struct ReplayOutcome {
    /// Last timestamp reached.
    pub last_ts: Timestamp,

    /// Operations handed to the node.
    pub applied: u64,

    /// Leftover transactions committed because another shard saw their
    /// commit.
    pub partial: Vec<Txn>,

    /// Leftover transactions that stayed uncommitted.
    pub uncommitted: Vec<Txn>,
}

/// Replays oplog chunks through storage and decompression onto a node.
pub struct OplogReplayer {
    storage: Arc<dyn Storage>,
    decompressor: Arc<dyn Decompressor>,
    evidence: Arc<dyn TxnEvidence>,
    version: MongoVersion,
    txn_window: usize,
    ev: LogEvent,
}

impl OplogReplayer {
    pub fn new(
        storage: Arc<dyn Storage>,
        decompressor: Arc<dyn Decompressor>,
        evidence: Arc<dyn TxnEvidence>,
        version: MongoVersion,
        txn_window: usize,
        ev: LogEvent,
    ) -> Self {
        OplogReplayer {
            storage,
            decompressor,
            evidence,
            version,
            txn_window,
            ev,
        }
    }

    /// Replays `chunks` in order. On a sharded cluster with distributed
    /// transactions, the transactions left open get resolved against the
    /// commits other shards saw, and `stat` is filled in.
    pub async fn apply_oplog(
        &self,
        node: &mut dyn OplogApplier,
        chunks: &[OplogChunk],
        options: &ApplyOplogOptions,
        sharded: bool,
        catalog: &mut IndexCatalog,
        stat: &mut DistTxnStat,
    ) -> Result<ReplayOutcome, PitrError> {
        pf_info!(self.ev; "starting oplog replay");

        let mut oplog = OplogRestore::new(
            node,
            catalog,
            options.unsafe_apply,
            self.txn_window,
        )
        .wrap_err("create oplog")?;
        oplog.set_log_ctx(&self.ev);
        oplog.set_timeframe(
            options.start.unwrap_or_default(),
            options.end.unwrap_or_default(),
        );
        oplog.set_include_ns(options.nss.clone());
        oplog.set_op_filter(options.filter.clone());

        let mut outcome = ReplayOutcome::default();
        for chunk in chunks {
            pf_debug!(self.ev; "+ applying {}", chunk);
            let mark = oplog.mark();
            let mut res =
                self.replay_chunk(chunk, &mut oplog, chunk.compression);

            let corrupt = matches!(&res, Err(e)
                if e.is(ErrorKind::CorruptInput(chunk.compression)));
            if let (true, Some(alt)) =
                (corrupt, chunk.compression.mislabel_fallback())
            {
                pf_warn!(self.ev; "chunk {} is not valid {}, retrying as {}",
                                  chunk.fname, chunk.compression, alt);
                oplog.rewind(mark);
                res = self.replay_chunk(chunk, &mut oplog, alt);
            }

            outcome.last_ts = res.wrap_err_with(|| {
                format!("replay chunk {}.{}", chunk.start_ts.t, chunk.end_ts.t)
            })?;
        }

        if sharded && self.version.supports_dist_txn() {
            let (leftovers, committed) = oplog.take_leftovers();
            stat.shard_uncommitted = leftovers.len();
            publish_detached(self.evidence.clone(), committed, self.ev.clone());

            if !leftovers.is_empty() {
                pf_info!(self.ev; "{} txns left open, checking other shards",
                                  leftovers.len());
                let commits = self
                    .evidence
                    .fetch()
                    .await
                    .wrap_err("get committed txns on other shards")?;
                let res = classify_leftovers(leftovers, &commits);

                for (txn, ctime) in &res.resolvable {
                    oplog
                        .commit_leftover(txn, *ctime)
                        .wrap_err("handle uncommitted transactions")?;
                }
                for txn in &res.incomplete {
                    pf_warn!(self.ev; "txn {} committed elsewhere, incomplete",
                                      txn.id);
                }
                for txn in &res.orphaned {
                    pf_info!(self.ev; "txn {} has no commit on any shard",
                                      txn.id);
                }

                stat.partial = res.resolvable.len();
                stat.left_uncommitted = res.uncommitted_count();
                outcome.partial =
                    res.resolvable.into_iter().map(|(txn, _)| txn).collect();
                outcome.uncommitted =
                    res.incomplete.into_iter().chain(res.orphaned).collect();
            }
        } else if sharded {
            pf_debug!(self.ev; "server {} has no distributed txns, skipping",
                               self.version);
        }

        outcome.applied = oplog.applied_count();
        pf_info!(self.ev; "oplog replay finished on {}", outcome.last_ts);
        Ok(outcome)
    }

    fn replay_chunk(
        &self,
        chunk: &OplogChunk,
        oplog: &mut OplogRestore<'_>,
        codec: CompressionType,
    ) -> Result<Timestamp, PitrError> {
        let src = self
            .storage
            .source_reader(&chunk.fname)
            .wrap_err_with(|| {
                format!("get object {} from the storage", chunk.fname)
            })?;
        let stream = self
            .decompressor
            .decompress(src, codec)
            .wrap_err_with(|| format!("decompress object {}", chunk.fname))?;
        oplog.apply(stream).wrap_err("apply oplog for chunk")
    }
}
