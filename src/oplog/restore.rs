//! Applying decoded oplog to a node, with transaction buffering.

use std::cmp;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io::Read;

use crate::oplog::{
    is_internal_ns, EntryReader, IndexCatalog, NsFilter, Op, OpFilter,
    OplogEntry, TxnId, TxnOp,
};
use crate::store::{RestoreTxn, TxnState};
use crate::utils::{ErrorKind, PitrError, Timestamp};

/// Database apply primitive: applies one operation to a live node.
pub trait OplogApplier: Send {
    fn apply_op(
        &mut self,
        ts: Timestamp,
        ns: &str,
        op: &Op,
    ) -> Result<(), PitrError>;
}

/// Applier that records operations in memory instead of touching a node.
/// Useful for dry runs.
#[derive(Debug, Default)]
pub struct MemNode {
    applied: Vec<(Timestamp, String, Op)>,
    fail_ns: Option<String>,
}

impl MemNode {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every operation on `ns` fail.
    pub fn fail_on(&mut self, ns: impl Into<String>) {
        self.fail_ns = Some(ns.into());
    }

    pub fn applied(&self) -> &[(Timestamp, String, Op)] {
        &self.applied
    }

    /// Namespaces of applied operations, in order.
    pub fn applied_ns(&self) -> Vec<&str> {
        self.applied.iter().map(|(_, ns, _)| ns.as_str()).collect()
    }
}

impl OplogApplier for MemNode {
    fn apply_op(
        &mut self,
        ts: Timestamp,
        ns: &str,
        op: &Op,
    ) -> Result<(), PitrError> {
        if self.fail_ns.as_deref() == Some(ns) {
            return Err(PitrError::new(
                ErrorKind::Apply,
                format!("node rejected {} on {}", op.name(), ns),
            ));
        }
        self.applied.push((ts, ns.into(), op.clone()));
        Ok(())
    }
}

/// Server version of the node being restored.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub struct MongoVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl MongoVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        MongoVersion {
            major,
            minor,
            patch,
        }
    }

    /// Parses `"major.minor[.patch][-suffix]"`.
    pub fn parse(s: &str) -> Result<Self, PitrError> {
        let core = s.split('-').next().unwrap_or(s);
        let mut parts = core.split('.');
        let mut next = |what: &str, required: bool| -> Result<u32, PitrError> {
            match parts.next() {
                Some(p) => Ok(p.parse()?),
                None if required => Err(PitrError::msg(format!(
                    "version '{}' has no {} part",
                    s, what
                ))),
                None => Ok(0),
            }
        };
        Ok(MongoVersion {
            major: next("major", true)?,
            minor: next("minor", true)?,
            patch: next("patch", false)?,
        })
    }

    /// Prepared (distributed) transactions exist from 4.2 on.
    pub fn supports_dist_txn(&self) -> bool {
        *self >= MongoVersion::new(4, 2, 0)
    }
}

impl fmt::Display for MongoVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Transaction buffered during replay.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Txn {
    pub id: TxnId,
    pub ops: Vec<TxnOp>,

    /// The prepare message was observed, so all statements are here.
    pub prepared: bool,

    pub first_ts: Timestamp,
    pub last_ts: Timestamp,
}

impl Txn {
    fn new(id: TxnId, ts: Timestamp) -> Self {
        Txn {
            id,
            ops: Vec::new(),
            prepared: false,
            first_ts: ts,
            last_ts: ts,
        }
    }
}

/// Replay position saved by `OplogRestore::mark`.
#[derive(Debug, Clone)]
pub struct ReplayMark {
    last_ts: Timestamp,
    applied: u64,
    txn_buffer: HashMap<TxnId, Txn>,
    committed: VecDeque<RestoreTxn>,
}

/// Replays oplog streams onto a node within the configured timeframe and
/// namespaces. Transactions are buffered until their commit marker; the
/// ones never closed stay behind as leftovers for cross-shard resolution.
pub struct OplogRestore<'n> {
    node: &'n mut dyn OplogApplier,
    catalog: &'n mut IndexCatalog,

    /// Tolerate non-increasing timestamps.
    unsafe_apply: bool,

    start: Timestamp,
    end: Timestamp,
    include: NsFilter,
    filter: Option<OpFilter>,

    /// Last timestamp inside the timeframe seen so far.
    last_ts: Timestamp,

    /// Number of operations handed to the node.
    applied: u64,

    txn_buffer: HashMap<TxnId, Txn>,

    /// Rolling window of the most recent commits.
    committed: VecDeque<RestoreTxn>,
    txn_window: usize,

    /// Logging prefix.
    ctx: String,
}

impl<'n> OplogRestore<'n> {
    pub fn new(
        node: &'n mut dyn OplogApplier,
        catalog: &'n mut IndexCatalog,
        unsafe_apply: bool,
        txn_window: usize,
    ) -> Result<Self, PitrError> {
        if txn_window == 0 {
            return logged_err!("invalid txn_window {}", txn_window);
        }
        Ok(OplogRestore {
            node,
            catalog,
            unsafe_apply,
            start: Timestamp::default(),
            end: Timestamp::default(),
            include: NsFilter::default(),
            filter: None,
            last_ts: Timestamp::default(),
            applied: 0,
            txn_buffer: HashMap::new(),
            committed: VecDeque::with_capacity(txn_window),
            txn_window,
            ctx: String::from("-"),
        })
    }

    pub fn set_log_ctx(&mut self, ctx: impl fmt::Display) {
        self.ctx = ctx.to_string();
    }

    /// Entries in `[start, end)` get applied; a zero bound is open.
    pub fn set_timeframe(&mut self, start: Timestamp, end: Timestamp) {
        self.start = start;
        self.end = end;
    }

    pub fn set_include_ns(&mut self, nss: Vec<String>) {
        self.include = NsFilter::new(nss);
    }

    pub fn set_op_filter(&mut self, filter: Option<OpFilter>) {
        self.filter = filter;
    }

    #[inline]
    pub fn last_ts(&self) -> Timestamp {
        self.last_ts
    }

    #[inline]
    pub fn applied_count(&self) -> u64 {
        self.applied
    }

    /// Captures the replay position, to go back to with `rewind`.
    pub fn mark(&self) -> ReplayMark {
        ReplayMark {
            last_ts: self.last_ts,
            applied: self.applied,
            txn_buffer: self.txn_buffer.clone(),
            committed: self.committed.clone(),
        }
    }

    /// Goes back to a marked position, for replaying a stream again after
    /// it failed midway. Operations already handed to the node stay; oplog
    /// operations are idempotent. They are not counted twice.
    pub fn rewind(&mut self, mark: ReplayMark) {
        self.last_ts = mark.last_ts;
        self.applied = mark.applied;
        self.txn_buffer = mark.txn_buffer;
        self.committed = mark.committed;
    }

    /// Applies every entry of a decompressed chunk stream. Returns the last
    /// timestamp reached.
    pub fn apply(
        &mut self,
        stream: Box<dyn Read + Send>,
    ) -> Result<Timestamp, PitrError> {
        for entry in EntryReader::new(stream) {
            self.handle_entry(entry?)?;
        }
        Ok(self.last_ts)
    }

    fn handle_entry(&mut self, entry: OplogEntry) -> Result<(), PitrError> {
        if !self.start.is_zero() && entry.ts < self.start {
            return Ok(());
        }
        if !self.end.is_zero() && entry.ts >= self.end {
            return Ok(());
        }

        if !self.last_ts.is_zero() && entry.ts <= self.last_ts {
            if !self.unsafe_apply {
                return Err(PitrError::new(
                    ErrorKind::Integrity,
                    format!(
                        "oplog entry {} does not follow {}",
                        entry.ts, self.last_ts
                    ),
                ));
            }
            pf_warn!(self.ctx; "out of order oplog entry {} after {}",
                               entry.ts, self.last_ts);
        }
        self.last_ts = cmp::max(self.last_ts, entry.ts);

        match entry.op {
            Op::ApplyOps {
                txn: None, ops, ..
            } => {
                for op in &ops {
                    self.apply_op(entry.ts, &op.ns, &op.op)?;
                }
            }

            Op::ApplyOps {
                txn: Some(id),
                ops,
                partial,
                prepare,
            } => {
                let buffered = self
                    .txn_buffer
                    .entry(id.clone())
                    .or_insert_with(|| Txn::new(id.clone(), entry.ts));
                buffered.ops.extend(ops);
                buffered.last_ts = entry.ts;
                if prepare {
                    buffered.prepared = true;
                } else if !partial {
                    // last part of an unprepared transaction commits it
                    if let Some(txn) = self.txn_buffer.remove(&id) {
                        self.apply_txn(&txn, entry.ts)?;
                    }
                }
            }

            Op::CommitTxn { txn, commit_ts } => {
                match self.txn_buffer.remove(&txn) {
                    Some(buffered) => self.apply_txn(&buffered, commit_ts)?,
                    None => {
                        pf_debug!(self.ctx; "commit of txn {} before prepare",
                                            txn);
                    }
                }
                self.remember_commit(txn, commit_ts);
            }

            Op::AbortTxn { txn } => {
                self.txn_buffer.remove(&txn);
            }

            op => self.apply_op(entry.ts, &entry.ns, &op)?,
        }

        Ok(())
    }

    fn remember_commit(&mut self, id: TxnId, ctime: Timestamp) {
        self.committed.push_back(RestoreTxn {
            id,
            ctime,
            state: TxnState::Commit,
        });
        while self.committed.len() > self.txn_window {
            self.committed.pop_front();
        }
    }

    fn apply_txn(&mut self, txn: &Txn, ts: Timestamp) -> Result<(), PitrError> {
        for op in &txn.ops {
            self.apply_op(ts, &op.ns, &op.op).map_err(|e| {
                e.wrap(format!("txn {}", txn.id))
            })?;
        }
        Ok(())
    }

    fn apply_op(
        &mut self,
        ts: Timestamp,
        ns: &str,
        op: &Op,
    ) -> Result<(), PitrError> {
        if is_internal_ns(ns) || !self.include.allows(ns) {
            return Ok(());
        }
        if let Some(filter) = &self.filter {
            if !filter(ns, op) {
                return Ok(());
            }
        }

        match op {
            Op::Noop => Ok(()),
            Op::Command { name, arg, body } if name == "createIndexes" => {
                self.catalog.create_index(ns, arg, body.clone());
                Ok(())
            }
            Op::Command { name, arg, .. } if name == "dropIndexes" => {
                self.catalog.drop_index(ns, arg);
                Ok(())
            }
            Op::Command { name, .. } if name == "drop" => {
                self.catalog.drop_collection(ns);
                self.node_apply(ts, ns, op)
            }
            Op::ApplyOps { .. }
            | Op::CommitTxn { .. }
            | Op::AbortTxn { .. } => {
                Err(PitrError::new(
                    ErrorKind::Decode,
                    format!("nested {} on {} at {}", op.name(), ns, ts),
                ))
            }
            _ => self.node_apply(ts, ns, op),
        }
    }

    fn node_apply(
        &mut self,
        ts: Timestamp,
        ns: &str,
        op: &Op,
    ) -> Result<(), PitrError> {
        self.node.apply_op(ts, ns, op).map_err(|e| {
            PitrError::new(
                ErrorKind::Apply,
                format!("apply {} on {} at {}: {}", op.name(), ns, ts, e),
            )
        })?;
        self.applied += 1;
        Ok(())
    }

    /// Takes the transactions left without a commit or abort marker,
    /// ordered by first appearance, together with the window of recently
    /// committed ones.
    pub fn take_leftovers(&mut self) -> (Vec<Txn>, Vec<RestoreTxn>) {
        let mut leftovers: Vec<Txn> =
            self.txn_buffer.drain().map(|(_, txn)| txn).collect();
        leftovers.sort_by(|a, b| {
            a.first_ts.cmp(&b.first_ts).then_with(|| a.id.cmp(&b.id))
        });
        (leftovers, self.committed.iter().cloned().collect())
    }

    /// Applies a leftover that got committed on another shard.
    pub fn commit_leftover(
        &mut self,
        txn: &Txn,
        ctime: Timestamp,
    ) -> Result<(), PitrError> {
        self.apply_txn(txn, ctime)
    }
}

#[cfg(test)]
mod restore_tests {
    use super::*;
    use crate::oplog::encode_entries;
    use bytes::Bytes;
    use std::io::Cursor;
    use std::sync::Arc;

    fn ts(t: u32) -> Timestamp {
        Timestamp::new(t, 0)
    }

    fn insert(t: u32, ns: &str) -> OplogEntry {
        OplogEntry {
            ts: ts(t),
            ns: ns.into(),
            op: Op::Insert {
                doc: Bytes::from_static(b"{}"),
            },
        }
    }

    fn txn_part(
        t: u32,
        id: &str,
        ns: &str,
        partial: bool,
        prepare: bool,
    ) -> OplogEntry {
        OplogEntry {
            ts: ts(t),
            ns: "admin.$cmd".into(),
            op: Op::ApplyOps {
                txn: Some(TxnId::from(id)),
                ops: vec![TxnOp {
                    ns: ns.into(),
                    op: Op::Insert {
                        doc: Bytes::from_static(b"{}"),
                    },
                }],
                partial,
                prepare,
            },
        }
    }

    fn commit(t: u32, id: &str) -> OplogEntry {
        OplogEntry {
            ts: ts(t),
            ns: "admin.$cmd".into(),
            op: Op::CommitTxn {
                txn: TxnId::from(id),
                commit_ts: ts(t),
            },
        }
    }

    fn stream(entries: &[OplogEntry]) -> Box<dyn Read + Send> {
        Box::new(Cursor::new(encode_entries(entries).unwrap()))
    }

    #[test]
    fn timeframe_and_namespaces() -> Result<(), PitrError> {
        let mut node = MemNode::new();
        let mut ic = IndexCatalog::new();
        let mut or = OplogRestore::new(&mut node, &mut ic, false, 100)?;
        or.set_timeframe(ts(2), ts(5));
        or.set_include_ns(vec!["app.*".into()]);
        let last = or.apply(stream(&[
            insert(1, "app.a"),
            insert(2, "app.a"),
            insert(3, "other.b"),
            insert(4, "local.oplog.rs"),
            insert(5, "app.a"),
        ]))?;
        assert_eq!(last, ts(4));
        assert_eq!(or.applied_count(), 1);
        drop(or);
        assert_eq!(node.applied_ns(), vec!["app.a"]);
        assert_eq!(node.applied()[0].0, ts(2));
        Ok(())
    }

    #[test]
    fn op_filter_applies_last() -> Result<(), PitrError> {
        let mut node = MemNode::new();
        let mut ic = IndexCatalog::new();
        let mut or = OplogRestore::new(&mut node, &mut ic, false, 100)?;
        or.set_op_filter(Some(Arc::new(|ns: &str, _: &Op| ns != "app.skip")));
        or.apply(stream(&[insert(1, "app.keep"), insert(2, "app.skip")]))?;
        drop(or);
        assert_eq!(node.applied_ns(), vec!["app.keep"]);
        Ok(())
    }

    #[test]
    fn out_of_order_needs_unsafe() -> Result<(), PitrError> {
        let entries = [insert(5, "app.a"), insert(4, "app.a")];

        let mut node = MemNode::new();
        let mut ic = IndexCatalog::new();
        let mut strict =
            OplogRestore::new(&mut node, &mut ic, false, 100)?;
        let e = strict.apply(stream(&entries)).unwrap_err();
        assert!(e.is(ErrorKind::Integrity));
        drop(strict);

        let mut node = MemNode::new();
        let mut ic = IndexCatalog::new();
        let mut relaxed =
            OplogRestore::new(&mut node, &mut ic, true, 100)?;
        assert_eq!(relaxed.apply(stream(&entries))?, ts(5));
        drop(relaxed);
        assert_eq!(node.applied().len(), 2);
        Ok(())
    }

    #[test]
    fn transactions_buffer_until_commit() -> Result<(), PitrError> {
        let mut node = MemNode::new();
        let mut ic = IndexCatalog::new();
        let mut or = OplogRestore::new(&mut node, &mut ic, false, 100)?;
        or.apply(stream(&[
            // distributed, committed locally
            txn_part(1, "t1", "app.a", false, true),
            commit(2, "t1"),
            // distributed, never closed
            txn_part(3, "t2", "app.b", false, true),
            // large txn split in parts, last part missing
            txn_part(4, "t3", "app.c", true, false),
            // unprepared txn in two parts, applied at the last one
            txn_part(5, "t4", "app.d", true, false),
            txn_part(6, "t4", "app.d", false, false),
            // aborted
            txn_part(7, "t5", "app.e", false, true),
            OplogEntry {
                ts: ts(8),
                ns: "admin.$cmd".into(),
                op: Op::AbortTxn {
                    txn: TxnId::from("t5"),
                },
            },
        ]))?;

        let (leftovers, committed) = or.take_leftovers();
        let ids: Vec<&str> =
            leftovers.iter().map(|t| t.id.0.as_str()).collect();
        assert_eq!(ids, vec!["t2", "t3"]);
        assert!(leftovers[0].prepared);
        assert!(!leftovers[1].prepared);
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].id, TxnId::from("t1"));
        drop(or);
        assert_eq!(node.applied_ns(), vec!["app.a", "app.d", "app.d"]);
        Ok(())
    }

    #[test]
    fn commit_window_rolls() -> Result<(), PitrError> {
        let mut node = MemNode::new();
        let mut ic = IndexCatalog::new();
        let mut or = OplogRestore::new(&mut node, &mut ic, false, 3)?;
        let mut entries = Vec::new();
        for i in 0..5u32 {
            let id = format!("t{}", i);
            entries.push(txn_part(10 + 2 * i, &id, "app.a", false, true));
            entries.push(commit(11 + 2 * i, &id));
        }
        or.apply(stream(&entries))?;
        let (_, committed) = or.take_leftovers();
        let ids: Vec<&str> =
            committed.iter().map(|t| t.id.0.as_str()).collect();
        assert_eq!(ids, vec!["t2", "t3", "t4"]);
        Ok(())
    }

    #[test]
    fn index_commands_go_to_catalog() -> Result<(), PitrError> {
        let mut node = MemNode::new();
        let mut ic = IndexCatalog::new();
        let cmd = |t: u32, name: &str, arg: &str| OplogEntry {
            ts: ts(t),
            ns: "app.users".into(),
            op: Op::Command {
                name: name.into(),
                arg: arg.into(),
                body: Bytes::new(),
            },
        };
        let mut or = OplogRestore::new(&mut node, &mut ic, false, 100)?;
        or.apply(stream(&[
            cmd(1, "createIndexes", "email_1"),
            cmd(2, "createIndexes", "age_1"),
            cmd(3, "dropIndexes", "age_1"),
        ]))?;
        drop(or);
        assert!(node.applied().is_empty());
        let queued = ic.queued();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].1.name, "email_1");
        Ok(())
    }

    #[test]
    fn node_failure_is_apply_error() -> Result<(), PitrError> {
        let mut node = MemNode::new();
        node.fail_on("app.bad");
        let mut ic = IndexCatalog::new();
        let mut or = OplogRestore::new(&mut node, &mut ic, false, 100)?;
        let e = or
            .apply(stream(&[insert(1, "app.ok"), insert(2, "app.bad")]))
            .unwrap_err();
        assert!(e.is(ErrorKind::Apply));
        assert!(e.to_string().contains("app.bad"));
        Ok(())
    }

    #[test]
    fn rewind_drops_partial_replay() -> Result<(), PitrError> {
        let mut node = MemNode::new();
        let mut ic = IndexCatalog::new();
        let mut or = OplogRestore::new(&mut node, &mut ic, false, 100)?;
        or.apply(stream(&[insert(1, "app.a")]))?;
        let mark = or.mark();

        // half of a chunk, then the stream breaks off
        let mut broken = encode_entries(&[
            txn_part(2, "t1", "app.b", false, true),
            insert(3, "app.a"),
        ])?;
        broken.truncate(broken.len() - 2);
        assert!(or.apply(Box::new(Cursor::new(broken))).is_err());

        or.rewind(mark);
        assert_eq!(or.last_ts(), ts(1));
        or.apply(stream(&[
            txn_part(2, "t1", "app.b", false, true),
            insert(3, "app.a"),
        ]))?;
        let (leftovers, _) = or.take_leftovers();
        assert_eq!(leftovers.len(), 1);
        assert_eq!(leftovers[0].ops.len(), 1);
        Ok(())
    }

    #[test]
    fn version_parsing() -> Result<(), PitrError> {
        assert_eq!(MongoVersion::parse("4.4.18")?, MongoVersion::new(4, 4, 18));
        assert_eq!(MongoVersion::parse("7.0")?, MongoVersion::new(7, 0, 0));
        assert_eq!(
            MongoVersion::parse("5.0.2-rc1")?,
            MongoVersion::new(5, 0, 2)
        );
        assert!(MongoVersion::parse("x.y").is_err());
        assert!(MongoVersion::parse("4").is_err());
        assert!(!MongoVersion::new(4, 0, 28).supports_dist_txn());
        assert!(MongoVersion::new(4, 2, 0).supports_dist_txn());
        Ok(())
    }
}
