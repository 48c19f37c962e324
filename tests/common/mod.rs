//! Fixtures shared by the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use bytes::Bytes;

use pitrcoord::compress::{Codecs, CompressionType};
use pitrcoord::oplog::{
    encode_entries, MemNode, MongoVersion, Op, OplogEntry, TxnId, TxnOp,
};
use pitrcoord::restore::{CoordConfig, Coordinator, ShardAgent};
use pitrcoord::storage::MemStorage;
use pitrcoord::store::{
    Command, LockData, LockHeader, MemStore, MetaStore, NodeInfo, OplogChunk,
    RestoreMeta, RestoreReplset, Shard, Status,
};
use pitrcoord::{logger_init, PitrError, Timestamp};

use tokio::sync::watch;

pub const NAME: &str = "2024-05-01T10:00:00Z";
pub const OPID: &str = "op-6632";

pub fn ts(t: u32) -> Timestamp {
    Timestamp::new(t, 0)
}

pub fn insert(t: u32, ns: &str) -> OplogEntry {
    OplogEntry {
        ts: ts(t),
        ns: ns.into(),
        op: Op::Insert {
            doc: Bytes::from_static(b"{\"_id\":1}"),
        },
    }
}

pub fn prepared(t: u32, txn: &str, ns: &str) -> OplogEntry {
    OplogEntry {
        ts: ts(t),
        ns: "admin.$cmd".into(),
        op: Op::ApplyOps {
            txn: Some(TxnId::from(txn)),
            ops: vec![TxnOp {
                ns: ns.into(),
                op: Op::Insert {
                    doc: Bytes::from_static(b"{\"_id\":2}"),
                },
            }],
            partial: false,
            prepare: true,
        },
    }
}

pub fn commit(t: u32, txn: &str) -> OplogEntry {
    OplogEntry {
        ts: ts(t),
        ns: "admin.$cmd".into(),
        op: Op::CommitTxn {
            txn: TxnId::from(txn),
            commit_ts: ts(t),
        },
    }
}

/// Stores an uncompressed chunk of `rs` and indexes it.
pub fn put_chunk(
    store: &MemStore,
    storage: &MemStorage,
    rs: &str,
    start: u32,
    end: u32,
    codec: CompressionType,
    entries: &[OplogEntry],
) -> Result<OplogChunk, PitrError> {
    let data = encode_entries(entries)?;
    let chunk = OplogChunk {
        rs: rs.into(),
        fname: format!(
            "pbmPitr/{}/{}-{}.oplog{}",
            rs,
            start,
            end,
            codec.suffix()
        ),
        compression: codec,
        start_ts: ts(start),
        end_ts: ts(end),
        size: data.len() as u64,
    };
    storage.put(chunk.fname.clone(), data);
    store.put_chunk(chunk.clone());
    Ok(chunk)
}

pub fn lock_header(rs: &str) -> LockHeader {
    LockHeader {
        cmd: Command::Restore,
        opid: OPID.into(),
        replset: rs.into(),
    }
}

/// A restore record with the given shards registered in `starting` and
/// holding fresh locks.
pub async fn restore_with_shards(
    store: &MemStore,
    rss: &[&str],
) -> Result<Vec<Shard>, PitrError> {
    let now = store.cluster_time().await?;
    store.set_restore_meta(RestoreMeta::new(NAME, OPID, now)).await?;
    let mut shards = Vec::new();
    for rs in rss {
        store
            .acquire_lock(LockData {
                header: lock_header(rs),
                node: format!("{}-node0:27017", rs),
                heartbeat: now,
            })
            .await?;
        store
            .add_restore_rs_meta(
                NAME,
                RestoreReplset::new(*rs, Status::Starting),
            )
            .await?;
        shards.push(Shard::new(*rs));
    }
    Ok(shards)
}

pub fn node_info(rs: &str, leader: bool) -> NodeInfo {
    NodeInfo {
        set_name: rs.into(),
        me: format!("{}-node0:27017", rs),
        leader,
    }
}

pub fn coordinator(
    store: Arc<MemStore>,
    rx_term: watch::Receiver<bool>,
) -> Coordinator {
    Coordinator::new(store, CoordConfig::default(), rx_term)
}

pub fn agent(
    store: Arc<MemStore>,
    storage: MemStorage,
    rs: &str,
    leader: bool,
    rx_term: watch::Receiver<bool>,
) -> ShardAgent {
    logger_init("warn");
    ShardAgent::new(
        coordinator(store, rx_term),
        Arc::new(storage),
        Arc::new(Codecs),
        node_info(rs, leader),
        MongoVersion::new(6, 0, 0),
    )
}

pub fn new_node() -> MemNode {
    MemNode::new()
}
