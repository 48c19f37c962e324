//! Records kept in the shared metadata store.

use std::collections::HashMap;
use std::fmt;

use crate::compress::CompressionType;
use crate::oplog::TxnId;
use crate::utils::{PitrError, Timestamp};

use serde::{Deserialize, Serialize};

/// Restore status, global or per replica set. The happy path is `Starting`
/// -> `Running` -> `DumpDone` -> `Done`; `Error` is absorbing and reachable
/// from any non-terminal status.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Status {
    Starting,
    Running,
    DumpDone,
    Done,
    Cancelled,
    Error,
}

impl Status {
    /// True for statuses that end a restore.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Cancelled | Self::Error)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::DumpDone => "dumpDone",
            Self::Done => "done",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
        };
        write!(f, "{}", name)
    }
}

/// One status transition, kept for describe tooling.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub timestamp: Timestamp,
    pub status: Status,
    #[serde(default)]
    pub error: String,
}

/// Per-restore distributed transaction counters.
#[derive(
    Debug, Default, PartialEq, Eq, Clone, Copy, Serialize, Deserialize,
)]
pub struct DistTxnStat {
    /// Transactions left without local commit/abort evidence.
    pub shard_uncommitted: usize,

    /// Leftovers committed using evidence from other shards.
    pub partial: usize,

    /// Leftovers that stayed uncommitted.
    pub left_uncommitted: usize,
}

/// Transaction outcome recorded for cross-shard lookups.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxnState {
    Commit,
    Prepare,
    Abort,
}

/// A transaction this shard committed during replay.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct RestoreTxn {
    pub id: TxnId,
    pub ctime: Timestamp,
    pub state: TxnState,
}

/// Per replica set part of a restore record. Owned by that set's agent.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct RestoreReplset {
    pub name: String,
    pub status: Status,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub committed_txn: Vec<RestoreTxn>,
    #[serde(default)]
    pub txn_set: bool,
    #[serde(default)]
    pub stat: Option<DistTxnStat>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl RestoreReplset {
    pub fn new(name: impl Into<String>, status: Status) -> Self {
        RestoreReplset {
            name: name.into(),
            status,
            error: String::new(),
            committed_txn: Vec::new(),
            txn_set: false,
            stat: None,
            conditions: Vec::new(),
        }
    }
}

/// One record per restore operation.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct RestoreMeta {
    pub name: String,
    pub opid: String,
    #[serde(default)]
    pub backup: String,
    /// Point-in-time target, zero for snapshot-only restores.
    #[serde(default)]
    pub pitr: Timestamp,
    pub status: Status,
    #[serde(default)]
    pub error: String,
    /// Refreshed by the active coordinator.
    pub hb: Timestamp,
    #[serde(default)]
    pub replsets: Vec<RestoreReplset>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl RestoreMeta {
    pub fn new(
        name: impl Into<String>,
        opid: impl Into<String>,
        hb: Timestamp,
    ) -> Self {
        RestoreMeta {
            name: name.into(),
            opid: opid.into(),
            backup: String::new(),
            pitr: Timestamp::default(),
            status: Status::Starting,
            error: String::new(),
            hb,
            replsets: Vec::new(),
            conditions: Vec::new(),
        }
    }

    pub fn replset(&self, rs: &str) -> Option<&RestoreReplset> {
        self.replsets.iter().find(|r| r.name == rs)
    }
}

/// Kind of operation a lock is held for.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Command {
    Backup,
    Restore,
    Pitr,
}

/// Identifies a per-operation, per-replica-set lock.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Serialize, Deserialize)]
pub struct LockHeader {
    #[serde(rename = "type")]
    pub cmd: Command,
    pub opid: String,
    pub replset: String,
}

impl fmt::Display for LockHeader {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}/{}/{}", self.cmd, self.opid, self.replset)
    }
}

/// Lock record asserting that a replica set's agent is working on an
/// operation. Heartbeat is refreshed only by the owning agent.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct LockData {
    #[serde(flatten)]
    pub header: LockHeader,
    pub node: String,
    pub heartbeat: Timestamp,
}

/// Descriptor of one stored oplog segment covering `[start_ts, end_ts)`.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct OplogChunk {
    pub rs: String,
    pub fname: String,
    #[serde(default)]
    pub compression: CompressionType,
    pub start_ts: Timestamp,
    pub end_ts: Timestamp,
    #[serde(default)]
    pub size: u64,
}

impl fmt::Display for OplogChunk {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}:{}-{} '{}'",
            self.rs, self.start_ts, self.end_ts, self.fname
        )
    }
}

/// Persisted candidate list of one replica set for a backup.
#[derive(Debug, PartialEq, Eq, Clone, Default, Serialize, Deserialize)]
pub struct BackupRsNomination {
    pub rs: String,
    #[serde(default)]
    pub nodes: Vec<String>,
    /// Node that acknowledged, empty until one does.
    #[serde(default)]
    pub ack: String,
}

/// Per replica set part of a backup record.
#[derive(Debug, PartialEq, Eq, Clone, Default, Serialize, Deserialize)]
pub struct BackupReplset {
    pub name: String,
    #[serde(default)]
    pub dump_name: String,
    #[serde(default)]
    pub oplog_name: String,
    #[serde(default)]
    pub last_write_ts: Timestamp,
}

/// Backup record, both in the shared store and as the metadata file that
/// sits next to the backup files in storage.
#[derive(Debug, PartialEq, Eq, Clone, Default, Serialize, Deserialize)]
pub struct BackupMeta {
    pub name: String,
    #[serde(default)]
    pub opid: String,
    #[serde(default)]
    pub compression: CompressionType,
    #[serde(default)]
    pub last_write_ts: Timestamp,
    #[serde(default)]
    pub replsets: Vec<BackupReplset>,
    #[serde(default, rename = "n")]
    pub nomination: Vec<BackupRsNomination>,
}

/// Backup section of the cluster-level configuration.
#[derive(Debug, PartialEq, Clone, Default, Serialize, Deserialize)]
pub struct BackupConf {
    /// Node id (`host:port`) -> backup priority score.
    #[serde(default)]
    pub priority: HashMap<String, f64>,
}

/// Cluster-level configuration held in the shared store.
#[derive(Debug, PartialEq, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub backup: BackupConf,
}

impl Config {
    pub fn from_toml(s: &str) -> Result<Self, PitrError> {
        Ok(toml::from_str(s)?)
    }
}

/// Shard of the cluster taking part in a restore.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct Shard {
    pub id: String,
    pub rs: String,
    #[serde(default)]
    pub host: String,
}

impl Shard {
    pub fn new(rs: impl Into<String>) -> Self {
        let rs = rs.into();
        Shard {
            id: rs.clone(),
            rs,
            host: String::new(),
        }
    }
}

/// What an agent knows about the node it runs next to.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct NodeInfo {
    /// Replica set name.
    pub set_name: String,

    /// Node id, `host:port`.
    pub me: String,

    /// Leadership is decided outside; true if this agent coordinates.
    pub leader: bool,
}

impl NodeInfo {
    #[inline]
    pub fn is_leader(&self) -> bool {
        self.leader
    }
}
