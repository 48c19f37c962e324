//! Point-in-time restore coordination for sharded replicated clusters.
//!
//! Shard agents coordinate exclusively through a shared metadata store
//! (`MetaStore`): they report per-shard status, hold heartbeat-refreshed
//! locks, and publish committed transactions there. Oplog chunks are read
//! from object storage (`Storage`) through a `Decompressor` and replayed
//! onto a node (`OplogApplier`).

#[macro_use]
mod utils;

pub mod backup;
pub mod compress;
pub mod oplog;
pub mod restore;
pub mod storage;
pub mod store;

pub use utils::{
    logger_init, set_me, ErrorKind, LogEvent, PitrError, ResultExt,
    Timestamp, ME,
};

#[doc(hidden)]
pub use utils::me_prefix;

pub use backup::{bcp_nodes_priority, AgentStat, NodesPriority};
pub use restore::{
    chunks, Coordinator, CoordConfig, OplogReplayer, PitrRequest, ShardAgent,
};
