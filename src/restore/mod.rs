//! Point-in-time restore coordination across the shards of a cluster.

mod agent;
mod chunks;
mod config;
mod converge;
mod heartbeat;
mod meta;
mod reconcile;
mod replay;

pub use agent::{PitrReport, PitrRequest, ShardAgent};
pub use chunks::{chunks, make_reverse_rs_map_func, make_rs_map_func, RsMapFunc};
pub use config::CoordConfig;
pub use converge::Coordinator;
pub use heartbeat::{spawn_lock_hb, spawn_restore_hb};
pub use meta::{get_backup_meta, get_meta_from_store, METADATA_FILE_SUFFIX};
pub use reconcile::{
    classify_leftovers, publish_detached, StoreEvidence, TxnEvidence,
    TxnResolution,
};
pub use replay::{ApplyOplogOptions, OplogReplayer, ReplayOutcome};
