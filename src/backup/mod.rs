//! Backup-time pieces: which node of each replica set takes the backup.

mod nomination;
mod priority;

pub use nomination::{try_accept, Nominator};
pub use priority::{
    bcp_nodes_priority, nodes_priority, AgentStat, NodeState, NodesPriority,
    SubsysStatus, DEFAULT_SCORE,
};
