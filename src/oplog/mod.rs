//! Oplog model, chunk decoding and replay onto a node.

mod entry;
mod filter;
mod index;
mod restore;

pub use entry::{encode_entries, EntryReader, Op, OplogEntry, TxnId, TxnOp};
pub use filter::{is_internal_ns, NsFilter, OpFilter};
pub use index::{IndexCatalog, IndexSpec};
pub use restore::{
    MemNode, MongoVersion, OplogApplier, OplogRestore, ReplayMark, Txn,
};
