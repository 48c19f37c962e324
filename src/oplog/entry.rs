//! Oplog entry model and the chunk object codec.
//!
//! A chunk object is a sequence of frames, each an 8-byte big-endian length
//! header followed by that many bytes of MessagePack-encoded `OplogEntry`.

use std::fmt;
use std::io::{self, Read};

use crate::utils::{ErrorKind, PitrError, Timestamp};

use bytes::Bytes;

use serde::{Deserialize, Serialize};

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

/// Upper bound of a single encoded entry; anything larger is corruption.
const MAX_ENTRY_LEN: u64 = 64 * 1024 * 1024;

/// Transaction identifier, `<lsid>:<txnNumber>`.
#[derive(
    Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Clone, Serialize, Deserialize,
)]
pub struct TxnId(pub String);

impl From<&str> for TxnId {
    fn from(s: &str) -> Self {
        TxnId(s.into())
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Operation carried by an oplog entry. Documents are opaque encoded bytes
/// handed to the node as is.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum Op {
    Insert {
        doc: Bytes,
    },
    Update {
        filter: Bytes,
        update: Bytes,
    },
    Delete {
        filter: Bytes,
    },
    Noop,
    /// DDL command against the entry's namespace. `arg` is the command's
    /// argument, e.g., the index name of `createIndexes`.
    Command {
        name: String,
        #[serde(default)]
        arg: String,
        #[serde(default)]
        body: Bytes,
    },
    /// Batch of operations. With a `txn` id it is (part of) a transaction:
    /// `partial` parts are followed by more, a `prepare` part closes a
    /// distributed transaction that awaits its commit marker.
    ApplyOps {
        txn: Option<TxnId>,
        ops: Vec<TxnOp>,
        #[serde(default)]
        partial: bool,
        #[serde(default)]
        prepare: bool,
    },
    CommitTxn {
        txn: TxnId,
        commit_ts: Timestamp,
    },
    AbortTxn {
        txn: TxnId,
    },
}

impl Op {
    /// Short name for logging.
    pub fn name(&self) -> &str {
        match self {
            Self::Insert { .. } => "i",
            Self::Update { .. } => "u",
            Self::Delete { .. } => "d",
            Self::Noop => "n",
            Self::Command { name, .. } => name.as_str(),
            Self::ApplyOps { .. } => "applyOps",
            Self::CommitTxn { .. } => "commitTransaction",
            Self::AbortTxn { .. } => "abortTransaction",
        }
    }
}

/// One operation inside an `ApplyOps` batch.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct TxnOp {
    pub ns: String,
    pub op: Op,
}

/// One oplog record.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct OplogEntry {
    pub ts: Timestamp,
    /// `db.collection`; for commands, the collection they act upon.
    pub ns: String,
    pub op: Op,
}

/// Encodes entries into chunk object content.
pub fn encode_entries(entries: &[OplogEntry]) -> Result<Vec<u8>, PitrError> {
    let mut buf = Vec::new();
    for entry in entries {
        let bytes = encode_to_vec(entry)?;
        buf.extend_from_slice(&(bytes.len() as u64).to_be_bytes());
        buf.extend_from_slice(&bytes);
    }
    Ok(buf)
}

/// Iterator decoding entries out of a (decompressed) chunk stream.
pub struct EntryReader<R> {
    inner: R,
    done: bool,
}

impl<R: Read> EntryReader<R> {
    pub fn new(inner: R) -> Self {
        EntryReader { inner, done: false }
    }

    /// Reads the length header, `None` on a clean end of stream.
    fn read_header(&mut self) -> Result<Option<u64>, PitrError> {
        let mut header = [0u8; 8];
        let mut filled = 0;
        while filled < header.len() {
            match self.inner.read(&mut header[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => {
                    return Err(PitrError::new(
                        ErrorKind::Decode,
                        format!("truncated entry header ({} bytes)", filled),
                    ))
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(Some(u64::from_be_bytes(header)))
    }

    fn read_entry(&mut self) -> Result<Option<OplogEntry>, PitrError> {
        let len = match self.read_header()? {
            Some(len) => len,
            None => return Ok(None),
        };
        if len > MAX_ENTRY_LEN {
            return Err(PitrError::new(
                ErrorKind::Decode,
                format!("entry length {} out of bound", len),
            ));
        }

        let mut entry_buf = vec![0; len as usize];
        self.inner.read_exact(&mut entry_buf).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                PitrError::new(
                    ErrorKind::Decode,
                    format!("truncated entry of length {}", len),
                )
            } else {
                e.into()
            }
        })?;
        Ok(Some(decode_from_slice(&entry_buf)?))
    }
}

impl<R: Read> Iterator for EntryReader<R> {
    type Item = Result<OplogEntry, PitrError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_entry() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                // no resync after a broken frame
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
