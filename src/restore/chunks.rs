//! Oplog chunk selection and timeline continuity checks.

use std::collections::HashMap;

use crate::storage::Storage;
use crate::store::{MetaStore, OplogChunk};
use crate::utils::{ErrorKind, PitrError, ResultExt, Timestamp};

/// Replica set name mapping, backup side to restore side or back.
pub type RsMapFunc = dyn Fn(&str) -> String + Send + Sync;

/// Maps backup-side replica set names to the restore-side ones given in
/// `rs_map`; unmapped names stay as they are.
pub fn make_rs_map_func(rs_map: &HashMap<String, String>) -> Box<RsMapFunc> {
    let rs_map = rs_map.clone();
    Box::new(move |rs: &str| {
        rs_map.get(rs).cloned().unwrap_or_else(|| rs.to_string())
    })
}

/// The inverse of `make_rs_map_func`: restore-side names back to the
/// backup-side ones chunks are stored under.
pub fn make_reverse_rs_map_func(
    rs_map: &HashMap<String, String>,
) -> Box<RsMapFunc> {
    let reversed: HashMap<String, String> = rs_map
        .iter()
        .map(|(from, to)| (to.clone(), from.clone()))
        .collect();
    make_rs_map_func(&reversed)
}

fn integrity(msg: String) -> PitrError {
    PitrError::new(ErrorKind::Integrity, msg)
}

/// Returns the chunks of replica set `rs_name` covering `[from, to]`, after
/// checking that they form a gap-free and overlap-free timeline and that
/// each one is present on the storage.
pub async fn chunks(
    store: &dyn MetaStore,
    storage: &dyn Storage,
    from: Timestamp,
    to: Timestamp,
    rs_name: &str,
    map_rev_rs: &RsMapFunc,
) -> Result<Vec<OplogChunk>, PitrError> {
    let backup_rs = map_rev_rs(rs_name);
    let chunks = store
        .pitr_chunks_slice(&backup_rs, from, to)
        .await
        .wrap_err("get chunks index")?;

    let last = match chunks.last() {
        Some(last) => last,
        None => return Err(integrity("no chunks found".into())),
    };
    if last.end_ts < to {
        return Err(integrity(format!(
            "no chunk with the target time, the last chunk ends on {}",
            last.end_ts
        )));
    }

    let mut last_ts = from;
    for (i, chunk) in chunks.iter().enumerate() {
        if chunk.start_ts > last_ts {
            return Err(integrity(format!(
                "integrity violated, expect chunk with start_ts {}, but got {}",
                last_ts, chunk.start_ts
            )));
        }
        if i > 0 && chunk.start_ts < last_ts {
            return Err(integrity(format!(
                "integrity violated, chunk {} overlaps previous end {}",
                chunk, last_ts
            )));
        }
        last_ts = chunk.end_ts;

        let err = match storage.file_stat(&chunk.fname) {
            Ok(info) if info.size == 0 => "file is empty".to_string(),
            Ok(_) => continue,
            Err(e) => e.to_string(),
        };
        return Err(integrity(format!(
            "failed to ensure chunk {}.{} on the storage, file: {}, error: {}",
            chunk.start_ts, chunk.end_ts, chunk.fname, err
        )));
    }

    Ok(chunks)
}
