//! Base backup metadata lookup.

use crate::storage::Storage;
use crate::store::{BackupMeta, MetaStore};
use crate::utils::{PitrError, ResultExt};

/// Suffix of the metadata object stored next to each backup.
pub const METADATA_FILE_SUFFIX: &str = ".pbm.json";

/// Reads backup metadata from the object written next to the backup on
/// the storage.
pub fn get_meta_from_store(
    storage: &dyn Storage,
    bcp_name: &str,
) -> Result<BackupMeta, PitrError> {
    let rd = storage
        .source_reader(&format!("{}{}", bcp_name, METADATA_FILE_SUFFIX))
        .wrap_err("get from store")?;
    serde_json::from_reader(rd).wrap_err("decode")
}

/// Reads backup metadata from the metadata store, falling back to the
/// storage copy when the store does not know the backup.
pub async fn get_backup_meta(
    store: &dyn MetaStore,
    storage: &dyn Storage,
    bcp_name: &str,
) -> Result<BackupMeta, PitrError> {
    match store.get_backup_meta(bcp_name).await {
        Ok(meta) => Ok(meta),
        Err(e) if e.is_not_found() => {
            pf_debug!("backup {} not in db, reading storage copy", bcp_name);
            get_meta_from_store(storage, bcp_name)
        }
        Err(e) => Err(e.wrap("get backup metadata")),
    }
}
