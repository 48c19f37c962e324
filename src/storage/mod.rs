//! Object storage abstraction holding backup files and oplog chunks.

mod fs;
mod mem;

use std::io::Read;

use crate::utils::PitrError;

pub use fs::FsStorage;
pub use mem::MemStorage;

/// Stat result of a stored object.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
}

/// Storage backend trait. Object names are `/`-separated paths relative to
/// the backend root.
pub trait Storage: Send + Sync {
    /// Opens the named object for reading. Dropping the reader releases it.
    fn source_reader(&self, name: &str)
        -> Result<Box<dyn Read + Send>, PitrError>;

    /// Stats the named object. Returns a `NotFound` error if it does not
    /// exist; an empty object is reported as found with zero size.
    fn file_stat(&self, name: &str) -> Result<FileInfo, PitrError>;
}
