//! Local filesystem storage backend.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

use crate::storage::{FileInfo, Storage};
use crate::utils::PitrError;

/// Storage rooted at a local directory.
#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    /// Creates a backend over an existing directory.
    pub fn new_and_setup(root: impl AsRef<Path>) -> Result<Self, PitrError> {
        let root = root.as_ref();
        if !root.is_dir() {
            return logged_err!(
                "storage root '{}' is not a directory",
                root.display()
            );
        }
        Ok(FsStorage { root: root.into() })
    }

    fn path_of(&self, name: &str) -> Result<PathBuf, PitrError> {
        let rel = Path::new(name);
        // object names may not escape the root
        if rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(PitrError::msg(format!(
                "invalid object name '{}'",
                name
            )));
        }
        Ok(self.root.join(rel))
    }
}

fn map_not_found(e: io::Error, name: &str) -> PitrError {
    if e.kind() == io::ErrorKind::NotFound {
        PitrError::not_found(format!("object '{}' not found", name))
    } else {
        PitrError::from(e).wrap(format!("object '{}'", name))
    }
}

impl Storage for FsStorage {
    fn source_reader(
        &self,
        name: &str,
    ) -> Result<Box<dyn Read + Send>, PitrError> {
        let file = File::open(self.path_of(name)?)
            .map_err(|e| map_not_found(e, name))?;
        Ok(Box::new(io::BufReader::new(file)))
    }

    fn file_stat(&self, name: &str) -> Result<FileInfo, PitrError> {
        let meta = fs::metadata(self.path_of(name)?)
            .map_err(|e| map_not_found(e, name))?;
        if !meta.is_file() {
            return Err(PitrError::not_found(format!(
                "object '{}' is not a file",
                name
            )));
        }
        Ok(FileInfo {
            name: name.into(),
            size: meta.len(),
        })
    }
}

#[cfg(test)]
mod fs_tests {
    use super::*;

    #[test]
    fn stat_and_read() -> Result<(), PitrError> {
        let dir = tempfile::tempdir()?;
        fs::create_dir_all(dir.path().join("pbmPitr/rs0"))?;
        fs::write(dir.path().join("pbmPitr/rs0/c1.oplog"), b"abc")?;
        let stg = FsStorage::new_and_setup(dir.path())?;

        let info = stg.file_stat("pbmPitr/rs0/c1.oplog")?;
        assert_eq!(info.size, 3);

        let mut buf = String::new();
        stg.source_reader("pbmPitr/rs0/c1.oplog")?
            .read_to_string(&mut buf)?;
        assert_eq!(buf, "abc");
        Ok(())
    }

    #[test]
    fn missing_is_not_found() -> Result<(), PitrError> {
        let dir = tempfile::tempdir()?;
        let stg = FsStorage::new_and_setup(dir.path())?;
        assert!(stg.file_stat("nope").unwrap_err().is_not_found());
        assert!(stg.source_reader("nope").is_err());
        Ok(())
    }

    #[test]
    fn no_escape_from_root() -> Result<(), PitrError> {
        let dir = tempfile::tempdir()?;
        let stg = FsStorage::new_and_setup(dir.path())?;
        assert!(stg.file_stat("../etc/passwd").is_err());
        assert!(stg.file_stat("/etc/passwd").is_err());
        Ok(())
    }
}
