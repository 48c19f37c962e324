//! In-memory storage backend.

use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::sync::{Arc, Mutex};

use crate::storage::{FileInfo, Storage};
use crate::utils::PitrError;

use bytes::Bytes;

/// Storage keeping objects in a shared map. Clones share the same objects.
#[derive(Debug, Default, Clone)]
pub struct MemStorage {
    objects: Arc<Mutex<HashMap<String, Bytes>>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores (or replaces) an object.
    pub fn put(&self, name: impl Into<String>, data: impl Into<Bytes>) {
        self.lock().insert(name.into(), data.into());
    }

    /// Removes an object, returning true if it existed.
    pub fn remove(&self, name: &str) -> bool {
        self.lock().remove(name).is_some()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Bytes>> {
        // a poisoned map is still consistent: every op is a single insert
        // or remove
        self.objects.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Storage for MemStorage {
    fn source_reader(
        &self,
        name: &str,
    ) -> Result<Box<dyn Read + Send>, PitrError> {
        match self.lock().get(name) {
            Some(data) => Ok(Box::new(Cursor::new(data.clone()))),
            None => Err(PitrError::not_found(format!(
                "object '{}' not found",
                name
            ))),
        }
    }

    fn file_stat(&self, name: &str) -> Result<FileInfo, PitrError> {
        match self.lock().get(name) {
            Some(data) => Ok(FileInfo {
                name: name.into(),
                size: data.len() as u64,
            }),
            None => Err(PitrError::not_found(format!(
                "object '{}' not found",
                name
            ))),
        }
    }
}
