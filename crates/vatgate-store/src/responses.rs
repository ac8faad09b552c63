// SPDX-License-Identifier: Apache-2.0

use crate::fs::{prune_oldest_files, write_atomic_file};
use crate::StoreError;
use std::path::{Path, PathBuf};
use vatgate_model::{CacheEntry, CacheKey, StaticExport, StaticExportKey};

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, StoreError> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn count_json_files(root: &Path) -> Result<usize, StoreError> {
    let read = match std::fs::read_dir(root) {
        Ok(read) => read,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    let mut count = 0;
    for entry in read {
        let name = entry?.file_name();
        if name
            .to_str()
            .is_some_and(|n| !n.starts_with('.') && n.ends_with(".json"))
        {
            count += 1;
        }
    }
    Ok(count)
}

/// Version-keyed response cache: `<root>/<CacheKey>.json`.
#[derive(Debug, Clone)]
pub struct ResponseCache {
    root: PathBuf,
}

impl ResponseCache {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.file_name())
    }

    #[must_use]
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.path_for(key).is_file()
    }

    pub fn read(&self, key: &CacheKey) -> Result<Option<CacheEntry>, StoreError> {
        let path = self.path_for(key);
        let Some(bytes) = read_optional(&path)? else {
            return Ok(None);
        };
        CacheEntry::from_json_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError(format!("corrupt cache entry {}: {e}", path.display())))
    }

    pub fn write(&self, key: &CacheKey, entry: &CacheEntry) -> Result<(), StoreError> {
        let bytes = entry
            .to_json_bytes()
            .map_err(|e| StoreError(e.to_string()))?;
        write_atomic_file(&self.path_for(key), &bytes)
    }

    pub fn prune(&self, max_files: usize) -> Result<usize, StoreError> {
        prune_oldest_files(&self.root, max_files)
    }

    pub fn len(&self) -> Result<usize, StoreError> {
        count_json_files(&self.root)
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }
}

/// Version-independent mirror for out-of-band serving:
/// `<root>/<StaticExportKey>.json`, each file a [`StaticExport`].
#[derive(Debug, Clone)]
pub struct StaticExportMirror {
    root: PathBuf,
}

impl StaticExportMirror {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn path_for(&self, key: &StaticExportKey) -> PathBuf {
        self.root.join(key.file_name())
    }

    /// File contents exactly as stored, for byte-for-byte serving.
    pub fn read_raw(&self, key: &StaticExportKey) -> Result<Option<Vec<u8>>, StoreError> {
        read_optional(&self.path_for(key))
    }

    pub fn write(&self, key: &StaticExportKey, export: &StaticExport) -> Result<(), StoreError> {
        let bytes = export
            .to_json_bytes()
            .map_err(|e| StoreError(e.to_string()))?;
        write_atomic_file(&self.path_for(key), &bytes)
    }

    pub fn prune(&self, max_files: usize) -> Result<usize, StoreError> {
        prune_oldest_files(&self.root, max_files)
    }

    pub fn len(&self) -> Result<usize, StoreError> {
        count_json_files(&self.root)
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }
}
