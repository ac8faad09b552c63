// SPDX-License-Identifier: Apache-2.0

use crate::StoreError;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::debug;
use vatgate_model::{newest_members, BundleName, DatasetVersion, MemberFile, SnapshotBundle};

const CREATE_ATTEMPTS: i64 = 16;

/// Directory of timestamp-named snapshot bundles.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn ensure_root(&self) -> Result<(), StoreError> {
        std::fs::create_dir_all(&self.root)?;
        Ok(())
    }

    /// All bundles, oldest first. A missing root is an empty store.
    pub fn list(&self) -> Result<Vec<SnapshotBundle>, StoreError> {
        let read = match std::fs::read_dir(&self.root) {
            Ok(read) => read,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut bundles = Vec::new();
        for entry in read {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let path = entry.path();
            match self.inspect(&path) {
                Ok(bundle) => bundles.push(bundle),
                Err(e) => debug!(path = %path.display(), error = %e, "skipping non-bundle entry"),
            }
        }
        bundles.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(bundles)
    }

    pub fn inspect(&self, dir: &Path) -> Result<SnapshotBundle, StoreError> {
        let file_name = dir
            .file_name()
            .and_then(|s| s.to_str())
            .ok_or_else(|| StoreError(format!("bundle path has no name: {}", dir.display())))?;
        let name = BundleName::parse(file_name).map_err(|e| StoreError(e.to_string()))?;
        let path = std::fs::canonicalize(dir)?;
        let modified = std::fs::metadata(&path)?
            .modified()
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&path)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(member) = entry.file_name().to_str().and_then(MemberFile::parse) {
                files.push(member);
            }
        }
        Ok(SnapshotBundle {
            name,
            path,
            modified,
            members: newest_members(files),
        })
    }

    /// Complete bundles, newest first.
    pub fn complete_newest_first(
        &self,
        required: &[String],
    ) -> Result<Vec<SnapshotBundle>, StoreError> {
        let mut bundles: Vec<SnapshotBundle> = self
            .list()?
            .into_iter()
            .filter(|b| b.completeness(required).is_complete())
            .collect();
        bundles.reverse();
        Ok(bundles)
    }

    pub fn newest_complete(
        &self,
        required: &[String],
    ) -> Result<Option<SnapshotBundle>, StoreError> {
        Ok(self.complete_newest_first(required)?.into_iter().next())
    }

    /// Versions of up to `limit` bundles other than `current`, newest first.
    pub fn previous_versions(
        &self,
        current: &DatasetVersion,
        limit: usize,
    ) -> Result<Vec<DatasetVersion>, StoreError> {
        Ok(self
            .list()?
            .iter()
            .rev()
            .map(SnapshotBundle::version)
            .filter(|v| v != current)
            .take(limit)
            .collect())
    }

    /// Creates an empty bundle directory named after `at`, moving forward one
    /// millisecond at a time if that name is already taken.
    pub fn create_bundle_dir(&self, at: DateTime<Utc>) -> Result<PathBuf, StoreError> {
        self.ensure_root()?;
        for attempt in 0..CREATE_ATTEMPTS {
            let name = BundleName::at(at + ChronoDuration::milliseconds(attempt));
            let dir = self.root.join(name.as_str());
            match std::fs::create_dir(&dir) {
                Ok(()) => return Ok(std::fs::canonicalize(&dir)?),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(StoreError(format!(
            "no free bundle name near {}",
            BundleName::at(at)
        )))
    }

    /// Removes a bundle directory. Refuses paths outside the store root.
    pub fn delete_dir(&self, dir: &Path) -> Result<(), StoreError> {
        let root = std::fs::canonicalize(&self.root)?;
        let target = match std::fs::canonicalize(dir) {
            Ok(target) => target,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if target.parent() != Some(root.as_path()) {
            return Err(StoreError(format!(
                "refusing to delete {} outside snapshot root {}",
                target.display(),
                root.display()
            )));
        }
        std::fs::remove_dir_all(&target)?;
        Ok(())
    }

    pub fn delete(&self, bundle: &SnapshotBundle) -> Result<(), StoreError> {
        self.delete_dir(&bundle.path)
    }
}
