// SPDX-License-Identifier: Apache-2.0

use crate::source::{DatasetSource, SourceError};
use chrono::{DateTime, Utc};
use std::sync::{Arc, PoisonError, RwLock};
use vatgate_model::{DatasetVersion, SnapshotBundle};

/// A dataset together with the bundle it was read from.
#[derive(Debug)]
pub struct LoadedDataset<D> {
    pub version: DatasetVersion,
    /// `None` for a dataset taken from the live upstream at bootstrap.
    pub bundle: Option<SnapshotBundle>,
    pub loaded_at: DateTime<Utc>,
    pub data: D,
}

impl<D> LoadedDataset<D> {
    /// Reads `bundle` into a scratch dataset that nothing serves from yet.
    pub async fn from_bundle<S>(source: &S, bundle: &SnapshotBundle) -> Result<Self, SourceError>
    where
        S: DatasetSource<Dataset = D>,
    {
        let data = source.load(bundle).await?;
        Ok(Self {
            version: bundle.version(),
            bundle: Some(bundle.clone()),
            loaded_at: Utc::now(),
            data,
        })
    }

    #[must_use]
    pub fn bootstrap(data: D) -> Self {
        Self {
            version: DatasetVersion::bootstrap(),
            bundle: None,
            loaded_at: Utc::now(),
            data,
        }
    }
}

/// Pointer to the dataset handlers currently read from. Swapping replaces the
/// whole `Arc`, so a reader holds either the old or the new dataset.
pub struct DatasetHandle<D> {
    current: Arc<RwLock<Option<Arc<LoadedDataset<D>>>>>,
}

impl<D> Clone for DatasetHandle<D> {
    fn clone(&self) -> Self {
        Self {
            current: Arc::clone(&self.current),
        }
    }
}

impl<D> Default for DatasetHandle<D> {
    fn default() -> Self {
        Self {
            current: Arc::new(RwLock::new(None)),
        }
    }
}

impl<D> DatasetHandle<D> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn current(&self) -> Option<Arc<LoadedDataset<D>>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn version(&self) -> Option<DatasetVersion> {
        self.current().map(|d| d.version.clone())
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Makes `loaded` current and returns the version it replaced.
    pub fn publish(&self, loaded: LoadedDataset<D>) -> Option<DatasetVersion> {
        let next = Arc::new(loaded);
        let previous = self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(next);
        previous.map(|d| d.version.clone())
    }

    /// Loads `bundle` and publishes it. On failure the current dataset stays.
    pub async fn load<S>(&self, source: &S, bundle: &SnapshotBundle) -> Result<DatasetVersion, SourceError>
    where
        S: DatasetSource<Dataset = D>,
    {
        let loaded = LoadedDataset::from_bundle(source, bundle).await?;
        let version = loaded.version.clone();
        self.publish(loaded);
        Ok(version)
    }
}
