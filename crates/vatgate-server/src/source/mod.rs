// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use std::path::Path;
use vatgate_model::SnapshotBundle;

pub mod command;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceError(pub String);

impl std::fmt::Display for SourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl std::error::Error for SourceError {}

/// Producer of the analytic dataset. Capture writes member files into a fresh
/// bundle directory; load turns a complete bundle back into a dataset.
#[async_trait]
pub trait DatasetSource: Send + Sync + 'static {
    type Dataset: Send + Sync + 'static;

    fn source_tag(&self) -> &'static str;

    fn required_members(&self) -> Vec<String>;

    /// Dataset read straight from the live upstream, if the source has one.
    async fn bootstrap(&self) -> Result<Option<Self::Dataset>, SourceError>;

    async fn capture(&self, bundle_dir: &Path) -> Result<(), SourceError>;

    /// Must fail on a missing or corrupt member rather than return a partial dataset.
    async fn load(&self, bundle: &SnapshotBundle) -> Result<Self::Dataset, SourceError>;
}
