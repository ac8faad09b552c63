#![forbid(unsafe_code)]

mod fs;
mod responses;
mod retention;
mod snapshots;

pub use fs::{prune_oldest_files, write_atomic_file};
pub use responses::{ResponseCache, StaticExportMirror};
pub use retention::{plan_retention, RetentionPlan};
pub use snapshots::SnapshotStore;

use std::fmt::{Display, Formatter};

pub const CRATE_NAME: &str = "vatgate-store";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreError(pub String);

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        Self(e.to_string())
    }
}
