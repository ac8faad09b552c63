#![forbid(unsafe_code)]
//! Vatgate model SSOT: snapshot bundles, dataset versions, request
//! signatures, cache keys and persisted cache entries.

mod bundle;
mod entry;
mod request;
mod version;

pub use bundle::{
    assess_completeness, newest_members, BundleName, Completeness, MemberFile, SnapshotBundle,
    BUNDLE_PREFIX,
};
pub use entry::{
    is_transport_header, CacheEntry, CacheStatus, StaticExport, CACHE_STATUS_HEADER, MISS_BODY,
    TRANSPORT_HEADERS,
};
pub use request::{CacheKey, RequestSignature, StaticExportKey};
pub use version::{DatasetVersion, BOOTSTRAP_VERSION};

use std::fmt::{Display, Formatter};

pub const CRATE_NAME: &str = "vatgate-model";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError(pub String);

impl Display for ValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ValidationError {}
