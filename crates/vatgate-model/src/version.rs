use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::path::Path;

/// Version carried by a dataset served straight from the live upstream
/// connection, before any bundle exists.
pub const BOOTSTRAP_VERSION: &str = "bootstrap";

/// Identifier of the dataset currently loaded; the canonical path of the
/// bundle it was loaded from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(transparent)]
pub struct DatasetVersion(String);

impl DatasetVersion {
    /// Callers pass an already-canonicalized path.
    #[must_use]
    pub fn from_path(path: &Path) -> Self {
        Self(path.to_string_lossy().into_owned())
    }

    #[must_use]
    pub fn bootstrap() -> Self {
        Self(BOOTSTRAP_VERSION.to_string())
    }

    #[must_use]
    pub fn is_bootstrap(&self) -> bool {
        self.0 == BOOTSTRAP_VERSION
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for DatasetVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
