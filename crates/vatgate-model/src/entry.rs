// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

pub const CACHE_STATUS_HEADER: &str = "x-cache-status";

/// Body returned when no entry exists for the current or any recent version.
pub const MISS_BODY: &str = r#"{"result":"miss"}"#;

/// Headers recomputed on replay; never persisted.
pub const TRANSPORT_HEADERS: &[&str] = &[
    "content-length",
    "transfer-encoding",
    "connection",
    "keep-alive",
    CACHE_STATUS_HEADER,
    "x-request-id",
];

#[must_use]
pub fn is_transport_header(name: &str) -> bool {
    TRANSPORT_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Fresh,
    Stale,
    Miss,
}

impl CacheStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Fresh => "Fresh",
            Self::Stale => "Stale",
            Self::Miss => "Miss",
        }
    }
}

impl Display for CacheStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A persisted 200 response. Header names are lowercased and sorted so equal
/// responses serialize to equal bytes; repeated headers keep every value in
/// arrival order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheEntry {
    pub status_code: u16,
    pub headers: BTreeMap<String, Vec<String>>,
    pub body: String,
}

impl CacheEntry {
    #[must_use]
    pub fn from_response_parts<I>(status_code: u16, headers: I, body: String) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in headers {
            if is_transport_header(&name) {
                continue;
            }
            grouped
                .entry(name.to_ascii_lowercase())
                .or_default()
                .push(value);
        }
        Self {
            status_code,
            headers: grouped,
            body,
        }
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_json_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// On-disk shape of a static export file, read as-is by external consumers:
/// `{"content": <parsed body>, "status_code": 200, "headers": {..}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticExport {
    pub content: serde_json::Value,
    pub status_code: u16,
    pub headers: BTreeMap<String, String>,
}

impl StaticExport {
    /// Fails when the entry body is not JSON. Repeated header values are
    /// joined with `, `.
    pub fn from_entry(entry: &CacheEntry) -> Result<Self, serde_json::Error> {
        Ok(Self {
            content: serde_json::from_str(&entry.body)?,
            status_code: entry.status_code,
            headers: entry
                .headers
                .iter()
                .map(|(name, values)| (name.clone(), values.join(", ")))
                .collect(),
        })
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}
