// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

use sha2::{Digest, Sha256};
use url::form_urlencoded;

pub const CRATE_NAME: &str = "vatgate-core";

#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Decodes a raw query string into `(key, value)` pairs sorted by key, then value.
#[must_use]
pub fn sorted_query_pairs(raw_query: &str) -> Vec<(String, String)> {
    let mut pairs: Vec<(String, String)> = form_urlencoded::parse(raw_query.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort();
    pairs
}

/// Canonical, re-encoded form of a query string. Parameter order in the input
/// does not affect the output, and percent-encoding differences are normalized.
#[must_use]
pub fn canonical_query(raw_query: &str) -> String {
    let pairs = sorted_query_pairs(raw_query);
    let mut out = form_urlencoded::Serializer::new(String::new());
    for (k, v) in &pairs {
        out.append_pair(k, v);
    }
    out.finish()
}
