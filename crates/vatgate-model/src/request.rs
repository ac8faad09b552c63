// SPDX-License-Identifier: Apache-2.0

use crate::{DatasetVersion, ValidationError};
use std::fmt::{Display, Formatter};
use vatgate_core::{canonical_query, sha256_hex};

const STATIC_EXPORT_MAX_STEM: usize = 180;

/// Characters kept verbatim in export stems; `%` preserves percent-escapes.
fn is_export_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '+' | '-' | '%')
}

/// Canonical description of a request: method, path and sorted query.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestSignature {
    method: String,
    path: String,
    query: String,
}

impl RequestSignature {
    #[must_use]
    pub fn new(method: &str, path: &str, raw_query: Option<&str>) -> Self {
        Self {
            method: method.to_ascii_uppercase(),
            path: path.to_string(),
            query: raw_query.map(canonical_query).unwrap_or_default(),
        }
    }

    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn query(&self) -> &str {
        &self.query
    }
}

impl Display for RequestSignature {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.method, self.path, self.query)
    }
}

/// `sha256(version, signature)`; names one cache entry file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    #[must_use]
    pub fn derive(version: &DatasetVersion, signature: &RequestSignature) -> Self {
        let version = version.as_str();
        let input = format!("{}:{}:{}", version.len(), version, signature);
        Self(sha256_hex(input.as_bytes()))
    }

    pub fn parse(input: &str) -> Result<Self, ValidationError> {
        if input.len() != 64
            || !input
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
        {
            return Err(ValidationError(format!("invalid cache key: {input}")));
        }
        Ok(Self(input.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn file_name(&self) -> String {
        format!("{}.json", self.0)
    }
}

impl Display for CacheKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Version-independent file stem for the static export mirror, e.g.
/// `GET_api_price-shock_usermap__asset_group-ignore%2Bstables_oracle_distortion-0.05_n_scenarios-5`.
///
/// The query keeps the order and percent-encoding it arrived with, so
/// consumers that build file names from their own parameter order find the
/// file they asked for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StaticExportKey(String);

impl StaticExportKey {
    #[must_use]
    pub fn from_request(method: &str, path: &str, raw_query: Option<&str>) -> Self {
        let mut raw = format!("{}{}", method.to_ascii_uppercase(), path);
        if let Some(query) = raw_query.filter(|q| !q.is_empty()) {
            raw.push_str("__");
            raw.push_str(&query.replace('&', "_").replace('=', "-"));
        }
        let mut stem: String = raw
            .replace('/', "_")
            .chars()
            .map(|c| if is_export_char(c) { c } else { '~' })
            .collect();
        if stem.len() > STATIC_EXPORT_MAX_STEM {
            let digest = sha256_hex(stem.as_bytes());
            stem.truncate(STATIC_EXPORT_MAX_STEM - 17);
            stem.push('~');
            stem.push_str(&digest[..16]);
        }
        Self(stem)
    }

    /// Accepts a stem or a `<stem>.json` file name as served by the export route.
    pub fn parse_file_name(input: &str) -> Result<Self, ValidationError> {
        let stem = input.strip_suffix(".json").unwrap_or(input);
        if stem.is_empty()
            || stem.contains("..")
            || !stem.chars().all(|c| is_export_char(c) || c == '~')
        {
            return Err(ValidationError(format!("invalid export file name: {input}")));
        }
        Ok(Self(stem.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn file_name(&self) -> String {
        format!("{}.json", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn version(name: &str) -> DatasetVersion {
        DatasetVersion::from_path(&Path::new("/srv/pickles").join(name))
    }

    #[test]
    fn parameter_order_does_not_change_the_cache_key() {
        let v = version("vat-2024-11-03-14-05-09-000");
        let a = RequestSignature::new("GET", "/x", Some("b=2&a=1"));
        let b = RequestSignature::new("get", "/x", Some("a=1&b=2"));
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "GET:/x:a=1&b=2");
        assert_eq!(CacheKey::derive(&v, &a), CacheKey::derive(&v, &b));
    }

    #[test]
    fn cache_key_depends_on_version_and_signature() {
        let sig = RequestSignature::new("GET", "/api/health/health_distribution", None);
        let v1 = version("vat-2024-11-03-14-05-09-000");
        let v2 = version("vat-2024-11-03-14-20-09-000");
        let k1 = CacheKey::derive(&v1, &sig);
        assert_eq!(k1, CacheKey::derive(&v1, &sig));
        assert_ne!(k1, CacheKey::derive(&v2, &sig));
        let other = RequestSignature::new("GET", "/api/health/largest_perp_positions", None);
        assert_ne!(k1, CacheKey::derive(&v1, &other));
        assert_eq!(CacheKey::parse(k1.as_str()).expect("parse key"), k1);
        assert!(k1.file_name().ends_with(".json"));
    }

    #[test]
    fn cache_key_parse_rejects_path_like_input() {
        assert!(CacheKey::parse("../etc/passwd").is_err());
        assert!(CacheKey::parse(&"A".repeat(64)).is_err());
    }

    #[test]
    fn cache_key_is_pinned_across_builds() {
        let sig = RequestSignature::new(
            "GET",
            "/api/price-shock/usermap",
            Some("asset_group=ignore%2Bstables&oracle_distortion=0.05&n_scenarios=5"),
        );
        assert_eq!(
            CacheKey::derive(&version("vat-2024-11-03-14-05-09-000"), &sig).as_str(),
            "d019f3f5bdde9f3d902ca33546c8483b20285c91663466687c53510b76eae9f5"
        );
    }

    #[test]
    fn static_export_key_keeps_the_request_query_order() {
        let key = StaticExportKey::from_request(
            "GET",
            "/api/price-shock/usermap",
            Some("asset_group=ignore%2Bstables&oracle_distortion=0.05&n_scenarios=5"),
        );
        assert_eq!(
            key.as_str(),
            "GET_api_price-shock_usermap__asset_group-ignore%2Bstables_oracle_distortion-0.05_n_scenarios-5"
        );
        let reordered = StaticExportKey::from_request(
            "GET",
            "/api/asset-liability/matrix",
            Some("perp_market_index=0&mode=0"),
        );
        assert_eq!(
            reordered.as_str(),
            "GET_api_asset-liability_matrix__perp_market_index-0_mode-0"
        );
        assert_eq!(
            StaticExportKey::parse_file_name(&key.file_name()).expect("round trip"),
            key
        );
    }

    #[test]
    fn static_export_key_without_query_has_no_separator() {
        assert_eq!(
            StaticExportKey::from_request("get", "/api/metadata", Some("")).as_str(),
            "GET_api_metadata"
        );
        assert_eq!(
            StaticExportKey::from_request("GET", "/api/metadata", None).as_str(),
            "GET_api_metadata"
        );
    }

    #[test]
    fn unsafe_export_characters_become_tildes() {
        let key = StaticExportKey::from_request("GET", "/api/x", Some("q=a b*c"));
        assert_eq!(key.as_str(), "GET_api_x__q-a~b~c");
    }

    #[test]
    fn long_static_export_keys_are_bounded() {
        let query = format!("q={}", "x".repeat(400));
        let key = StaticExportKey::from_request("GET", "/api/scan", Some(&query));
        assert_eq!(key.as_str().len(), 180);
        assert_ne!(
            key,
            StaticExportKey::from_request("GET", "/api/scan", Some(&format!("q={}", "y".repeat(400))))
        );
    }

    proptest::proptest! {
        #[test]
        fn shuffled_parameters_share_one_key(
            params in proptest::collection::btree_map("[a-z_]{1,10}", "[0-9a-z.]{0,6}", 0..6),
        ) {
            let forward: Vec<String> = params.iter().map(|(k, v)| format!("{k}={v}")).collect();
            let backward: Vec<String> = forward.iter().rev().cloned().collect();
            let v = version("vat-2024-11-03-14-05-09-000");
            let a = RequestSignature::new("GET", "/api/pnl/top_makers", Some(&forward.join("&")));
            let b = RequestSignature::new("GET", "/api/pnl/top_makers", Some(&backward.join("&")));
            proptest::prop_assert_eq!(CacheKey::derive(&v, &a), CacheKey::derive(&v, &b));
        }
    }

    #[test]
    fn export_file_names_cannot_escape_the_mirror() {
        assert!(StaticExportKey::parse_file_name("../cache/x.json").is_err());
        assert!(StaticExportKey::parse_file_name("a/b.json").is_err());
        assert!(StaticExportKey::parse_file_name(".json").is_err());
    }
}
