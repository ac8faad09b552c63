// SPDX-License-Identifier: Apache-2.0

use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use vatgate_store::{ResponseCache, SnapshotStore, StaticExportMirror};

/// Members every captured bundle must contain before it can be loaded.
pub const DEFAULT_REQUIRED_MEMBERS: &[&str] = &[
    "perp",
    "perporacles",
    "spot",
    "spotoracles",
    "usermap",
    "userstats",
];

pub const DEFAULT_UNCACHEABLE_PREFIXES: &[&str] = &["/api/health/spot_asset_value/"];

/// Prefixes under the cacheable root that are served by the gateway itself.
pub const GATEWAY_PREFIXES: &[&str] = &["/api/ucache", "/api/snapshot"];

#[derive(Debug, Clone, Serialize)]
pub struct StorageLayout {
    pub snapshot_root: PathBuf,
    pub cache_root: PathBuf,
    pub export_root: PathBuf,
}

impl Default for StorageLayout {
    fn default() -> Self {
        Self {
            snapshot_root: PathBuf::from("pickles"),
            cache_root: PathBuf::from("cache"),
            export_root: PathBuf::from("ucache"),
        }
    }
}

impl StorageLayout {
    /// All three roots below one directory; used by tests and local runs.
    #[must_use]
    pub fn under(base: impl Into<PathBuf>) -> Self {
        let base = base.into();
        Self {
            snapshot_root: base.join("pickles"),
            cache_root: base.join("cache"),
            export_root: base.join("ucache"),
        }
    }

    #[must_use]
    pub fn snapshot_store(&self) -> SnapshotStore {
        SnapshotStore::new(&self.snapshot_root)
    }

    #[must_use]
    pub fn response_cache(&self) -> ResponseCache {
        ResponseCache::new(&self.cache_root)
    }

    #[must_use]
    pub fn export_mirror(&self) -> StaticExportMirror {
        StaticExportMirror::new(&self.export_root)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LifecycleConfig {
    pub capture_interval: Duration,
    pub capture_timeout: Duration,
    pub cleanup_interval: Duration,
    /// Zero disables the watcher.
    pub watch_interval: Duration,
    pub retained_bundles: usize,
    pub max_cache_files: usize,
    pub max_export_files: usize,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            capture_interval: Duration::from_secs(15 * 60),
            capture_timeout: Duration::from_secs(10 * 60),
            cleanup_interval: Duration::from_secs(8 * 60),
            watch_interval: Duration::ZERO,
            retained_bundles: 5,
            max_cache_files: 35,
            max_export_files: 35,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorConfig {
    pub cacheable_prefix: String,
    pub uncacheable_prefixes: Vec<String>,
    pub stale_lookback: usize,
    pub revalidation_timeout: Duration,
    pub max_body_bytes: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            cacheable_prefix: "/api".to_string(),
            uncacheable_prefixes: DEFAULT_UNCACHEABLE_PREFIXES
                .iter()
                .map(ToString::to_string)
                .collect(),
            stale_lookback: 4,
            revalidation_timeout: Duration::from_secs(300),
            max_body_bytes: 64 * 1024 * 1024,
        }
    }
}

impl CoordinatorConfig {
    /// Whether a request path takes part in the fresh/stale/miss protocol.
    #[must_use]
    pub fn is_cacheable_path(&self, path: &str) -> bool {
        if !has_path_prefix(path, &self.cacheable_prefix) {
            return false;
        }
        if GATEWAY_PREFIXES.iter().any(|p| has_path_prefix(path, p)) {
            return false;
        }
        !self
            .uncacheable_prefixes
            .iter()
            .any(|p| path.starts_with(p.as_str()))
    }
}

fn has_path_prefix(path: &str, prefix: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || prefix.ends_with('/'),
        None => false,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub log_json: bool,
    pub required_members: Vec<String>,
    pub capture_command: Option<String>,
    pub storage: StorageLayout,
    pub lifecycle: LifecycleConfig,
    pub coordinator: CoordinatorConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            log_json: true,
            required_members: DEFAULT_REQUIRED_MEMBERS
                .iter()
                .map(ToString::to_string)
                .collect(),
            capture_command: None,
            storage: StorageLayout::default(),
            lifecycle: LifecycleConfig::default(),
            coordinator: CoordinatorConfig::default(),
        }
    }
}

impl ServerConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the config from `VATGATE_*` variables resolved through `lookup`;
    /// unset or unparsable values fall back to the defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup };
        let defaults = Self::default();
        let lifecycle = LifecycleConfig {
            capture_interval: env.duration_ms(
                "VATGATE_CAPTURE_INTERVAL_MS",
                defaults.lifecycle.capture_interval,
            ),
            capture_timeout: env.duration_ms(
                "VATGATE_CAPTURE_TIMEOUT_MS",
                defaults.lifecycle.capture_timeout,
            ),
            cleanup_interval: env.duration_ms(
                "VATGATE_CLEANUP_INTERVAL_MS",
                defaults.lifecycle.cleanup_interval,
            ),
            watch_interval: env.duration_ms(
                "VATGATE_WATCH_INTERVAL_MS",
                defaults.lifecycle.watch_interval,
            ),
            retained_bundles: env.usize(
                "VATGATE_RETAINED_BUNDLES",
                defaults.lifecycle.retained_bundles,
            ),
            max_cache_files: env.usize("VATGATE_MAX_CACHE_FILES", defaults.lifecycle.max_cache_files),
            max_export_files: env.usize(
                "VATGATE_MAX_EXPORT_FILES",
                defaults.lifecycle.max_export_files,
            ),
        };
        let coordinator = CoordinatorConfig {
            uncacheable_prefixes: env
                .list("VATGATE_UNCACHEABLE_PREFIXES")
                .unwrap_or(defaults.coordinator.uncacheable_prefixes),
            stale_lookback: env.usize("VATGATE_STALE_LOOKBACK", defaults.coordinator.stale_lookback),
            revalidation_timeout: env.duration_ms(
                "VATGATE_REVALIDATION_TIMEOUT_MS",
                defaults.coordinator.revalidation_timeout,
            ),
            max_body_bytes: env.usize("VATGATE_MAX_BODY_BYTES", defaults.coordinator.max_body_bytes),
            ..defaults.coordinator
        };
        Self {
            bind_addr: env.string("VATGATE_BIND").unwrap_or(defaults.bind_addr),
            log_json: env.bool("VATGATE_LOG_JSON", defaults.log_json),
            required_members: env
                .list("VATGATE_REQUIRED_MEMBERS")
                .unwrap_or(defaults.required_members),
            capture_command: env.string("VATGATE_CAPTURE_COMMAND"),
            storage: StorageLayout {
                snapshot_root: env
                    .string("VATGATE_SNAPSHOT_ROOT")
                    .map_or(defaults.storage.snapshot_root, PathBuf::from),
                cache_root: env
                    .string("VATGATE_CACHE_ROOT")
                    .map_or(defaults.storage.cache_root, PathBuf::from),
                export_root: env
                    .string("VATGATE_EXPORT_ROOT")
                    .map_or(defaults.storage.export_root, PathBuf::from),
            },
            lifecycle,
            coordinator,
        }
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn bool(&self, name: &str, default: bool) -> bool {
        self.string(name)
            .and_then(|v| match v.as_str() {
                "1" | "true" | "TRUE" | "yes" | "YES" => Some(true),
                "0" | "false" | "FALSE" | "no" | "NO" => Some(false),
                _ => None,
            })
            .unwrap_or(default)
    }

    fn u64(&self, name: &str, default: u64) -> u64 {
        self.string(name)
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(default)
    }

    fn usize(&self, name: &str, default: usize) -> usize {
        self.string(name)
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(default)
    }

    fn duration_ms(&self, name: &str, default: Duration) -> Duration {
        let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(self.u64(name, default_ms))
    }

    fn list(&self, name: &str) -> Option<Vec<String>> {
        self.string(name).map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string)
                .collect()
        })
    }
}

pub fn validate_startup_config(cfg: &ServerConfig) -> Result<(), String> {
    let lc = &cfg.lifecycle;
    if lc.capture_interval.is_zero() || lc.cleanup_interval.is_zero() {
        return Err("capture and cleanup intervals must be > 0".to_string());
    }
    if lc.capture_timeout.is_zero() || cfg.coordinator.revalidation_timeout.is_zero() {
        return Err("timeouts must be > 0".to_string());
    }
    if lc.retained_bundles == 0 || lc.max_cache_files == 0 || lc.max_export_files == 0 {
        return Err("retention caps must be > 0".to_string());
    }
    if cfg.coordinator.stale_lookback > lc.retained_bundles {
        return Err(format!(
            "stale lookback ({}) cannot exceed retained bundles ({})",
            cfg.coordinator.stale_lookback, lc.retained_bundles
        ));
    }
    if cfg.coordinator.max_body_bytes == 0 {
        return Err("max body bytes must be > 0".to_string());
    }
    if cfg.required_members.is_empty() {
        return Err("at least one required member must be configured".to_string());
    }
    if !cfg.coordinator.cacheable_prefix.starts_with('/') {
        return Err("cacheable prefix must start with '/'".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_pass_validation() {
        let cfg = ServerConfig::from_lookup(lookup(&[]));
        assert_eq!(cfg.bind_addr, "0.0.0.0:8080");
        assert_eq!(cfg.lifecycle.retained_bundles, 5);
        assert_eq!(cfg.coordinator.stale_lookback, 4);
        assert_eq!(cfg.required_members.len(), 6);
        assert!(cfg.capture_command.is_none());
        validate_startup_config(&cfg).expect("defaults are valid");
    }

    #[test]
    fn env_values_override_defaults() {
        let cfg = ServerConfig::from_lookup(lookup(&[
            ("VATGATE_BIND", "127.0.0.1:9000"),
            ("VATGATE_CAPTURE_INTERVAL_MS", "1000"),
            ("VATGATE_REQUIRED_MEMBERS", "perp, spot,,usermap"),
            ("VATGATE_LOG_JSON", "false"),
            ("VATGATE_SNAPSHOT_ROOT", "/data/pickles"),
            ("VATGATE_STALE_LOOKBACK", "not-a-number"),
        ]));
        assert_eq!(cfg.bind_addr, "127.0.0.1:9000");
        assert_eq!(cfg.lifecycle.capture_interval, Duration::from_secs(1));
        assert_eq!(cfg.required_members, vec!["perp", "spot", "usermap"]);
        assert!(!cfg.log_json);
        assert_eq!(cfg.storage.snapshot_root, PathBuf::from("/data/pickles"));
        assert_eq!(cfg.coordinator.stale_lookback, 4);
    }

    #[test]
    fn lookback_beyond_retention_is_rejected() {
        let cfg = ServerConfig::from_lookup(lookup(&[
            ("VATGATE_RETAINED_BUNDLES", "3"),
            ("VATGATE_STALE_LOOKBACK", "4"),
        ]));
        let err = validate_startup_config(&cfg).expect_err("K > N");
        assert!(err.contains("stale lookback"));
    }

    #[test]
    fn zero_intervals_are_rejected() {
        let cfg = ServerConfig::from_lookup(lookup(&[("VATGATE_CLEANUP_INTERVAL_MS", "0")]));
        assert!(validate_startup_config(&cfg).is_err());
    }

    #[test]
    fn cacheable_paths_exclude_gateway_and_configured_prefixes() {
        let cfg = CoordinatorConfig::default();
        assert!(cfg.is_cacheable_path("/api/health/health_distribution"));
        assert!(cfg.is_cacheable_path("/api"));
        assert!(!cfg.is_cacheable_path("/apix/thing"));
        assert!(!cfg.is_cacheable_path("/health"));
        assert!(!cfg.is_cacheable_path("/api/ucache/GET_api_x.json"));
        assert!(!cfg.is_cacheable_path("/api/snapshot/pickle"));
        assert!(!cfg.is_cacheable_path("/api/health/spot_asset_value/3"));
        assert!(cfg.is_cacheable_path("/api/health/spot_asset_values"));
    }
}
