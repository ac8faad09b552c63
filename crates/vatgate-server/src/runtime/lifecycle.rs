// SPDX-License-Identifier: Apache-2.0

use crate::config::{LifecycleConfig, StorageLayout};
use crate::dataset::{DatasetHandle, LoadedDataset};
use crate::source::DatasetSource;
use crate::telemetry::ServerMetrics;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use vatgate_model::DatasetVersion;
use vatgate_store::{
    plan_retention, ResponseCache, SnapshotStore, StaticExportMirror, StoreError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CapturePhase {
    #[default]
    Idle,
    Capturing,
    Validating,
    Swapped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    Capture(String),
    Validation(String),
    Store(String),
    /// The job's previous run is still executing.
    Busy(&'static str),
}

impl std::fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Capture(msg) => write!(f, "capture failed: {msg}"),
            Self::Validation(msg) => write!(f, "validation failed: {msg}"),
            Self::Store(msg) => write!(f, "snapshot store error: {msg}"),
            Self::Busy(job) => write!(f, "{job} already running"),
        }
    }
}
impl std::error::Error for LifecycleError {}

impl From<StoreError> for LifecycleError {
    fn from(e: StoreError) -> Self {
        Self::Store(e.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub live_version: Option<DatasetVersion>,
    pub incomplete_removed: Vec<String>,
    pub expired_removed: Vec<String>,
    pub cache_files_removed: usize,
    pub export_files_removed: usize,
    pub failures: Vec<String>,
}

impl CleanupReport {
    #[must_use]
    pub fn bundles_removed(&self) -> usize {
        self.incomplete_removed.len() + self.expired_removed.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobOutcome {
    pub finished_at: String,
    pub ok: bool,
    pub detail: String,
}

impl JobOutcome {
    fn now(ok: bool, detail: String) -> Self {
        Self {
            finished_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            ok,
            detail,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LifecycleStatus {
    pub phase: CapturePhase,
    pub last_capture: Option<JobOutcome>,
    pub last_cleanup: Option<JobOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BundleSummary {
    pub name: String,
    pub complete: bool,
    pub missing: Vec<String>,
    pub live: bool,
}

struct RunningFlag<'a>(&'a AtomicBool);

impl Drop for RunningFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn claim(flag: &AtomicBool) -> Option<RunningFlag<'_>> {
    flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .ok()
        .map(|_| RunningFlag(flag))
}

/// Periodic capture, hot-swap into the live dataset, and retention cleanup.
/// Capture, cleanup and disk reloads hold one maintenance lock, so cleanup
/// never sees a half-written bundle from an in-process capture.
pub struct SnapshotLifecycleManager<S: DatasetSource> {
    cfg: LifecycleConfig,
    source: Arc<S>,
    required: Vec<String>,
    store: SnapshotStore,
    cache: ResponseCache,
    exports: StaticExportMirror,
    dataset: DatasetHandle<S::Dataset>,
    metrics: Arc<ServerMetrics>,
    maintenance: Mutex<()>,
    capture_running: AtomicBool,
    cleanup_running: AtomicBool,
    status: StdMutex<LifecycleStatus>,
}

impl<S: DatasetSource> SnapshotLifecycleManager<S> {
    #[must_use]
    pub fn new(
        cfg: LifecycleConfig,
        storage: &StorageLayout,
        source: Arc<S>,
        dataset: DatasetHandle<S::Dataset>,
        metrics: Arc<ServerMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            required: source.required_members(),
            source,
            store: storage.snapshot_store(),
            cache: storage.response_cache(),
            exports: storage.export_mirror(),
            dataset,
            metrics,
            maintenance: Mutex::new(()),
            capture_running: AtomicBool::new(false),
            cleanup_running: AtomicBool::new(false),
            status: StdMutex::new(LifecycleStatus::default()),
        })
    }

    #[must_use]
    pub fn status(&self) -> LifecycleStatus {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn phase(&self) -> CapturePhase {
        self.status().phase
    }

    #[must_use]
    pub fn is_capture_running(&self) -> bool {
        self.capture_running.load(Ordering::Acquire)
    }

    fn update_status(&self, f: impl FnOnce(&mut LifecycleStatus)) {
        f(&mut self.status.lock().unwrap_or_else(PoisonError::into_inner));
    }

    fn set_phase(&self, phase: CapturePhase) {
        debug!(phase = ?phase, "capture phase");
        self.update_status(|s| s.phase = phase);
    }

    /// Captures a new bundle, validates it by loading it, and swaps it in.
    /// On any failure the new directory is removed and the current dataset
    /// stays authoritative.
    pub async fn capture_cycle(&self) -> Result<DatasetVersion, LifecycleError> {
        let Some(_running) = claim(&self.capture_running) else {
            return Err(LifecycleError::Busy("capture"));
        };
        let _maintenance = self.maintenance.lock().await;
        let result = self.capture_and_swap().await;
        self.set_phase(CapturePhase::Idle);
        match &result {
            Ok(version) => {
                ServerMetrics::incr(&self.metrics.captures_succeeded);
                info!(version = %version, "capture cycle completed");
                self.update_status(|s| {
                    s.last_capture = Some(JobOutcome::now(true, version.to_string()));
                });
            }
            Err(e) => {
                ServerMetrics::incr(&self.metrics.captures_failed);
                error!(error = %e, "capture cycle failed");
                self.update_status(|s| s.last_capture = Some(JobOutcome::now(false, e.to_string())));
            }
        }
        result
    }

    async fn capture_and_swap(&self) -> Result<DatasetVersion, LifecycleError> {
        self.set_phase(CapturePhase::Capturing);
        let dir = self.store.create_bundle_dir(Utc::now())?;
        let captured = match tokio::time::timeout(self.cfg.capture_timeout, self.source.capture(&dir))
            .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(LifecycleError::Capture(e.to_string())),
            Err(_) => Err(LifecycleError::Capture(format!(
                "timed out after {:?}",
                self.cfg.capture_timeout
            ))),
        };
        if let Err(e) = captured {
            self.discard(&dir);
            return Err(e);
        }

        self.set_phase(CapturePhase::Validating);
        let loaded = match self.validate(&dir).await {
            Ok(loaded) => loaded,
            Err(e) => {
                self.discard(&dir);
                return Err(e);
            }
        };

        self.set_phase(CapturePhase::Swapped);
        let version = loaded.version.clone();
        let previous = self.dataset.publish(loaded);
        ServerMetrics::incr(&self.metrics.dataset_swaps);
        info!(
            version = %version,
            previous = %previous.map(|v| v.to_string()).unwrap_or_default(),
            "dataset swapped"
        );
        Ok(version)
    }

    async fn validate(&self, dir: &Path) -> Result<LoadedDataset<S::Dataset>, LifecycleError> {
        let bundle = self.store.inspect(dir)?;
        let completeness = bundle.completeness(&self.required);
        if !completeness.is_complete() {
            return Err(LifecycleError::Validation(format!(
                "bundle {} is missing members: {}",
                bundle.name,
                completeness.missing.join(",")
            )));
        }
        LoadedDataset::from_bundle(self.source.as_ref(), &bundle)
            .await
            .map_err(|e| LifecycleError::Validation(e.to_string()))
    }

    fn discard(&self, dir: &Path) {
        match self.store.delete_dir(dir) {
            Ok(()) => info!(dir = %dir.display(), "discarded captured bundle"),
            Err(e) => warn!(dir = %dir.display(), error = %e, "failed to discard captured bundle"),
        }
    }

    /// One retention pass. The live version is read once, up front, and every
    /// deletion candidate is checked against that value.
    pub async fn cleanup_pass(&self) -> Result<CleanupReport, LifecycleError> {
        let Some(_running) = claim(&self.cleanup_running) else {
            return Err(LifecycleError::Busy("cleanup"));
        };
        let _maintenance = self.maintenance.lock().await;
        let result = self.cleanup_locked();
        ServerMetrics::incr(&self.metrics.cleanup_passes);
        match &result {
            Ok(report) => {
                ServerMetrics::add(&self.metrics.bundles_deleted, report.bundles_removed());
                ServerMetrics::add(
                    &self.metrics.cache_files_pruned,
                    report.cache_files_removed + report.export_files_removed,
                );
                info!(
                    incomplete = report.incomplete_removed.len(),
                    expired = report.expired_removed.len(),
                    cache_files = report.cache_files_removed,
                    export_files = report.export_files_removed,
                    failures = report.failures.len(),
                    "cleanup pass finished"
                );
                let detail = format!(
                    "removed {} bundles, {} cache files, {} export files",
                    report.bundles_removed(),
                    report.cache_files_removed,
                    report.export_files_removed
                );
                let ok = report.failures.is_empty();
                self.update_status(|s| s.last_cleanup = Some(JobOutcome::now(ok, detail)));
            }
            Err(e) => {
                error!(error = %e, "cleanup pass failed");
                self.update_status(|s| s.last_cleanup = Some(JobOutcome::now(false, e.to_string())));
            }
        }
        result
    }

    fn cleanup_locked(&self) -> Result<CleanupReport, LifecycleError> {
        let live = self.dataset.version();
        let bundles = self.store.list()?;
        let plan = plan_retention(
            &bundles,
            &self.required,
            self.cfg.retained_bundles,
            live.as_ref(),
        );
        let mut report = CleanupReport {
            live_version: live,
            ..CleanupReport::default()
        };
        for bundle in &plan.incomplete {
            match self.store.delete(bundle) {
                Ok(()) => report.incomplete_removed.push(bundle.name.to_string()),
                Err(e) => report.failures.push(format!("{}: {e}", bundle.name)),
            }
        }
        for bundle in &plan.expired {
            match self.store.delete(bundle) {
                Ok(()) => report.expired_removed.push(bundle.name.to_string()),
                Err(e) => report.failures.push(format!("{}: {e}", bundle.name)),
            }
        }
        match self.cache.prune(self.cfg.max_cache_files) {
            Ok(n) => report.cache_files_removed = n,
            Err(e) => report.failures.push(format!("response cache: {e}")),
        }
        match self.exports.prune(self.cfg.max_export_files) {
            Ok(n) => report.export_files_removed = n,
            Err(e) => report.failures.push(format!("static exports: {e}")),
        }
        for failure in &report.failures {
            warn!(failure = %failure, "cleanup step failed");
        }
        Ok(report)
    }

    /// Cold start: newest loadable bundle on disk, else the live upstream
    /// plus an immediate capture.
    pub async fn bootstrap(&self) -> Result<DatasetVersion, LifecycleError> {
        if let Some(version) = self.load_newest_from_disk().await? {
            return Ok(version);
        }
        match self.source.bootstrap().await {
            Ok(Some(data)) => {
                self.dataset.publish(LoadedDataset::bootstrap(data));
                info!(source = self.source.source_tag(), "serving live upstream dataset until first capture");
            }
            Ok(None) => info!("no usable bundle on disk; capturing before serving"),
            Err(e) => warn!(error = %e, "live upstream bootstrap failed"),
        }
        match self.capture_cycle().await {
            Ok(version) => Ok(version),
            Err(e) => match self.dataset.version() {
                Some(version) => {
                    warn!(error = %e, "initial capture failed; keeping bootstrap dataset");
                    Ok(version)
                }
                None => Err(e),
            },
        }
    }

    async fn load_newest_from_disk(&self) -> Result<Option<DatasetVersion>, LifecycleError> {
        let _maintenance = self.maintenance.lock().await;
        for bundle in self.store.complete_newest_first(&self.required)? {
            match self.dataset.load(self.source.as_ref(), &bundle).await {
                Ok(version) => {
                    ServerMetrics::incr(&self.metrics.dataset_swaps);
                    info!(version = %version, "loaded bundle from disk");
                    return Ok(Some(version));
                }
                Err(e) => {
                    warn!(bundle = %bundle.name, error = %e, "bundle failed to load; trying an older one");
                }
            }
        }
        Ok(None)
    }

    /// Loads the newest complete bundle on disk when it is not the live one.
    /// Picks up bundles written by a capture process outside this server.
    pub async fn sync_to_newest(&self) -> Result<Option<DatasetVersion>, LifecycleError> {
        let _maintenance = self.maintenance.lock().await;
        let Some(newest) = self.store.newest_complete(&self.required)? else {
            return Ok(None);
        };
        let version = newest.version();
        if self.dataset.version().as_ref() == Some(&version) {
            return Ok(None);
        }
        self.dataset
            .load(self.source.as_ref(), &newest)
            .await
            .map_err(|e| LifecycleError::Validation(format!("{}: {e}", newest.name)))?;
        ServerMetrics::incr(&self.metrics.dataset_swaps);
        info!(version = %version, "watcher swapped in newer bundle");
        Ok(Some(version))
    }

    /// Spawns a capture cycle unless one is already running.
    pub fn trigger_capture(self: &Arc<Self>) -> bool {
        if self.is_capture_running() {
            return false;
        }
        let me = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(LifecycleError::Busy(job)) = me.capture_cycle().await {
                debug!(job, "manual capture skipped");
            }
        });
        true
    }

    pub fn bundle_summaries(&self) -> Result<Vec<BundleSummary>, LifecycleError> {
        let live = self.dataset.version();
        Ok(self
            .store
            .list()?
            .iter()
            .map(|b| {
                let completeness = b.completeness(&self.required);
                BundleSummary {
                    name: b.name.to_string(),
                    complete: completeness.is_complete(),
                    missing: completeness.missing,
                    live: live.as_ref() == Some(&b.version()),
                }
            })
            .collect())
    }

    /// Capture and cleanup timers, plus the watcher when enabled. The first
    /// tick of each fires one full interval after start.
    pub fn spawn_background_tasks(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::new();

        let me = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            let period = me.cfg.capture_interval;
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if let Err(LifecycleError::Busy(job)) = me.capture_cycle().await {
                    debug!(job, "previous run still executing; tick skipped");
                }
            }
        }));

        let me = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            let period = me.cfg.cleanup_interval;
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if let Err(LifecycleError::Busy(job)) = me.cleanup_pass().await {
                    debug!(job, "previous run still executing; tick skipped");
                }
            }
        }));

        if !self.cfg.watch_interval.is_zero() {
            let me = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                let period = me.cfg.watch_interval;
                let mut interval = tokio::time::interval_at(Instant::now() + period, period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    interval.tick().await;
                    if let Err(e) = me.sync_to_newest().await {
                        error!("snapshot watcher error: {e}");
                    }
                }
            }));
        }
        tasks
    }
}
