// SPDX-License-Identifier: Apache-2.0

use crate::cache::locks::RevalidationLockTable;
use crate::config::{CoordinatorConfig, StorageLayout};
use crate::dataset::DatasetHandle;
use crate::source::DatasetSource;
use crate::telemetry::ServerMetrics;
use crate::AppState;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Router;
use std::future::Future;
use std::sync::Arc;
use tower::ServiceExt;
use tracing::{debug, error, info, warn, Instrument};
use vatgate_model::{
    CacheEntry, CacheKey, CacheStatus, DatasetVersion, RequestSignature, StaticExport,
    StaticExportKey, CACHE_STATUS_HEADER, MISS_BODY,
};
use vatgate_store::{ResponseCache, SnapshotStore, StaticExportMirror};

/// Result of resolving a request signature against the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Fresh(CacheEntry),
    Stale {
        entry: CacheEntry,
        from: DatasetVersion,
    },
    Miss,
}

impl Lookup {
    #[must_use]
    pub fn status(&self) -> CacheStatus {
        match self {
            Self::Fresh(_) => CacheStatus::Fresh,
            Self::Stale { .. } => CacheStatus::Stale,
            Self::Miss => CacheStatus::Miss,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevalidationOutcome {
    Persisted,
    /// Another task holds the lock for this key.
    InFlight,
    /// An entry for the key appeared before the handler ran.
    AlreadyCached,
    /// The live dataset moved on; the result would be mislabelled.
    Discarded,
    Failed(String),
}

/// Outcome of a bulk static-export run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WarmReport {
    /// Export file names written, in target order.
    pub written: Vec<String>,
    /// `(target, reason)` for every target that produced no export.
    pub failed: Vec<(String, String)>,
}

impl WarmReport {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Fresh/stale/miss protocol over the response cache, with detached
/// per-key revalidation.
pub struct CacheCoordinator {
    cfg: CoordinatorConfig,
    snapshots: SnapshotStore,
    cache: ResponseCache,
    exports: StaticExportMirror,
    locks: RevalidationLockTable,
    metrics: Arc<ServerMetrics>,
}

impl CacheCoordinator {
    #[must_use]
    pub fn new(cfg: CoordinatorConfig, storage: &StorageLayout, metrics: Arc<ServerMetrics>) -> Self {
        Self {
            cfg,
            snapshots: storage.snapshot_store(),
            cache: storage.response_cache(),
            exports: storage.export_mirror(),
            locks: RevalidationLockTable::new(),
            metrics,
        }
    }

    #[must_use]
    pub fn config(&self) -> &CoordinatorConfig {
        &self.cfg
    }

    #[must_use]
    pub fn locks(&self) -> &RevalidationLockTable {
        &self.locks
    }

    #[must_use]
    pub fn response_cache(&self) -> &ResponseCache {
        &self.cache
    }

    #[must_use]
    pub fn export_mirror(&self) -> &StaticExportMirror {
        &self.exports
    }

    fn read_entry(&self, key: &CacheKey) -> Option<CacheEntry> {
        match self.cache.read(key) {
            Ok(entry) => entry,
            Err(e) => {
                ServerMetrics::incr(&self.metrics.corrupt_entries);
                warn!(key = %key, error = %e, "ignoring unreadable cache entry");
                None
            }
        }
    }

    pub fn lookup(&self, current: &DatasetVersion, signature: &RequestSignature) -> Lookup {
        if let Some(entry) = self.read_entry(&CacheKey::derive(current, signature)) {
            return Lookup::Fresh(entry);
        }
        let previous = match self
            .snapshots
            .previous_versions(current, self.cfg.stale_lookback)
        {
            Ok(previous) => previous,
            Err(e) => {
                warn!(error = %e, "listing snapshot bundles for stale lookup failed");
                Vec::new()
            }
        };
        for version in previous {
            if let Some(entry) = self.read_entry(&CacheKey::derive(&version, signature)) {
                return Lookup::Stale {
                    entry,
                    from: version,
                };
            }
        }
        Lookup::Miss
    }

    /// Recomputes the entry for (`scheduled`, `signature`) by awaiting `run`,
    /// at most once concurrently per key. Nothing is written unless the
    /// handler answers 200 and `scheduled` is still live afterwards.
    pub async fn revalidate<D, F, Fut>(
        &self,
        dataset: &DatasetHandle<D>,
        scheduled: &DatasetVersion,
        signature: &RequestSignature,
        export: &StaticExportKey,
        run: F,
    ) -> RevalidationOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Response>,
    {
        let key = CacheKey::derive(scheduled, signature);
        let Some(_guard) = self.locks.try_acquire(&key) else {
            ServerMetrics::incr(&self.metrics.revalidations_skipped);
            debug!(key = %key, "revalidation already in flight");
            return RevalidationOutcome::InFlight;
        };
        if self.read_entry(&key).is_some() {
            ServerMetrics::incr(&self.metrics.revalidations_skipped);
            return RevalidationOutcome::AlreadyCached;
        }
        if dataset.version().as_ref() != Some(scheduled) {
            ServerMetrics::incr(&self.metrics.revalidations_discarded);
            return RevalidationOutcome::Discarded;
        }
        ServerMetrics::incr(&self.metrics.revalidations_started);

        let outcome = self.run_and_persist(dataset, scheduled, &key, export, run).await;
        match &outcome {
            RevalidationOutcome::Persisted => {
                ServerMetrics::incr(&self.metrics.revalidations_persisted);
            }
            RevalidationOutcome::Discarded => {
                ServerMetrics::incr(&self.metrics.revalidations_discarded);
                debug!(key = %key, "dataset swapped during revalidation; result discarded");
            }
            RevalidationOutcome::Failed(reason) => {
                ServerMetrics::incr(&self.metrics.revalidations_failed);
                warn!(key = %key, signature = %signature, reason = %reason, "revalidation failed");
            }
            RevalidationOutcome::InFlight | RevalidationOutcome::AlreadyCached => {}
        }
        outcome
    }

    async fn run_and_persist<D, F, Fut>(
        &self,
        dataset: &DatasetHandle<D>,
        scheduled: &DatasetVersion,
        key: &CacheKey,
        export: &StaticExportKey,
        run: F,
    ) -> RevalidationOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Response>,
    {
        let response = match tokio::time::timeout(self.cfg.revalidation_timeout, run()).await {
            Ok(response) => response,
            Err(_) => {
                return RevalidationOutcome::Failed(format!(
                    "handler timed out after {:?}",
                    self.cfg.revalidation_timeout
                ))
            }
        };
        let entry = match self.capture_entry(response).await {
            Ok(entry) => entry,
            Err(reason) => return RevalidationOutcome::Failed(reason),
        };
        if dataset.version().as_ref() != Some(scheduled) {
            return RevalidationOutcome::Discarded;
        }
        if let Err(e) = self.cache.write(key, &entry) {
            return RevalidationOutcome::Failed(format!("writing cache entry: {e}"));
        }
        match StaticExport::from_entry(&entry) {
            Ok(content) => {
                if let Err(e) = self.exports.write(export, &content) {
                    warn!(export = %export.as_str(), error = %e, "writing static export failed");
                }
            }
            Err(e) => debug!(export = %export.as_str(), error = %e, "body is not json; no static export"),
        }
        RevalidationOutcome::Persisted
    }

    /// Turns a 200 handler response into a storable entry.
    async fn capture_entry(&self, response: Response) -> Result<CacheEntry, String> {
        if response.status() != StatusCode::OK {
            return Err(format!("handler returned {}", response.status()));
        }
        let (parts, body) = response.into_parts();
        let bytes = axum::body::to_bytes(body, self.cfg.max_body_bytes)
            .await
            .map_err(|e| format!("reading body: {e}"))?;
        let body = String::from_utf8(bytes.to_vec()).map_err(|_| "body is not utf-8".to_string())?;
        let headers = parts.headers.iter().filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        });
        Ok(CacheEntry::from_response_parts(
            StatusCode::OK.as_u16(),
            headers,
            body,
        ))
    }

    /// Runs `app` for every target path against the live dataset and
    /// persists both the cache entry and the static export. Waits for any
    /// in-flight revalidation of the same key instead of skipping it.
    pub async fn warm_exports<D>(
        &self,
        dataset: &DatasetHandle<D>,
        app: Router,
        targets: &[String],
    ) -> WarmReport {
        let mut report = WarmReport::default();
        for target in targets {
            match self.warm_one(dataset, app.clone(), target).await {
                Ok(export) => {
                    info!(target = %target, export = %export.as_str(), "static export written");
                    report.written.push(export.file_name());
                }
                Err(reason) => {
                    warn!(target = %target, reason = %reason, "static export skipped");
                    report.failed.push((target.clone(), reason));
                }
            }
        }
        report
    }

    async fn warm_one<D>(
        &self,
        dataset: &DatasetHandle<D>,
        app: Router,
        target: &str,
    ) -> Result<StaticExportKey, String> {
        let uri: Uri = target
            .parse()
            .map_err(|e| format!("invalid target {target}: {e}"))?;
        if !self.cfg.is_cacheable_path(uri.path()) {
            return Err(format!("{} is not a cacheable path", uri.path()));
        }
        let version = dataset
            .version()
            .ok_or_else(|| "no dataset loaded".to_string())?;
        let signature = RequestSignature::new(Method::GET.as_str(), uri.path(), uri.query());
        let key = CacheKey::derive(&version, &signature);
        let export = StaticExportKey::from_request(Method::GET.as_str(), uri.path(), uri.query());

        let _guard = self.locks.acquire(&key).await;
        let request = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Body::empty())
            .map_err(|e| format!("building request: {e}"))?;
        let response = match tokio::time::timeout(self.cfg.revalidation_timeout, app.oneshot(request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(never)) => match never {},
            Err(_) => {
                return Err(format!(
                    "handler timed out after {:?}",
                    self.cfg.revalidation_timeout
                ))
            }
        };
        let entry = self.capture_entry(response).await?;
        let content = StaticExport::from_entry(&entry).map_err(|e| format!("body is not json: {e}"))?;
        if dataset.version().as_ref() != Some(&version) {
            return Err("dataset changed while rendering".to_string());
        }
        self.cache
            .write(&key, &entry)
            .map_err(|e| format!("writing cache entry: {e}"))?;
        self.exports
            .write(&export, &content)
            .map_err(|e| format!("writing static export: {e}"))?;
        Ok(export)
    }

    /// Runs revalidation on a detached task; a second task reports panics.
    pub fn spawn_revalidation<D>(
        self: &Arc<Self>,
        dataset: DatasetHandle<D>,
        scheduled: DatasetVersion,
        signature: RequestSignature,
        request: Request,
        next: Next,
    ) where
        D: Send + Sync + 'static,
    {
        let me = Arc::clone(self);
        let export = StaticExportKey::from_request(
            request.method().as_str(),
            request.uri().path(),
            request.uri().query(),
        );
        let span = tracing::info_span!(
            "cache.revalidate",
            key = %CacheKey::derive(&scheduled, &signature),
            signature = %signature,
        );
        let task = tokio::spawn(
            async move {
                me.revalidate(&dataset, &scheduled, &signature, &export, move || {
                    next.run(request)
                })
                    .await
            }
            .instrument(span),
        );
        tokio::spawn(async move {
            if let Err(e) = task.await {
                error!(error = %e, "revalidation task aborted");
            }
        });
    }
}

/// Replays a stored entry, tagging it with `status` when given.
fn entry_response(entry: &CacheEntry, status: Option<CacheStatus>) -> Response {
    let mut response = Response::new(Body::from(entry.body.clone()));
    *response.status_mut() = StatusCode::from_u16(entry.status_code).unwrap_or(StatusCode::OK);
    let headers = response.headers_mut();
    for (name, values) in &entry.headers {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            continue;
        };
        for value in values {
            if let Ok(value) = HeaderValue::from_str(value) {
                headers.append(name.clone(), value);
            }
        }
    }
    if let Some(status) = status {
        headers.insert(CACHE_STATUS_HEADER, HeaderValue::from_static(status.as_str()));
    }
    response
}

fn miss_response() -> Response {
    (
        StatusCode::OK,
        [
            ("content-type", "application/json"),
            (CACHE_STATUS_HEADER, CacheStatus::Miss.as_str()),
        ],
        MISS_BODY,
    )
        .into_response()
}

pub(crate) async fn cache_coordinator_middleware<S: DatasetSource>(
    State(state): State<AppState<S>>,
    request: Request,
    next: Next,
) -> Response {
    let coordinator = &state.coordinator;
    if request.method() != Method::GET
        || !coordinator.config().is_cacheable_path(request.uri().path())
    {
        ServerMetrics::incr(&state.metrics.bypassed_requests);
        return next.run(request).await;
    }
    let Some(current) = state.dataset.version() else {
        return crate::middleware::readiness::not_ready_response();
    };
    let signature = RequestSignature::new(
        request.method().as_str(),
        request.uri().path(),
        request.uri().query(),
    );
    let lookup = coordinator.lookup(&current, &signature);
    state.metrics.record_status(lookup.status());
    match lookup {
        Lookup::Fresh(entry) => entry_response(&entry, Some(CacheStatus::Fresh)),
        Lookup::Stale { entry, from } => {
            debug!(signature = %signature, from = %from, "serving stale entry");
            coordinator.spawn_revalidation(
                state.dataset.clone(),
                current,
                signature,
                request,
                next,
            );
            entry_response(&entry, Some(CacheStatus::Stale))
        }
        Lookup::Miss => {
            coordinator.spawn_revalidation(
                state.dataset.clone(),
                current,
                signature,
                request,
                next,
            );
            miss_response()
        }
    }
}
