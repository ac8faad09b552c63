// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

use axum::extract::DefaultBodyLimit;
use axum::middleware::from_fn_with_state;
use axum::routing::get;
use axum::Router;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

mod cache;
mod config;
mod dataset;
mod fake;
mod http;
mod middleware;
mod runtime;
mod source;
mod telemetry;

pub use cache::coordinator::{CacheCoordinator, Lookup, RevalidationOutcome, WarmReport};
pub use cache::locks::RevalidationLockTable;
pub use config::{
    validate_startup_config, CoordinatorConfig, LifecycleConfig, ServerConfig, StorageLayout,
    DEFAULT_REQUIRED_MEMBERS,
};
pub use dataset::{DatasetHandle, LoadedDataset};
pub use fake::{FakeDataset, FakeSource};
pub use http::handlers::metadata_handler;
pub use runtime::lifecycle::{
    BundleSummary, CapturePhase, CleanupReport, JobOutcome, LifecycleError, LifecycleStatus,
    SnapshotLifecycleManager,
};
pub use source::command::{CommandSource, RawVat};
pub use source::{DatasetSource, SourceError};
pub use telemetry::ServerMetrics;

pub const CRATE_NAME: &str = "vatgate-server";

/// Shared handles for the router and its middlewares. Each instance owns its
/// own dataset pointer and lock table.
pub struct AppState<S: DatasetSource> {
    pub dataset: DatasetHandle<S::Dataset>,
    pub lifecycle: Arc<SnapshotLifecycleManager<S>>,
    pub coordinator: Arc<CacheCoordinator>,
    pub metrics: Arc<ServerMetrics>,
    pub request_id_seed: Arc<AtomicU64>,
}

impl<S: DatasetSource> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            dataset: self.dataset.clone(),
            lifecycle: Arc::clone(&self.lifecycle),
            coordinator: Arc::clone(&self.coordinator),
            metrics: Arc::clone(&self.metrics),
            request_id_seed: Arc::clone(&self.request_id_seed),
        }
    }
}

impl<S: DatasetSource> AppState<S> {
    #[must_use]
    pub fn new(cfg: &ServerConfig, source: Arc<S>) -> Self {
        let metrics = Arc::new(ServerMetrics::default());
        let dataset = DatasetHandle::new();
        let lifecycle = SnapshotLifecycleManager::new(
            cfg.lifecycle.clone(),
            &cfg.storage,
            source,
            dataset.clone(),
            Arc::clone(&metrics),
        );
        let coordinator = Arc::new(CacheCoordinator::new(
            cfg.coordinator.clone(),
            &cfg.storage,
            Arc::clone(&metrics),
        ));
        Self {
            dataset,
            lifecycle,
            coordinator,
            metrics,
            request_id_seed: Arc::new(AtomicU64::new(1)),
        }
    }
}

/// Gateway routes merged with the application's `api` routes. Every route
/// goes through request tracing, the readiness gate and the cache
/// coordinator, outermost first.
pub fn build_router<S: DatasetSource>(state: AppState<S>, api: Router<AppState<S>>) -> Router {
    let max_body_bytes = state.coordinator.config().max_body_bytes;
    Router::new()
        .route("/health", get(http::handlers::health_handler::<S>))
        .route("/readyz", get(http::handlers::readyz_handler::<S>))
        .route("/metrics", get(http::handlers::metrics_handler::<S>))
        .route(
            "/api/ucache/:file",
            get(http::handlers::ucache_file_handler::<S>),
        )
        .route(
            "/api/snapshot/pickle",
            get(http::handlers::snapshot_pickle_handler::<S>),
        )
        .route(
            "/api/snapshot/status",
            get(http::handlers::snapshot_status_handler::<S>),
        )
        .merge(api)
        .layer(from_fn_with_state(
            state.clone(),
            cache::coordinator::cache_coordinator_middleware::<S>,
        ))
        .layer(from_fn_with_state(
            state.clone(),
            middleware::readiness::readiness_middleware::<S>,
        ))
        .layer(from_fn_with_state(
            state.clone(),
            middleware::request_tracing::request_tracing_middleware::<S>,
        ))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(state)
}
