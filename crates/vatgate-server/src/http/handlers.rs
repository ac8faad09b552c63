// SPDX-License-Identifier: Apache-2.0

use crate::source::command::CommandSource;
use crate::source::DatasetSource;
use crate::{AppState, CRATE_NAME};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::SecondsFormat;
use serde_json::json;
use std::collections::BTreeMap;
use tracing::warn;
use vatgate_model::StaticExportKey;

fn error_response(status: StatusCode, code: &str) -> Response {
    (status, Json(json!({ "error": code }))).into_response()
}

pub(crate) async fn health_handler<S: DatasetSource>(State(state): State<AppState<S>>) -> Response {
    let status = if state.dataset.is_ready() {
        "healthy"
    } else {
        "initializing"
    };
    Json(json!({ "status": status })).into_response()
}

pub(crate) async fn readyz_handler<S: DatasetSource>(State(state): State<AppState<S>>) -> Response {
    if state.dataset.is_ready() {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not-ready").into_response()
    }
}

pub(crate) async fn metrics_handler<S: DatasetSource>(State(state): State<AppState<S>>) -> Response {
    let ready = u64::from(state.dataset.is_ready());
    let locks = u64::try_from(state.coordinator.locks().len()).unwrap_or(u64::MAX);
    let body = state
        .metrics
        .render(&[("dataset_ready", ready), ("revalidation_locks", locks)]);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}

/// Serves a static-export file by name, bytes exactly as stored.
pub(crate) async fn ucache_file_handler<S: DatasetSource>(
    State(state): State<AppState<S>>,
    Path(file): Path<String>,
) -> Response {
    let Ok(key) = StaticExportKey::parse_file_name(&file) else {
        return error_response(StatusCode::BAD_REQUEST, "invalid_file_name");
    };
    match state.coordinator.export_mirror().read_raw(&key) {
        Ok(Some(bytes)) => (
            StatusCode::OK,
            [("content-type", "application/json")],
            bytes,
        )
            .into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "not_found"),
        Err(e) => {
            warn!(file = %file, error = %e, "unreadable static export");
            error_response(StatusCode::NOT_FOUND, "not_found")
        }
    }
}

pub(crate) async fn snapshot_pickle_handler<S: DatasetSource>(
    State(state): State<AppState<S>>,
) -> Response {
    if state.lifecycle.trigger_capture() {
        (
            StatusCode::ACCEPTED,
            Json(json!({ "status": "scheduled" })),
        )
            .into_response()
    } else {
        (
            StatusCode::CONFLICT,
            Json(json!({ "status": "already_running" })),
        )
            .into_response()
    }
}

pub(crate) async fn snapshot_status_handler<S: DatasetSource>(
    State(state): State<AppState<S>>,
) -> Response {
    let current = state.dataset.current();
    let bundles = match state.lifecycle.bundle_summaries() {
        Ok(bundles) => bundles,
        Err(e) => {
            warn!(error = %e, "listing bundles for status failed");
            Vec::new()
        }
    };
    let lifecycle = state.lifecycle.status();
    Json(json!({
        "server": CRATE_NAME,
        "version": current.as_ref().map(|d| d.version.to_string()),
        "loaded_at": current
            .as_ref()
            .map(|d| d.loaded_at.to_rfc3339_opts(SecondsFormat::Millis, true)),
        "phase": lifecycle.phase,
        "bundles": bundles,
        "last_capture": lifecycle.last_capture,
        "last_cleanup": lifecycle.last_cleanup,
    }))
    .into_response()
}

/// Describes the loaded bundle of the command-driven reference source.
pub async fn metadata_handler(State(state): State<AppState<CommandSource>>) -> Response {
    let Some(current) = state.dataset.current() else {
        return crate::middleware::readiness::not_ready_response();
    };
    let members: BTreeMap<&str, usize> = current
        .data
        .members
        .iter()
        .map(|(name, bytes)| (name.as_str(), bytes.len()))
        .collect();
    Json(json!({
        "version": current.version.to_string(),
        "bundle": current.bundle.as_ref().map(|b| b.name.to_string()),
        "taken_at": current
            .bundle
            .as_ref()
            .map(|b| b.name.taken_at().to_rfc3339_opts(SecondsFormat::Secs, true)),
        "loaded_at": current.loaded_at.to_rfc3339_opts(SecondsFormat::Millis, true),
        "total_bytes": current.data.total_bytes(),
        "members": members,
    }))
    .into_response()
}
