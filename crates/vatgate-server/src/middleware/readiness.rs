// SPDX-License-Identifier: Apache-2.0

use crate::source::DatasetSource;
use crate::AppState;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Probes stay reachable while no dataset is loaded.
const PROBE_PATHS: &[&str] = &["/health", "/readyz"];

pub(crate) fn not_ready_response() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({ "error": "not_ready" })),
    )
        .into_response()
}

pub(crate) async fn readiness_middleware<S: DatasetSource>(
    State(state): State<AppState<S>>,
    request: Request,
    next: Next,
) -> Response {
    if state.dataset.is_ready() || PROBE_PATHS.contains(&request.uri().path()) {
        return next.run(request).await;
    }
    not_ready_response()
}
