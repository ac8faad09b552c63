// SPDX-License-Identifier: Apache-2.0

use axum::body::Body;
use axum::extract::{RawQuery, State};
use axum::http::{Request, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tower::ServiceExt;
use vatgate_model::{RequestSignature, StaticExportKey};
use vatgate_server::{
    build_router, AppState, FakeSource, Lookup, ServerConfig, StorageLayout,
};

type FakeState = AppState<FakeSource>;

fn config(base: &Path) -> ServerConfig {
    ServerConfig {
        storage: StorageLayout::under(base),
        ..ServerConfig::default()
    }
}

fn write_bundle(root: &Path, minute: u32, seq: u64) {
    let dir = root.join(format!("vat-2024-11-03-14-{minute:02}-00-000"));
    std::fs::create_dir_all(&dir).expect("bundle dir");
    FakeSource::write_members(&dir, &["perp", "spot", "usermap", "userstats"], seq)
        .expect("members");
    std::thread::sleep(Duration::from_millis(15));
}

fn api(calls: Arc<AtomicU64>) -> Router<FakeState> {
    Router::new().route(
        "/api/value",
        get(move |State(state): State<FakeState>, RawQuery(query): RawQuery| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                let seq = state.dataset.current().map_or(0, |d| d.data.capture_seq());
                Json(json!({ "seq": seq, "query": query }))
            }
        }),
    )
}

async fn get_body(app: Router, uri: &str) -> (StatusCode, Option<String>, Vec<u8>) {
    let request = Request::builder()
        .uri(uri)
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(request).await.expect("infallible");
    let status = response.status();
    let cache_status = response
        .headers()
        .get("x-cache-status")
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    (status, cache_status, bytes.to_vec())
}

#[tokio::test]
async fn exports_are_rendered_from_the_newest_bundle_on_disk() {
    let tmp = tempdir().expect("tempdir");
    let cfg = config(tmp.path());
    write_bundle(&cfg.storage.snapshot_root, 1, 101);
    write_bundle(&cfg.storage.snapshot_root, 2, 102);
    let state = AppState::new(&cfg, Arc::new(FakeSource::default()));
    let version = state
        .lifecycle
        .sync_to_newest()
        .await
        .expect("sync")
        .expect("a bundle was loaded");

    let calls = Arc::new(AtomicU64::new(0));
    let app = api(Arc::clone(&calls)).with_state(state.clone());
    let targets = vec!["/api/value?n=7&a=1".to_string(), "/api/missing".to_string()];
    let report = state
        .coordinator
        .warm_exports(&state.dataset, app, &targets)
        .await;

    assert_eq!(report.written, vec!["GET_api_value__n-7_a-1.json".to_string()]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "/api/missing");
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let file = cfg.storage.export_root.join("GET_api_value__n-7_a-1.json");
    let export: Value =
        serde_json::from_slice(&std::fs::read(&file).expect("export file")).expect("json");
    assert_eq!(export["content"], json!({ "seq": 102, "query": "n=7&a=1" }));
    assert_eq!(export["status_code"], 200);

    let signature = RequestSignature::new("GET", "/api/value", Some("a=1&n=7"));
    assert!(matches!(
        state.coordinator.lookup(&version, &signature),
        Lookup::Fresh(_)
    ));
}

#[tokio::test]
async fn warmed_paths_are_served_fresh_and_their_exports_verbatim() {
    let tmp = tempdir().expect("tempdir");
    let cfg = config(tmp.path());
    write_bundle(&cfg.storage.snapshot_root, 1, 7);
    let state = AppState::new(&cfg, Arc::new(FakeSource::default()));
    state.lifecycle.sync_to_newest().await.expect("sync");

    let calls = Arc::new(AtomicU64::new(0));
    let report = state
        .coordinator
        .warm_exports(
            &state.dataset,
            api(Arc::clone(&calls)).with_state(state.clone()),
            &["/api/value?n=1".to_string()],
        )
        .await;
    assert!(report.is_complete());

    let app = build_router(state.clone(), api(Arc::clone(&calls)));
    let (status, cache_status, body) = get_body(app.clone(), "/api/value?n=1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cache_status.as_deref(), Some("Fresh"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let body: Value = serde_json::from_slice(&body).expect("json");
    assert_eq!(body["seq"], 7);

    let key = StaticExportKey::from_request("GET", "/api/value", Some("n=1"));
    let (status, cache_status, served) =
        get_body(app, &format!("/api/ucache/{}", key.file_name())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cache_status, None);
    let on_disk = std::fs::read(cfg.storage.export_root.join(key.file_name())).expect("file");
    assert_eq!(served, on_disk);
}

#[tokio::test]
async fn nothing_is_written_without_a_loaded_dataset() {
    let tmp = tempdir().expect("tempdir");
    let cfg = config(tmp.path());
    let state = AppState::new(&cfg, Arc::new(FakeSource::default()));
    assert_eq!(state.lifecycle.sync_to_newest().await.expect("sync"), None);

    let calls = Arc::new(AtomicU64::new(0));
    let report = state
        .coordinator
        .warm_exports(
            &state.dataset,
            api(Arc::clone(&calls)).with_state(state.clone()),
            &["/api/value".to_string()],
        )
        .await;
    assert!(report.written.is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(state.coordinator.export_mirror().is_empty().expect("len"));
}
