// SPDX-License-Identifier: Apache-2.0

use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tempfile::tempdir;
use vatgate_server::{
    AppState, CapturePhase, FakeSource, LifecycleError, ServerConfig, StorageLayout,
};

const MEMBERS: &[&str] = &["perp", "spot", "usermap", "userstats"];

fn config(base: &Path) -> ServerConfig {
    ServerConfig {
        storage: StorageLayout::under(base),
        ..ServerConfig::default()
    }
}

fn write_bundle(root: &Path, minute: u32, members: &[&str], corrupt: bool) {
    let dir = root.join(format!("vat-2024-11-03-14-{minute:02}-00-000"));
    std::fs::create_dir_all(&dir).expect("bundle dir");
    FakeSource::write_members(&dir, members, 100 + u64::from(minute)).expect("members");
    if corrupt {
        std::fs::write(dir.join(format!("perp_{}.json", 100 + minute)), b"{oops").expect("corrupt");
    }
    std::thread::sleep(Duration::from_millis(15));
}

fn bundle_names(root: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(root)
        .expect("read root")
        .filter_map(Result::ok)
        .filter_map(|e| e.file_name().to_str().map(ToString::to_string))
        .filter(|n| n.starts_with("vat-"))
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn empty_store_bootstrap_captures_one_bundle_and_becomes_ready() {
    let tmp = tempdir().expect("tempdir");
    let cfg = config(tmp.path());
    let source = Arc::new(FakeSource::default());
    let state = AppState::new(&cfg, Arc::clone(&source));
    assert!(!state.dataset.is_ready());

    let version = state.lifecycle.bootstrap().await.expect("bootstrap");
    assert!(state.dataset.is_ready());
    assert_eq!(state.dataset.version(), Some(version));
    assert_eq!(source.capture_calls.load(Ordering::SeqCst), 1);
    assert_eq!(bundle_names(&cfg.storage.snapshot_root).len(), 1);
    assert_eq!(state.lifecycle.phase(), CapturePhase::Idle);
    let status = state.lifecycle.status();
    assert!(status.last_capture.expect("capture outcome").ok);
}

#[tokio::test]
async fn bootstrap_prefers_disk_and_falls_back_past_unloadable_bundles() {
    let tmp = tempdir().expect("tempdir");
    let cfg = config(tmp.path());
    let root = &cfg.storage.snapshot_root;
    write_bundle(root, 1, MEMBERS, false);
    write_bundle(root, 2, MEMBERS, true);
    write_bundle(root, 3, &["perp", "spot"], false);
    let source = Arc::new(FakeSource::default());
    let state = AppState::new(&cfg, Arc::clone(&source));

    let version = state.lifecycle.bootstrap().await.expect("bootstrap");
    assert!(version.as_str().ends_with("vat-2024-11-03-14-01-00-000"));
    assert_eq!(source.capture_calls.load(Ordering::SeqCst), 0);
    assert_eq!(source.load_calls.load(Ordering::SeqCst), 2);
    let live = state.dataset.current().expect("live dataset");
    assert_eq!(live.data.capture_seq(), 101);
}

#[tokio::test]
async fn live_upstream_serves_while_the_first_capture_fails() {
    let tmp = tempdir().expect("tempdir");
    let cfg = config(tmp.path());
    let source = Arc::new(FakeSource::default());
    source.live_upstream.store(true, Ordering::Relaxed);
    source.fail_capture.store(true, Ordering::Relaxed);
    let state = AppState::new(&cfg, Arc::clone(&source));

    let version = state.lifecycle.bootstrap().await.expect("bootstrap");
    assert!(version.is_bootstrap());
    assert!(state.dataset.is_ready());
    assert!(bundle_names(&cfg.storage.snapshot_root).is_empty());
    assert!(!state.lifecycle.status().last_capture.expect("outcome").ok);
}

#[tokio::test]
async fn failed_capture_keeps_the_previous_dataset_and_removes_the_directory() {
    let tmp = tempdir().expect("tempdir");
    let cfg = config(tmp.path());
    let source = Arc::new(FakeSource::default());
    let state = AppState::new(&cfg, Arc::clone(&source));
    let first = state.lifecycle.capture_cycle().await.expect("first capture");

    source.fail_capture.store(true, Ordering::Relaxed);
    let err = state.lifecycle.capture_cycle().await.expect_err("capture fails");
    assert!(matches!(err, LifecycleError::Capture(_)));
    assert_eq!(state.dataset.version(), Some(first.clone()));

    source.fail_capture.store(false, Ordering::Relaxed);
    source.partial_capture.store(true, Ordering::Relaxed);
    let err = state.lifecycle.capture_cycle().await.expect_err("partial capture");
    assert!(matches!(err, LifecycleError::Validation(_)));

    source.partial_capture.store(false, Ordering::Relaxed);
    source.corrupt_capture.store(true, Ordering::Relaxed);
    let err = state.lifecycle.capture_cycle().await.expect_err("corrupt capture");
    assert!(matches!(err, LifecycleError::Validation(_)));

    assert_eq!(state.dataset.version(), Some(first));
    assert_eq!(bundle_names(&cfg.storage.snapshot_root).len(), 1);
    assert_eq!(state.metrics.captures_failed.load(Ordering::Relaxed), 3);
}

#[tokio::test]
async fn capture_timeout_counts_as_capture_failure() {
    let tmp = tempdir().expect("tempdir");
    let mut cfg = config(tmp.path());
    cfg.lifecycle.capture_timeout = Duration::from_millis(50);
    let source = Arc::new(FakeSource::default().with_capture_delay(Duration::from_secs(5)));
    let state = AppState::new(&cfg, source);

    let err = state.lifecycle.capture_cycle().await.expect_err("timeout");
    assert!(matches!(err, LifecycleError::Capture(_)));
    assert!(!state.dataset.is_ready());
    assert!(bundle_names(&cfg.storage.snapshot_root).is_empty());
}

#[tokio::test]
async fn cleanup_removes_incomplete_then_oldest_down_to_retention() {
    let tmp = tempdir().expect("tempdir");
    let cfg = config(tmp.path());
    let root = &cfg.storage.snapshot_root;
    for minute in 0..6 {
        write_bundle(root, minute, MEMBERS, false);
    }
    write_bundle(root, 6, &["perp", "spot"], false);
    let state = AppState::new(&cfg, Arc::new(FakeSource::default()));

    let report = state.lifecycle.cleanup_pass().await.expect("cleanup");
    assert_eq!(report.incomplete_removed, vec!["vat-2024-11-03-14-06-00-000"]);
    assert_eq!(report.expired_removed, vec!["vat-2024-11-03-14-00-00-000"]);
    assert!(report.failures.is_empty());
    let remaining = bundle_names(root);
    assert_eq!(remaining.len(), 5);
    assert_eq!(remaining[0], "vat-2024-11-03-14-01-00-000");
}

#[tokio::test]
async fn cleanup_never_deletes_the_live_bundle() {
    let tmp = tempdir().expect("tempdir");
    let cfg = config(tmp.path());
    let root = &cfg.storage.snapshot_root;
    write_bundle(root, 0, MEMBERS, false);
    for minute in 1..7 {
        write_bundle(root, minute, MEMBERS, true);
    }
    let state = AppState::new(&cfg, Arc::new(FakeSource::default()));
    let live = state.lifecycle.bootstrap().await.expect("bootstrap");
    assert!(live.as_str().ends_with("vat-2024-11-03-14-00-00-000"));

    let report = state.lifecycle.cleanup_pass().await.expect("cleanup");
    assert_eq!(report.live_version.as_ref(), Some(&live));
    assert_eq!(
        report.expired_removed,
        vec!["vat-2024-11-03-14-01-00-000", "vat-2024-11-03-14-02-00-000"]
    );
    let remaining = bundle_names(root);
    assert_eq!(remaining.len(), 5);
    assert!(remaining.contains(&"vat-2024-11-03-14-00-00-000".to_string()));
    assert!(Path::new(live.as_str()).is_dir());
}

#[tokio::test]
async fn cleanup_caps_cached_files() {
    let tmp = tempdir().expect("tempdir");
    let mut cfg = config(tmp.path());
    cfg.lifecycle.max_cache_files = 2;
    cfg.lifecycle.max_export_files = 1;
    std::fs::create_dir_all(&cfg.storage.cache_root).expect("cache root");
    std::fs::create_dir_all(&cfg.storage.export_root).expect("export root");
    for i in 0..4 {
        std::fs::write(cfg.storage.cache_root.join(format!("{i:064}.json")), b"{}").expect("entry");
        std::fs::write(cfg.storage.export_root.join(format!("GET_api_{i}.json")), b"{}")
            .expect("export");
        std::thread::sleep(Duration::from_millis(15));
    }
    let state = AppState::new(&cfg, Arc::new(FakeSource::default()));

    let report = state.lifecycle.cleanup_pass().await.expect("cleanup");
    assert_eq!(report.cache_files_removed, 2);
    assert_eq!(report.export_files_removed, 3);
    assert!(cfg.storage.cache_root.join(format!("{:064}.json", 3)).exists());
    assert!(!cfg.storage.cache_root.join(format!("{:064}.json", 0)).exists());
}

#[tokio::test]
async fn overlapping_runs_are_skipped_and_cleanup_waits_for_capture() {
    let tmp = tempdir().expect("tempdir");
    let cfg = config(tmp.path());
    let source = Arc::new(FakeSource::default().with_capture_delay(Duration::from_millis(200)));
    let state = AppState::new(&cfg, Arc::clone(&source));

    let capture = {
        let lifecycle = Arc::clone(&state.lifecycle);
        tokio::spawn(async move { lifecycle.capture_cycle().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(state.lifecycle.phase(), CapturePhase::Capturing);
    assert!(state.lifecycle.is_capture_running());
    let err = state.lifecycle.capture_cycle().await.expect_err("busy");
    assert_eq!(err, LifecycleError::Busy("capture"));

    let report = state.lifecycle.cleanup_pass().await.expect("cleanup");
    assert!(report.incomplete_removed.is_empty());
    let version = capture.await.expect("join").expect("capture");
    assert_eq!(report.live_version, Some(version));
    assert_eq!(bundle_names(&cfg.storage.snapshot_root).len(), 1);
    assert_eq!(source.capture_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn watcher_swaps_in_externally_written_bundles() {
    let tmp = tempdir().expect("tempdir");
    let cfg = config(tmp.path());
    let root = &cfg.storage.snapshot_root;
    write_bundle(root, 1, MEMBERS, false);
    let state = AppState::new(&cfg, Arc::new(FakeSource::default()));
    state.lifecycle.bootstrap().await.expect("bootstrap");
    assert!(state.lifecycle.sync_to_newest().await.expect("sync").is_none());

    write_bundle(root, 2, MEMBERS, false);
    let swapped = state
        .lifecycle
        .sync_to_newest()
        .await
        .expect("sync")
        .expect("newer bundle");
    assert!(swapped.as_str().ends_with("vat-2024-11-03-14-02-00-000"));
    assert_eq!(state.dataset.version(), Some(swapped));
}
