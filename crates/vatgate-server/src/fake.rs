// SPDX-License-Identifier: Apache-2.0

use crate::source::{DatasetSource, SourceError};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use vatgate_model::SnapshotBundle;

/// Decoded members of one fake bundle.
#[derive(Debug, Clone, PartialEq)]
pub struct FakeDataset {
    pub members: BTreeMap<String, Value>,
}

impl FakeDataset {
    /// Capture sequence number recorded in the members, or 0 for bootstrap data.
    #[must_use]
    pub fn capture_seq(&self) -> u64 {
        self.members
            .values()
            .next()
            .and_then(|v| v.get("capture"))
            .and_then(Value::as_u64)
            .unwrap_or(0)
    }
}

/// In-process dataset source for tests: capture writes one JSON file per
/// member, and each behavior can be switched to fail.
pub struct FakeSource {
    required: Vec<String>,
    pub capture_calls: AtomicU64,
    pub load_calls: AtomicU64,
    pub fail_capture: AtomicBool,
    pub partial_capture: AtomicBool,
    pub corrupt_capture: AtomicBool,
    pub fail_load: AtomicBool,
    pub live_upstream: AtomicBool,
    pub capture_delay: Duration,
}

impl Default for FakeSource {
    fn default() -> Self {
        Self::new(&["perp", "spot", "usermap", "userstats"])
    }
}

impl FakeSource {
    #[must_use]
    pub fn new(required: &[&str]) -> Self {
        Self {
            required: required.iter().map(ToString::to_string).collect(),
            capture_calls: AtomicU64::new(0),
            load_calls: AtomicU64::new(0),
            fail_capture: AtomicBool::new(false),
            partial_capture: AtomicBool::new(false),
            corrupt_capture: AtomicBool::new(false),
            fail_load: AtomicBool::new(false),
            live_upstream: AtomicBool::new(false),
            capture_delay: Duration::ZERO,
        }
    }

    #[must_use]
    pub fn with_capture_delay(mut self, delay: Duration) -> Self {
        self.capture_delay = delay;
        self
    }

    /// Writes a bundle's member files the way a capture would.
    pub fn write_members(dir: &Path, members: &[&str], seq: u64) -> Result<(), SourceError> {
        for member in members {
            let body = json!({ "member": member, "capture": seq });
            std::fs::write(dir.join(format!("{member}_{seq}.json")), body.to_string())
                .map_err(|e| SourceError(e.to_string()))?;
        }
        Ok(())
    }
}

#[async_trait]
impl DatasetSource for FakeSource {
    type Dataset = FakeDataset;

    fn source_tag(&self) -> &'static str {
        "fake"
    }

    fn required_members(&self) -> Vec<String> {
        self.required.clone()
    }

    async fn bootstrap(&self) -> Result<Option<FakeDataset>, SourceError> {
        if !self.live_upstream.load(Ordering::Relaxed) {
            return Ok(None);
        }
        let members = self
            .required
            .iter()
            .map(|m| (m.clone(), json!({ "member": m, "capture": 0 })))
            .collect();
        Ok(Some(FakeDataset { members }))
    }

    async fn capture(&self, bundle_dir: &Path) -> Result<(), SourceError> {
        let seq = self.capture_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.capture_delay.is_zero() {
            tokio::time::sleep(self.capture_delay).await;
        }
        if self.fail_capture.load(Ordering::Relaxed) {
            return Err(SourceError("upstream unavailable".to_string()));
        }
        let members: Vec<&str> = self.required.iter().map(String::as_str).collect();
        let written = if self.partial_capture.load(Ordering::Relaxed) {
            &members[..members.len() / 2]
        } else {
            &members[..]
        };
        Self::write_members(bundle_dir, written, seq)?;
        if self.corrupt_capture.load(Ordering::Relaxed) {
            if let Some(first) = written.first() {
                std::fs::write(bundle_dir.join(format!("{first}_{seq}.json")), b"{truncated")
                    .map_err(|e| SourceError(e.to_string()))?;
            }
        }
        Ok(())
    }

    async fn load(&self, bundle: &SnapshotBundle) -> Result<FakeDataset, SourceError> {
        self.load_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_load.load(Ordering::Relaxed) {
            return Err(SourceError(format!("refusing to load {}", bundle.name)));
        }
        let mut members = BTreeMap::new();
        for member in &self.required {
            let path = bundle
                .member_path(member)
                .ok_or_else(|| SourceError(format!("{} is missing {member}", bundle.name)))?;
            let raw = tokio::fs::read(&path)
                .await
                .map_err(|e| SourceError(format!("read {}: {e}", path.display())))?;
            let value: Value = serde_json::from_slice(&raw)
                .map_err(|e| SourceError(format!("decode {}: {e}", path.display())))?;
            members.insert(member.clone(), value);
        }
        Ok(FakeDataset { members })
    }
}
