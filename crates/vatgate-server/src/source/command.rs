// SPDX-License-Identifier: Apache-2.0

use super::{DatasetSource, SourceError};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, info};
use vatgate_model::SnapshotBundle;

const STDERR_TAIL_BYTES: usize = 2048;

/// Member files of one bundle, held as raw bytes.
#[derive(Debug, Clone, Default)]
pub struct RawVat {
    pub members: BTreeMap<String, Vec<u8>>,
}

impl RawVat {
    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.members.values().map(Vec::len).sum()
    }
}

/// Captures by running an external program with the bundle directory appended
/// as its last argument. Has no live upstream of its own.
#[derive(Debug, Clone)]
pub struct CommandSource {
    program: String,
    args: Vec<String>,
    required: Vec<String>,
}

impl CommandSource {
    pub fn from_command_line(line: &str, required: Vec<String>) -> Result<Self, SourceError> {
        let mut parts = line.split_whitespace().map(ToString::to_string);
        let program = parts
            .next()
            .ok_or_else(|| SourceError("capture command is empty".to_string()))?;
        Ok(Self {
            program,
            args: parts.collect(),
            required,
        })
    }
}

#[async_trait]
impl DatasetSource for CommandSource {
    type Dataset = RawVat;

    fn source_tag(&self) -> &'static str {
        "command"
    }

    fn required_members(&self) -> Vec<String> {
        self.required.clone()
    }

    async fn bootstrap(&self) -> Result<Option<RawVat>, SourceError> {
        Ok(None)
    }

    async fn capture(&self, bundle_dir: &Path) -> Result<(), SourceError> {
        debug!(program = %self.program, dir = %bundle_dir.display(), "running capture command");
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(bundle_dir)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| SourceError(format!("failed to spawn {}: {e}", self.program)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let start = stderr.len().saturating_sub(STDERR_TAIL_BYTES);
            let tail = stderr.get(start..).unwrap_or(&stderr);
            return Err(SourceError(format!(
                "capture command exited with {}: {}",
                output.status,
                tail.trim()
            )));
        }
        info!(program = %self.program, dir = %bundle_dir.display(), "capture command finished");
        Ok(())
    }

    async fn load(&self, bundle: &SnapshotBundle) -> Result<RawVat, SourceError> {
        let mut members = BTreeMap::new();
        for member in &self.required {
            let path = bundle.member_path(member).ok_or_else(|| {
                SourceError(format!("bundle {} is missing member {member}", bundle.name))
            })?;
            let bytes = tokio::fs::read(&path)
                .await
                .map_err(|e| SourceError(format!("read {}: {e}", path.display())))?;
            if bytes.is_empty() {
                return Err(SourceError(format!("member file {} is empty", path.display())));
            }
            members.insert(member.clone(), bytes);
        }
        Ok(RawVat { members })
    }
}
