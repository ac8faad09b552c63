// SPDX-License-Identifier: Apache-2.0

use crate::{DatasetVersion, ValidationError};
use chrono::{DateTime, NaiveDateTime, Utc};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::time::SystemTime;

pub const BUNDLE_PREFIX: &str = "vat-";

const NAME_FORMAT: &str = "%Y-%m-%d-%H-%M-%S-%3f";
const LEGACY_NAME_FORMAT: &str = "%Y-%m-%d-%H-%M-%S";

/// Timestamped directory name of a snapshot bundle, e.g.
/// `vat-2024-11-03-14-05-09-120`. Ordering follows the embedded timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BundleName {
    taken_at: NaiveDateTime,
    raw: String,
}

impl BundleName {
    #[must_use]
    pub fn at(ts: DateTime<Utc>) -> Self {
        let naive = ts.naive_utc();
        Self {
            raw: format!("{BUNDLE_PREFIX}{}", naive.format(NAME_FORMAT)),
            taken_at: naive,
        }
    }

    pub fn parse(input: &str) -> Result<Self, ValidationError> {
        let stamp = input.strip_prefix(BUNDLE_PREFIX).ok_or_else(|| {
            ValidationError(format!("bundle name must start with {BUNDLE_PREFIX}: {input}"))
        })?;
        let taken_at = NaiveDateTime::parse_from_str(stamp, NAME_FORMAT)
            .or_else(|_| NaiveDateTime::parse_from_str(stamp, LEGACY_NAME_FORMAT))
            .map_err(|e| ValidationError(format!("invalid bundle timestamp in {input}: {e}")))?;
        Ok(Self {
            taken_at,
            raw: input.to_string(),
        })
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    #[must_use]
    pub fn taken_at(&self) -> DateTime<Utc> {
        self.taken_at.and_utc()
    }
}

impl Display for BundleName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.raw)
    }
}

/// One file of a bundle, named `<member>_<slot>.<ext>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberFile {
    pub member: String,
    pub slot: u64,
    pub file_name: String,
}

impl MemberFile {
    #[must_use]
    pub fn parse(file_name: &str) -> Option<Self> {
        // `usermap_12.pkl.tmp` is an interrupted write, not a member.
        let (stem, ext) = file_name.split_once('.')?;
        if ext.is_empty() || ext.contains('.') {
            return None;
        }
        let (member, slot) = stem.rsplit_once('_')?;
        if member.is_empty() {
            return None;
        }
        let slot = slot.parse::<u64>().ok()?;
        Some(Self {
            member: member.to_string(),
            slot,
            file_name: file_name.to_string(),
        })
    }
}

/// Keeps the highest-slot file per member.
#[must_use]
pub fn newest_members<I>(files: I) -> BTreeMap<String, MemberFile>
where
    I: IntoIterator<Item = MemberFile>,
{
    let mut out: BTreeMap<String, MemberFile> = BTreeMap::new();
    for file in files {
        match out.get(&file.member) {
            Some(existing) if existing.slot >= file.slot => {}
            _ => {
                out.insert(file.member.clone(), file);
            }
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completeness {
    pub present: usize,
    pub required: usize,
    pub missing: Vec<String>,
}

impl Completeness {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.present >= self.required
    }
}

#[must_use]
pub fn assess_completeness(
    required: &[String],
    members: &BTreeMap<String, MemberFile>,
) -> Completeness {
    let missing: Vec<String> = required
        .iter()
        .filter(|m| !members.contains_key(m.as_str()))
        .cloned()
        .collect();
    Completeness {
        present: required.len() - missing.len(),
        required: required.len(),
        missing,
    }
}

/// An on-disk snapshot bundle as observed by a directory scan.
#[derive(Debug, Clone)]
pub struct SnapshotBundle {
    pub name: BundleName,
    /// Canonical directory path.
    pub path: PathBuf,
    pub modified: SystemTime,
    pub members: BTreeMap<String, MemberFile>,
}

impl SnapshotBundle {
    #[must_use]
    pub fn version(&self) -> DatasetVersion {
        DatasetVersion::from_path(&self.path)
    }

    #[must_use]
    pub fn completeness(&self, required: &[String]) -> Completeness {
        assess_completeness(required, &self.members)
    }

    #[must_use]
    pub fn member_path(&self, member: &str) -> Option<PathBuf> {
        self.members
            .get(member)
            .map(|m| self.path.join(&m.file_name))
    }
}
