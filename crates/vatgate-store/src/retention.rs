use vatgate_model::{DatasetVersion, SnapshotBundle};

/// Bundles a cleanup pass should delete.
#[derive(Debug, Clone, Default)]
pub struct RetentionPlan {
    /// Missing at least one required member (interrupted capture).
    pub incomplete: Vec<SnapshotBundle>,
    /// Complete but beyond the retention count, oldest first.
    pub expired: Vec<SnapshotBundle>,
}

impl RetentionPlan {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.incomplete.is_empty() && self.expired.is_empty()
    }
}

/// Decides which bundles to delete so that at most `keep` complete bundles
/// remain. The bundle whose version equals `live` is never selected.
#[must_use]
pub fn plan_retention(
    bundles: &[SnapshotBundle],
    required: &[String],
    keep: usize,
    live: Option<&DatasetVersion>,
) -> RetentionPlan {
    let is_live = |b: &SnapshotBundle| live.is_some_and(|v| &b.version() == v);

    let (complete, incomplete): (Vec<&SnapshotBundle>, Vec<&SnapshotBundle>) = bundles
        .iter()
        .partition(|b| b.completeness(required).is_complete());

    let incomplete = incomplete
        .into_iter()
        .filter(|b| !is_live(*b))
        .cloned()
        .collect();

    let mut complete = complete;
    complete.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.name.cmp(&b.name)));
    let excess = complete.len().saturating_sub(keep);
    let expired = complete
        .into_iter()
        .filter(|b| !is_live(*b))
        .take(excess)
        .cloned()
        .collect();

    RetentionPlan {
        incomplete,
        expired,
    }
}
