// SPDX-License-Identifier: Apache-2.0

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use vatgate_model::CacheStatus;

const METRIC_SUBSYSTEM: &str = "vatgate";
const METRIC_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Default)]
pub struct ServerMetrics {
    pub fresh_responses: AtomicU64,
    pub stale_responses: AtomicU64,
    pub miss_responses: AtomicU64,
    pub bypassed_requests: AtomicU64,
    pub corrupt_entries: AtomicU64,
    pub revalidations_started: AtomicU64,
    pub revalidations_skipped: AtomicU64,
    pub revalidations_persisted: AtomicU64,
    pub revalidations_failed: AtomicU64,
    pub revalidations_discarded: AtomicU64,
    pub captures_succeeded: AtomicU64,
    pub captures_failed: AtomicU64,
    pub dataset_swaps: AtomicU64,
    pub cleanup_passes: AtomicU64,
    pub bundles_deleted: AtomicU64,
    pub cache_files_pruned: AtomicU64,
}

impl ServerMetrics {
    pub fn record_status(&self, status: CacheStatus) {
        let counter = match status {
            CacheStatus::Fresh => &self.fresh_responses,
            CacheStatus::Stale => &self.stale_responses,
            CacheStatus::Miss => &self.miss_responses,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(u64::try_from(n).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    /// Prometheus text exposition of every counter, plus caller-supplied gauges.
    #[must_use]
    pub fn render(&self, gauges: &[(&str, u64)]) -> String {
        let counters: [(&str, &AtomicU64); 16] = [
            ("cache_fresh_total", &self.fresh_responses),
            ("cache_stale_total", &self.stale_responses),
            ("cache_miss_total", &self.miss_responses),
            ("cache_bypass_total", &self.bypassed_requests),
            ("cache_corrupt_entries_total", &self.corrupt_entries),
            ("revalidations_started_total", &self.revalidations_started),
            ("revalidations_skipped_total", &self.revalidations_skipped),
            ("revalidations_persisted_total", &self.revalidations_persisted),
            ("revalidations_failed_total", &self.revalidations_failed),
            ("revalidations_discarded_total", &self.revalidations_discarded),
            ("captures_succeeded_total", &self.captures_succeeded),
            ("captures_failed_total", &self.captures_failed),
            ("dataset_swaps_total", &self.dataset_swaps),
            ("cleanup_passes_total", &self.cleanup_passes),
            ("bundles_deleted_total", &self.bundles_deleted),
            ("cache_files_pruned_total", &self.cache_files_pruned),
        ];
        let mut body = String::new();
        for (name, counter) in counters {
            let _ = writeln!(
                body,
                "{METRIC_SUBSYSTEM}_{name}{{version=\"{METRIC_VERSION}\"}} {}",
                counter.load(Ordering::Relaxed)
            );
        }
        for (name, value) in gauges {
            let _ = writeln!(
                body,
                "{METRIC_SUBSYSTEM}_{name}{{version=\"{METRIC_VERSION}\"}} {value}"
            );
        }
        body
    }
}
