//! Metrics support for the mirror

use iroh_metrics::core::{Core, Counter, Metric};
use struct_iterable::Iterable;

/// Metrics for at-mirror
#[derive(Debug, Clone, Iterable)]
#[allow(missing_docs)]
pub struct Metrics {
    pub proxy_requests: Counter,
    pub proxy_policy_updates: Counter,
    pub proxy_hard_pauses: Counter,
    pub plc_passes: Counter,
    pub plc_pages: Counter,
    pub plc_fetch_errors: Counter,
    pub plc_lines_invalid: Counter,
    pub plc_entries_rejected: Counter,
    pub plc_entries_persisted: Counter,
    pub plc_entries_duplicate: Counter,
    pub plc_entries_annotated: Counter,
    pub repo_syncs: Counter,
    pub repo_syncs_unchanged: Counter,
    pub repo_bytes_fetched: Counter,
    pub repo_blocks_merged: Counter,
    pub repo_records_indexed: Counter,
    pub blobs_fetched: Counter,
    pub blobs_failed: Counter,
    pub backfill_units: Counter,
    pub backfill_units_succeeded: Counter,
    pub backfill_units_terminal: Counter,
    pub backfill_units_rate_limited: Counter,
    pub backfill_units_server_error: Counter,
    pub backfill_units_failed: Counter,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            proxy_requests: Counter::new("Outbound requests issued through the proxy"),
            proxy_policy_updates: Counter::new("Host rate limits adopted from response headers"),
            proxy_hard_pauses: Counter::new("Hard pauses registered after an exhausted budget"),
            plc_passes: Counter::new("Completed PLC mirror passes"),
            plc_pages: Counter::new("PLC export pages fetched"),
            plc_fetch_errors: Counter::new("Failed PLC export fetches"),
            plc_lines_invalid: Counter::new("PLC export lines that failed to decode"),
            plc_entries_rejected: Counter::new("PLC entries rejected by validation"),
            plc_entries_persisted: Counter::new("PLC entries newly stored"),
            plc_entries_duplicate: Counter::new("PLC entries already present in the store"),
            plc_entries_annotated: Counter::new("PLC entries whose annotation changed"),
            repo_syncs: Counter::new("Repository syncs that wrote new data"),
            repo_syncs_unchanged: Counter::new("Repository syncs with nothing new"),
            repo_bytes_fetched: Counter::new("Repository export bytes fetched"),
            repo_blocks_merged: Counter::new("New blocks merged into local repositories"),
            repo_records_indexed: Counter::new("Records written to per-account indexes"),
            blobs_fetched: Counter::new("Blobs downloaded"),
            blobs_failed: Counter::new("Blob downloads that failed"),
            backfill_units: Counter::new("Backfill units processed"),
            backfill_units_succeeded: Counter::new("Backfill units that succeeded"),
            backfill_units_terminal: Counter::new("Backfill units marked terminally inactive"),
            backfill_units_rate_limited: Counter::new("Backfill units deferred by rate limiting"),
            backfill_units_server_error: Counter::new("Backfill units failed with a server error"),
            backfill_units_failed: Counter::new("Backfill units failed with another error"),
        }
    }
}

impl Metric for Metrics {
    fn name() -> &'static str {
        "at_mirror"
    }
}

/// Init the metrics collection core.
pub fn init_metrics() {
    Core::init(|reg, metrics| {
        metrics.insert(Metrics::new(reg));
    });
}
