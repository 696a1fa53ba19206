//! Offline annotation of stored log entries.

use anyhow::Result;
use iroh_metrics::inc_by;
use tracing::{debug, info};

use super::{types::OperationLogEntry, validate::Validator};
use crate::{db::Store, metrics::Metrics};

/// Bookkeeping of an annotation run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnnotateReport {
    pub scanned: usize,
    /// Entries with at least one note.
    pub flagged: usize,
    /// Rows whose stored annotation changed.
    pub changed: usize,
    /// Id of the last entry scanned.
    pub last_id: u64,
}

/// Annotates every stored entry with an id above `start`, `batch_size`
/// entries per transaction.
///
/// Only notes and issue counts are written, and only where they differ from
/// what is stored, so a repeated run over unchanged rows writes nothing.
pub fn annotate_log(
    store: &Store,
    validator: &Validator,
    start: u64,
    batch_size: usize,
) -> Result<AnnotateReport> {
    let mut report = AnnotateReport {
        last_id: start,
        ..Default::default()
    };
    loop {
        let rows = store.log_entries_after(report.last_id, batch_size.max(1))?;
        let Some(last) = rows.last() else {
            break;
        };
        report.last_id = last.id;

        let annotations: Vec<(u64, String, u32)> = rows
            .into_iter()
            .map(|row| {
                let entry = OperationLogEntry {
                    did: row.did,
                    operation: row.operation,
                    cid: row.cid,
                    nullified: row.nullified,
                    created_at: row.plc_timestamp,
                };
                let notes = validator.annotate(&entry);
                (row.id, notes.join("; "), notes.len() as u32)
            })
            .collect();
        report.scanned += annotations.len();
        report.flagged += annotations.iter().filter(|(_, _, n)| *n > 0).count();

        let changed = store.annotate_log_entries(&annotations)?;
        report.changed += changed;
        inc_by!(Metrics, plc_entries_annotated, changed as u64);
        debug!(last_id = report.last_id, changed, "annotated PLC batch");
    }
    info!(
        scanned = report.scanned,
        flagged = report.flagged,
        changed = report.changed,
        "PLC annotation complete"
    );
    Ok(report)
}
