//! PLC log entries and the account info projection.

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use iroh_metrics::inc_by;
use redb::{ReadableTable, ReadableTableMetadata};
use time::OffsetDateTime;

use super::{get_json, tables::*, AccountInfo, AccountInfoUpdate, LogEntryRow, Store};
use crate::{metrics::Metrics, plc::OperationLogEntry};

/// Outcome of [`Store::insert_log_entries`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertReport {
    pub inserted: usize,
    pub duplicates: usize,
}

impl Store {
    /// Appends log entries, ignoring any whose (did, cid) is already stored.
    pub fn insert_log_entries(&self, entries: &[OperationLogEntry]) -> Result<InsertReport> {
        let mut report = InsertReport::default();
        if entries.is_empty() {
            return Ok(report);
        }
        let now = OffsetDateTime::now_utc();
        let tx = self.db.begin_write()?;
        {
            let mut log = tx.open_table(PLC_LOG_TABLE)?;
            let mut keys = tx.open_table(PLC_LOG_KEYS_TABLE)?;
            let mut by_time = tx.open_table(PLC_LOG_BY_TIME_TABLE)?;
            let mut next_id = match log.last()? {
                Some((id, _)) => id.value() + 1,
                None => 1,
            };
            for entry in entries {
                if keys
                    .get((entry.did.as_str(), entry.cid.as_str()))?
                    .is_some()
                {
                    report.duplicates += 1;
                    continue;
                }
                let row = LogEntryRow {
                    id: next_id,
                    created_at: now,
                    did: entry.did.clone(),
                    cid: entry.cid.clone(),
                    plc_timestamp: entry.created_at.clone(),
                    nullified: entry.nullified,
                    operation: entry.operation.clone(),
                    notes: String::new(),
                    issues: 0,
                };
                let value = serde_json::to_vec(&row)?;
                log.insert(next_id, value.as_slice())?;
                keys.insert((entry.did.as_str(), entry.cid.as_str()), next_id)?;
                by_time.insert((entry.created_at.as_str(), next_id), ())?;
                next_id += 1;
                report.inserted += 1;
            }
        }
        tx.commit()?;
        inc_by!(Metrics, plc_entries_persisted, report.inserted as u64);
        inc_by!(Metrics, plc_entries_duplicate, report.duplicates as u64);
        Ok(report)
    }

    /// Greatest protocol timestamp of any stored entry.
    pub fn latest_plc_timestamp(&self) -> Result<Option<String>> {
        let tx = self.db.begin_read()?;
        let by_time = tx.open_table(PLC_LOG_BY_TIME_TABLE)?;
        let latest = by_time.last()?.map(|(key, _)| key.value().0.to_string());
        Ok(latest)
    }

    pub fn log_entry_count(&self) -> Result<u64> {
        let tx = self.db.begin_read()?;
        let log = tx.open_table(PLC_LOG_TABLE)?;
        Ok(log.len()?)
    }

    /// Up to `limit` entries with an id greater than `after`, in id order.
    pub fn log_entries_after(&self, after: u64, limit: usize) -> Result<Vec<LogEntryRow>> {
        let tx = self.db.begin_read()?;
        let log = tx.open_table(PLC_LOG_TABLE)?;
        let mut rows = Vec::with_capacity(limit.min(1024));
        for item in log.range((after + 1)..)?.take(limit) {
            let (id, value) = item?;
            let row: LogEntryRow = serde_json::from_slice(value.value())
                .with_context(|| format!("corrupt log entry {}", id.value()))?;
            rows.push(row);
        }
        Ok(rows)
    }

    /// All stored entries of one account, in id order.
    pub fn log_entries_for(&self, did: &str) -> Result<Vec<LogEntryRow>> {
        let tx = self.db.begin_read()?;
        let keys = tx.open_table(PLC_LOG_KEYS_TABLE)?;
        let log = tx.open_table(PLC_LOG_TABLE)?;
        let mut ids = Vec::new();
        for item in keys.range((did, "")..)? {
            let (key, id) = item?;
            if key.value().0 != did {
                break;
            }
            ids.push(id.value());
        }
        ids.sort_unstable();
        let mut rows = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(value) = log.get(id)? {
                rows.push(serde_json::from_slice(value.value())?);
            }
        }
        Ok(rows)
    }

    /// Sets notes and issue counts. Rows whose annotation is unchanged are
    /// not rewritten. Returns the number of rows changed.
    pub fn annotate_log_entries(&self, annotations: &[(u64, String, u32)]) -> Result<usize> {
        let tx = self.db.begin_write()?;
        let mut changed = 0;
        {
            let mut log = tx.open_table(PLC_LOG_TABLE)?;
            for (id, notes, issues) in annotations {
                let mut row: LogEntryRow = match log.get(*id)? {
                    Some(value) => serde_json::from_slice(value.value())?,
                    None => continue,
                };
                if row.notes == *notes && row.issues == *issues {
                    continue;
                }
                row.notes = notes.clone();
                row.issues = *issues;
                let value = serde_json::to_vec(&row)?;
                log.insert(*id, value.as_slice())?;
                changed += 1;
            }
        }
        tx.commit()?;
        Ok(changed)
    }

    /// Upserts account info. A row is only replaced by an update whose
    /// protocol timestamp is not older. Describe results are kept.
    ///
    /// Returns the number of rows written.
    pub fn upsert_account_infos(&self, updates: &[AccountInfoUpdate]) -> Result<usize> {
        let now = OffsetDateTime::now_utc();
        let tx = self.db.begin_write()?;
        let mut written = 0;
        {
            let mut infos = tx.open_table(ACCOUNT_INFO_TABLE)?;
            let mut handles = tx.open_table(ACCOUNT_HANDLES_TABLE)?;
            for update in updates {
                let existing: Option<AccountInfo> = get_json(&infos, &update.did)?;
                let row = match existing {
                    Some(existing) if existing.plc_timestamp > update.plc_timestamp => continue,
                    Some(mut existing) => {
                        if existing.handle != update.handle {
                            if let Some(old) = &existing.handle {
                                let old = old.to_lowercase();
                                handles.remove((old.as_str(), update.did.as_str()))?;
                            }
                        }
                        existing.plc_timestamp = update.plc_timestamp.clone();
                        existing.pds = update.pds.clone();
                        existing.handle = update.handle.clone();
                        existing.updated_at = now;
                        existing
                    }
                    None => AccountInfo {
                        did: update.did.clone(),
                        plc_timestamp: update.plc_timestamp.clone(),
                        pds: update.pds.clone(),
                        handle: update.handle.clone(),
                        describe: None,
                        described_at: None,
                        created_at: now,
                        updated_at: now,
                    },
                };
                if let Some(handle) = &row.handle {
                    let handle = handle.to_lowercase();
                    handles.insert((handle.as_str(), row.did.as_str()), ())?;
                }
                let value = serde_json::to_vec(&row)?;
                infos.insert(row.did.as_str(), value.as_slice())?;
                written += 1;
            }
        }
        tx.commit()?;
        Ok(written)
    }

    pub fn account_info(&self, did: &str) -> Result<Option<AccountInfo>> {
        let tx = self.db.begin_read()?;
        let infos = tx.open_table(ACCOUNT_INFO_TABLE)?;
        get_json(&infos, did)
    }

    /// The account currently using `handle`, if any is known. Handles compare
    /// case-insensitively.
    ///
    /// If several accounts claim the handle the most recently updated wins.
    pub fn did_for_handle(&self, handle: &str) -> Result<Option<String>> {
        let handle = handle.to_lowercase();
        let tx = self.db.begin_read()?;
        let handles = tx.open_table(ACCOUNT_HANDLES_TABLE)?;
        let infos = tx.open_table(ACCOUNT_INFO_TABLE)?;
        let mut best: Option<AccountInfo> = None;
        for item in handles.range((handle.as_str(), "")..)? {
            let (key, _) = item?;
            let (h, did) = key.value();
            if h != handle {
                break;
            }
            let Some(info) = get_json::<AccountInfo>(&infos, did)? else {
                continue;
            };
            if best
                .as_ref()
                .map_or(true, |b| info.plc_timestamp > b.plc_timestamp)
            {
                best = Some(info);
            }
        }
        Ok(best.map(|info| info.did))
    }

    /// Distinct hosting servers of all known accounts.
    pub fn known_hosts(&self) -> Result<BTreeSet<String>> {
        let tx = self.db.begin_read()?;
        let infos = tx.open_table(ACCOUNT_INFO_TABLE)?;
        let mut hosts = BTreeSet::new();
        for item in infos.iter()? {
            let (_, value) = item?;
            let info: AccountInfo = serde_json::from_slice(value.value())?;
            if let Some(pds) = info.pds {
                hosts.insert(pds);
            }
        }
        Ok(hosts)
    }
}
