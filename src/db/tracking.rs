//! Tracking rows driving the batch jobs.

use std::ops::Bound;

use anyhow::Result;
use redb::ReadableTable;
use time::OffsetDateTime;

use super::{
    did_shard, get_json, tables::*, AccountInfo, AccountRepo, Batch, BatchCursor, PdsRepo,
    RepoKey, RepoListing, Store, Target,
};

impl Store {
    /// Upserts a host's repository listing.
    ///
    /// New rows take activity and status from the listing, defaulting to
    /// active. Existing rows only get their head and rev refreshed; activity
    /// and status stay as the jobs left them.
    pub fn upsert_pds_repos(&self, pds: &str, listings: &[RepoListing]) -> Result<usize> {
        let now = OffsetDateTime::now_utc();
        let tx = self.db.begin_write()?;
        {
            let mut repos = tx.open_table(PDS_REPOS_TABLE)?;
            let mut by_shard = tx.open_table(PDS_REPOS_BY_SHARD_TABLE)?;
            for listing in listings {
                let existing: Option<PdsRepo> = match repos.get((pds, listing.did.as_str()))? {
                    Some(value) => Some(serde_json::from_slice(value.value())?),
                    None => None,
                };
                let row = match existing {
                    Some(mut row) => {
                        row.head = listing.head.clone();
                        row.rev = listing.rev.clone();
                        row.updated_at = now;
                        row
                    }
                    None => {
                        let did = listing.did.as_str();
                        by_shard.insert((did_shard(did), did, pds), ())?;
                        PdsRepo {
                            pds: pds.to_string(),
                            did: listing.did.clone(),
                            head: listing.head.clone(),
                            rev: listing.rev.clone(),
                            active: listing.active.unwrap_or(true),
                            status: listing.status.clone().unwrap_or_default(),
                            created_at: now,
                            updated_at: now,
                        }
                    }
                };
                let value = serde_json::to_vec(&row)?;
                repos.insert((pds, listing.did.as_str()), value.as_slice())?;
            }
        }
        tx.commit()?;
        Ok(listings.len())
    }

    pub fn pds_repo(&self, key: &RepoKey) -> Result<Option<PdsRepo>> {
        let tx = self.db.begin_read()?;
        let repos = tx.open_table(PDS_REPOS_TABLE)?;
        let Some(value) = repos.get((key.pds.as_str(), key.did.as_str()))? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(value.value())?))
    }

    /// Sets activity and status of a listing row. Missing rows are ignored.
    pub fn set_repo_status(&self, key: &RepoKey, active: bool, status: &str) -> Result<bool> {
        let tx = self.db.begin_write()?;
        let updated = {
            let mut repos = tx.open_table(PDS_REPOS_TABLE)?;
            let existing: Option<PdsRepo> =
                match repos.get((key.pds.as_str(), key.did.as_str()))? {
                    Some(value) => Some(serde_json::from_slice(value.value())?),
                    None => None,
                };
            match existing {
                Some(mut row) => {
                    row.active = active;
                    row.status = status.to_string();
                    row.updated_at = OffsetDateTime::now_utc();
                    let value = serde_json::to_vec(&row)?;
                    repos.insert((key.pds.as_str(), key.did.as_str()), value.as_slice())?;
                    true
                }
                None => false,
            }
        };
        tx.commit()?;
        Ok(updated)
    }

    pub fn account_repo(&self, did: &str) -> Result<Option<AccountRepo>> {
        let tx = self.db.begin_read()?;
        let syncs = tx.open_table(ACCOUNT_REPOS_TABLE)?;
        get_json(&syncs, did)
    }

    /// Records a sync attempt. `rev` replaces the stored rev when present;
    /// `changed` bumps the last-changed timestamp.
    pub fn record_repo_sync(&self, did: &str, rev: Option<&str>, changed: bool) -> Result<()> {
        let now = OffsetDateTime::now_utc();
        let tx = self.db.begin_write()?;
        {
            let mut syncs = tx.open_table(ACCOUNT_REPOS_TABLE)?;
            let mut row = get_json::<AccountRepo>(&syncs, did)?.unwrap_or_else(|| AccountRepo {
                did: did.to_string(),
                rev: None,
                last_changed: None,
                updated_at: now,
            });
            if let Some(rev) = rev {
                row.rev = Some(rev.to_string());
            }
            if changed {
                row.last_changed = Some(now);
            }
            row.updated_at = now;
            let value = serde_json::to_vec(&row)?;
            syncs.insert(did, value.as_slice())?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Stores a `describeRepo` result on the account's info row, creating
    /// the row if the account is not known from the PLC log.
    pub fn record_describe(&self, did: &str, pds: &str, describe: serde_json::Value) -> Result<()> {
        let now = OffsetDateTime::now_utc();
        let tx = self.db.begin_write()?;
        {
            let mut infos = tx.open_table(ACCOUNT_INFO_TABLE)?;
            let mut row = get_json::<AccountInfo>(&infos, did)?.unwrap_or_else(|| AccountInfo {
                did: did.to_string(),
                plc_timestamp: String::new(),
                pds: Some(pds.to_string()),
                handle: None,
                describe: None,
                described_at: None,
                created_at: now,
                updated_at: now,
            });
            row.describe = Some(describe);
            row.described_at = Some(now);
            row.updated_at = now;
            let value = serde_json::to_vec(&row)?;
            infos.insert(did, value.as_slice())?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Selects up to `limit` active listing rows after `after`, whose
    /// `target` row is missing or, given `resume`, last attempted before it.
    ///
    /// Rows come in [`BatchCursor`] order, which interleaves hosts.
    pub fn select_batch(
        &self,
        target: Target,
        after: Option<&BatchCursor>,
        resume: Option<OffsetDateTime>,
        limit: usize,
    ) -> Result<Batch> {
        let tx = self.db.begin_read()?;
        let repos = tx.open_table(PDS_REPOS_TABLE)?;
        let by_shard = tx.open_table(PDS_REPOS_BY_SHARD_TABLE)?;
        let infos = tx.open_table(ACCOUNT_INFO_TABLE)?;
        let syncs = tx.open_table(ACCOUNT_REPOS_TABLE)?;

        let range = match after {
            Some(cursor) => by_shard.range::<(u64, &str, &str)>((
                Bound::Excluded((cursor.shard, cursor.did.as_str(), cursor.pds.as_str())),
                Bound::Unbounded,
            ))?,
            None => by_shard.range::<(u64, &str, &str)>(..)?,
        };

        let mut batch = Batch::default();
        for item in range {
            if batch.rows.len() >= limit {
                break;
            }
            let (key, _) = item?;
            let (shard, did, pds) = key.value();
            batch.cursor = Some(BatchCursor {
                shard,
                did: did.to_string(),
                pds: pds.to_string(),
            });
            let Some(value) = repos.get((pds, did))? else {
                continue;
            };
            let row: PdsRepo = serde_json::from_slice(value.value())?;
            if !row.active {
                continue;
            }
            let last_attempt = match target {
                Target::Describe => {
                    get_json::<AccountInfo>(&infos, did)?.and_then(|info| info.described_at)
                }
                Target::RepoSync => get_json::<AccountRepo>(&syncs, did)?.map(|r| r.updated_at),
            };
            if is_eligible(last_attempt, resume) {
                batch.rows.push(row);
            }
        }
        Ok(batch)
    }

    /// Number of rows [`Self::select_batch`] would eventually return.
    pub fn count_eligible(&self, target: Target, resume: Option<OffsetDateTime>) -> Result<u64> {
        let mut count = 0;
        let mut after = None;
        loop {
            let batch = self.select_batch(target, after.as_ref(), resume, 10_000)?;
            count += batch.rows.len() as u64;
            match batch.cursor {
                Some(cursor) if after.as_ref() != Some(&cursor) => after = Some(cursor),
                _ => break,
            }
        }
        Ok(count)
    }
}

fn is_eligible(last_attempt: Option<OffsetDateTime>, resume: Option<OffsetDateTime>) -> bool {
    match (last_attempt, resume) {
        (None, _) => true,
        (Some(last), Some(marker)) => last < marker,
        (Some(_), None) => false,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use testresult::TestResult;
    use time::Duration;

    use super::*;

    fn listing(did: &str) -> RepoListing {
        RepoListing {
            did: did.to_string(),
            head: "bafyhead".to_string(),
            rev: "3kabc".to_string(),
            active: Some(true),
            status: None,
        }
    }

    fn seed(store: &Store, n: usize) -> Result<()> {
        let a: Vec<_> = (0..n).map(|i| listing(&format!("did:plc:a{i:03}"))).collect();
        let b: Vec<_> = (0..n).map(|i| listing(&format!("did:plc:b{i:03}"))).collect();
        store.upsert_pds_repos("https://a.example.com", &a)?;
        store.upsert_pds_repos("https://b.example.com", &b)?;
        Ok(())
    }

    #[test]
    fn listing_upsert_keeps_status() -> TestResult {
        let store = Store::in_memory()?;
        seed(&store, 1)?;
        let key = RepoKey::new("https://a.example.com", "did:plc:a000");
        assert!(store.set_repo_status(&key, false, "takendown")?);

        let mut relisted = listing("did:plc:a000");
        relisted.rev = "3kxyz".to_string();
        store.upsert_pds_repos("https://a.example.com", &[relisted])?;
        let row = store.pds_repo(&key)?.unwrap();
        assert_eq!(row.rev, "3kxyz");
        assert!(!row.active);
        assert_eq!(row.status, "takendown");

        assert!(!store.set_repo_status(&RepoKey::new("https://a.example.com", "nope"), true, "")?);
        Ok(())
    }

    #[test]
    fn pagination_covers_every_row_once() -> TestResult {
        let store = Store::in_memory()?;
        seed(&store, 10)?;
        let mut seen = Vec::new();
        let mut after = None;
        loop {
            let batch = store.select_batch(Target::RepoSync, after.as_ref(), None, 3)?;
            if batch.rows.is_empty() {
                break;
            }
            seen.extend(batch.rows.iter().map(|r| r.did.clone()));
            after = batch.cursor;
        }
        assert_eq!(seen.len(), 20);
        let mut dedup = seen.clone();
        dedup.sort();
        dedup.dedup();
        assert_eq!(dedup.len(), 20);
        assert_eq!(store.count_eligible(Target::RepoSync, None)?, 20);
        Ok(())
    }

    #[test]
    fn batches_mix_hosts() -> TestResult {
        let store = Store::in_memory()?;
        for host in ["https://a.example", "https://b.example", "https://c.example"] {
            let listings: Vec<_> = (0..10)
                .map(|i| listing(&format!("did:plc:{}{i:03}", &host[8..9])))
                .collect();
            store.upsert_pds_repos(host, &listings)?;
        }

        let mut after = None;
        let mut batches = 0;
        loop {
            let batch = store.select_batch(Target::RepoSync, after.as_ref(), None, 10)?;
            if batch.rows.is_empty() {
                break;
            }
            let hosts: BTreeSet<_> = batch.rows.iter().map(|r| r.pds.as_str()).collect();
            assert!(hosts.len() > 1, "batch {batches} only holds {hosts:?}");
            batches += 1;
            after = batch.cursor;
        }
        assert_eq!(batches, 3);
        Ok(())
    }

    #[test]
    fn scan_order_is_rebuilt_on_open() -> TestResult {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("mirror.redb");
        {
            let store = Store::persistent(&path)?;
            seed(&store, 3)?;
            let tx = store.db.begin_write()?;
            tx.delete_table(PDS_REPOS_BY_SHARD_TABLE)?;
            tx.commit()?;
        }
        let store = Store::persistent(&path)?;
        assert_eq!(store.count_eligible(Target::RepoSync, None)?, 6);
        Ok(())
    }

    #[test]
    fn selection_skips_processed_and_inactive() -> TestResult {
        let store = Store::in_memory()?;
        seed(&store, 2)?;
        store.record_repo_sync("did:plc:a000", Some("3kabc"), true)?;
        store.set_repo_status(&RepoKey::new("https://b.example.com", "did:plc:b000"), false, "notfound")?;

        let batch = store.select_batch(Target::RepoSync, None, None, 100)?;
        let mut dids: Vec<_> = batch.rows.iter().map(|r| r.did.as_str()).collect();
        dids.sort_unstable();
        assert_eq!(dids, vec!["did:plc:a001", "did:plc:b001"]);

        // the describe job tracks its own attempts
        let batch = store.select_batch(Target::Describe, None, None, 100)?;
        assert_eq!(batch.rows.len(), 3);
        store.record_describe("did:plc:a001", "https://a.example.com", serde_json::json!({}))?;
        assert_eq!(store.count_eligible(Target::Describe, None)?, 2);
        Ok(())
    }

    #[test]
    fn resume_marker_selects_stale_rows() -> TestResult {
        let store = Store::in_memory()?;
        seed(&store, 1)?;
        store.record_repo_sync("did:plc:a000", None, false)?;

        let past = OffsetDateTime::now_utc() - Duration::hours(1);
        assert_eq!(store.count_eligible(Target::RepoSync, Some(past))?, 1);

        let future = OffsetDateTime::now_utc() + Duration::hours(1);
        assert_eq!(store.count_eligible(Target::RepoSync, Some(future))?, 2);

        let row = store.account_repo("did:plc:a000")?.unwrap();
        assert_eq!(row.rev, None);
        assert_eq!(row.last_changed, None);
        Ok(())
    }
}
