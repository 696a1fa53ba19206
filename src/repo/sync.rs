//! Single-account sync pipeline.

use std::{collections::BTreeSet, path::PathBuf, str::FromStr};

use anyhow::{bail, Context, Result};
use cid::Cid;
use iroh_metrics::{inc, inc_by};
use tracing::{debug, info};

use super::{
    account_dir,
    blobs::{sync_blobs, BlobReport},
    index::RecordIndex,
    records::{project_records, Record},
    store::{load_local, merge_update, write_local, LocalRepo},
    BLOBS_DIR_NAME, CAR_FILE_NAME, INDEX_FILE_NAME,
};
use crate::{metrics::Metrics, session::AccountLocks, xrpc::XrpcClient};

/// A step of [`RepoSyncer::sync`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Phase {
    /// Fetch and merge the repository archive.
    Car,
    /// Project records into the record index.
    Index,
    /// Download missing blobs.
    Blobs,
}

/// Set of phases to run, parsed from a comma separated list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Phases {
    pub car: bool,
    pub index: bool,
    pub blobs: bool,
}

impl Phases {
    pub const ALL: Phases = Phases {
        car: true,
        index: true,
        blobs: true,
    };

    pub fn contains(&self, phase: Phase) -> bool {
        match phase {
            Phase::Car => self.car,
            Phase::Index => self.index,
            Phase::Blobs => self.blobs,
        }
    }
}

impl Default for Phases {
    fn default() -> Self {
        Self {
            car: true,
            index: false,
            blobs: false,
        }
    }
}

impl FromStr for Phases {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut phases = Phases {
            car: false,
            index: false,
            blobs: false,
        };
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            match Phase::from_str(part).with_context(|| format!("unknown phase {part:?}"))? {
                Phase::Car => phases.car = true,
                Phase::Index => phases.index = true,
                Phase::Blobs => phases.blobs = true,
            }
        }
        if !(phases.car || phases.index || phases.blobs) {
            bail!("no phases selected");
        }
        Ok(phases)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Revision of the local repository after the sync.
    pub rev: Option<String>,
    /// Whether new blocks were merged and written.
    pub changed: bool,
    pub bytes_fetched: usize,
    pub new_blocks: usize,
    pub records_indexed: usize,
    pub blobs: Option<BlobReport>,
}

/// Runs the sync pipeline against the local repository directory.
///
/// Syncs of the same account are serialized through the account locks.
#[derive(Debug, Clone)]
pub struct RepoSyncer {
    xrpc: XrpcClient,
    repos_root: PathBuf,
    locks: AccountLocks,
}

impl RepoSyncer {
    pub fn new(xrpc: XrpcClient, repos_root: PathBuf, locks: AccountLocks) -> Self {
        Self {
            xrpc,
            repos_root,
            locks,
        }
    }

    pub fn account_dir(&self, did: &str) -> PathBuf {
        account_dir(&self.repos_root, did)
    }

    /// Loads the local repository of `did`.
    pub async fn load(&self, did: &str) -> Result<LocalRepo> {
        let path = self.account_dir(did).join(CAR_FILE_NAME);
        Ok(load_local(&path).await?)
    }

    /// Syncs `did` from its hosting server `host`.
    pub async fn sync(&self, did: &str, host: &str, phases: Phases) -> Result<SyncReport> {
        let _guard = self.locks.lock(did).await;
        let dir = self.account_dir(did);
        let car_path = dir.join(CAR_FILE_NAME);

        let mut repo = load_local(&car_path)
            .await
            .with_context(|| format!("failed to load {}", car_path.display()))?;
        let mut report = SyncReport {
            rev: repo.rev.clone(),
            ..Default::default()
        };

        let prev_rev = repo.rev.clone();
        let mut new_blocks: Option<BTreeSet<Cid>> = None;
        if phases.car {
            let update = self
                .xrpc
                .get_repo(host, did, repo.rev.as_deref())
                .await?;
            report.bytes_fetched = update.len();
            inc_by!(Metrics, repo_bytes_fetched, update.len() as u64);

            match merge_update(&mut repo, &update).await? {
                Some(outcome) if !outcome.new_blocks.is_empty() => {
                    write_local(&car_path, &repo)
                        .await
                        .with_context(|| format!("failed to write {}", car_path.display()))?;
                    report.changed = true;
                    report.new_blocks = outcome.new_blocks.len();
                    report.rev = outcome.rev;
                    inc!(Metrics, repo_syncs);
                    inc_by!(Metrics, repo_blocks_merged, outcome.new_blocks.len() as u64);
                    new_blocks = Some(outcome.new_blocks);
                }
                _ => {
                    debug!(%did, "repository unchanged");
                    inc!(Metrics, repo_syncs_unchanged);
                }
            }
        }

        if phases.index {
            let path = dir.join(INDEX_FILE_NAME);
            let indexed = tokio::task::spawn_blocking(move || {
                index_records(&path, &repo, prev_rev.as_deref(), new_blocks.as_ref())
            })
            .await??;
            report.records_indexed = indexed;
            inc_by!(Metrics, repo_records_indexed, indexed as u64);
        }

        if phases.blobs {
            let blobs = sync_blobs(&self.xrpc, host, did, &dir.join(BLOBS_DIR_NAME)).await?;
            report.blobs = Some(blobs);
        }

        info!(
            %did,
            rev = report.rev.as_deref().unwrap_or_default(),
            changed = report.changed,
            bytes = report.bytes_fetched,
            records = report.records_indexed,
            "repository synced"
        );
        Ok(report)
    }
}

/// Brings the record index up to the archive's revision.
///
/// Only records in `new_blocks` are projected when the index was complete
/// for `prev_rev`, the revision the blocks were merged onto. An index lagging
/// further behind is rebuilt from the whole archive.
fn index_records(
    path: &std::path::Path,
    repo: &LocalRepo,
    prev_rev: Option<&str>,
    new_blocks: Option<&BTreeSet<Cid>>,
) -> Result<usize> {
    let Some(commit) = repo.commit()? else {
        return Ok(0);
    };
    let index = RecordIndex::open(path)?;
    let indexed_rev = index.indexed_rev()?;
    if indexed_rev.is_some() && indexed_rev == repo.rev {
        return Ok(0);
    }
    let only = match (indexed_rev.as_deref(), prev_rev) {
        (Some(indexed), Some(prev)) if indexed == prev => new_blocks,
        _ => None,
    };
    if only.is_none() {
        debug!(rev = ?repo.rev, ?indexed_rev, "indexing whole repository");
    }
    let records =
        project_records(&commit, &repo.blocks, only).collect::<Result<Vec<Record>, _>>()?;
    index.insert(&records, repo.rev.as_deref())
}
