use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::plc::{Operation, OperationLogEntry};

/// A stored PLC log entry.
///
/// Only `notes` and `issues` change after insertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntryRow {
    pub id: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub did: String,
    pub cid: String,
    pub plc_timestamp: String,
    pub nullified: bool,
    pub operation: Operation,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub issues: u32,
}

/// Latest known identity state of an account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub did: String,
    /// Protocol timestamp of the operation this row reflects.
    pub plc_timestamp: String,
    pub pds: Option<String>,
    pub handle: Option<String>,
    /// Raw `describeRepo` output.
    #[serde(default)]
    pub describe: Option<serde_json::Value>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub described_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Identity state derived from one log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountInfoUpdate {
    pub did: String,
    pub plc_timestamp: String,
    pub pds: Option<String>,
    pub handle: Option<String>,
}

impl From<&OperationLogEntry> for AccountInfoUpdate {
    fn from(entry: &OperationLogEntry) -> Self {
        let op = entry.operation.unsigned_op();
        Self {
            did: entry.did.clone(),
            plc_timestamp: entry.created_at.clone(),
            pds: op.pds_endpoint().map(str::to_string),
            handle: op.handle().map(str::to_string),
        }
    }
}

/// Key of a [`PdsRepo`] row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, derive_more::Display)]
#[display("{pds} {did}")]
pub struct RepoKey {
    pub pds: String,
    pub did: String,
}

impl RepoKey {
    pub fn new(pds: impl Into<String>, did: impl Into<String>) -> Self {
        Self {
            pds: pds.into(),
            did: did.into(),
        }
    }
}

/// A repository as listed by its hosting server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PdsRepo {
    pub pds: String,
    pub did: String,
    pub head: String,
    pub rev: String,
    /// Inactive rows are skipped by batch selection.
    pub active: bool,
    /// Why the row is inactive, empty otherwise.
    pub status: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl PdsRepo {
    pub fn key(&self) -> RepoKey {
        RepoKey::new(&self.pds, &self.did)
    }
}

/// One entry of a host's repository listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoListing {
    pub did: String,
    #[serde(default)]
    pub head: String,
    #[serde(default)]
    pub rev: String,
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub status: Option<String>,
}

/// Local sync state of an account repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountRepo {
    pub did: String,
    pub rev: Option<String>,
    /// Last time a sync brought new data.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_changed: Option<OffsetDateTime>,
    /// Last sync attempt.
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Tracking relation a batch job records its attempts in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum Target {
    /// `describeRepo` results on account info.
    Describe,
    /// Repository sync state.
    RepoSync,
}

/// Position of a listing row in batch selection order.
///
/// Rows are scanned by a hash of their did, so neighbouring rows belong to
/// unrelated hosts.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct BatchCursor {
    pub shard: u64,
    pub did: String,
    pub pds: String,
}

/// Selection order key of a did.
pub fn did_shard(did: &str) -> u64 {
    let hash = blake3::hash(did.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&hash.as_bytes()[..8]);
    u64::from_be_bytes(prefix)
}

/// A page of work selected from [`super::tables::PDS_REPOS_TABLE`].
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub rows: Vec<PdsRepo>,
    /// Last position scanned. The next page starts after it.
    pub cursor: Option<BatchCursor>,
}
