//! Local mirror of account repositories.
//!
//! Each account has its own directory below the repository root:
//!
//! - `repo.car`: every block ever merged for the account, with the current
//!   commit as the declared root.
//! - `records.redb`: the projected records and the references they contain.
//! - `blobs/<cid>`: downloaded blobs.

use std::{
    convert::Infallible,
    path::{Path, PathBuf},
};

use cid::Cid;

mod blobs;
mod commit;
mod index;
mod mst;
mod records;
mod store;
mod sync;

pub use self::{
    blobs::{sync_blobs, BlobReport},
    commit::Commit,
    index::RecordIndex,
    mst::{MstWalk, NodeData, TreeEntry},
    records::{extract_refs, ipld_to_json, project_records, Record, RecordRef, Records},
    store::{load_local, merge_update, write_local, BlockMap, LocalRepo, MergeOutcome},
    sync::{Phase, Phases, RepoSyncer, SyncReport},
};

pub const CAR_FILE_NAME: &str = "repo.car";
pub const INDEX_FILE_NAME: &str = "records.redb";
pub const BLOBS_DIR_NAME: &str = "blobs";

/// Directory holding everything mirrored for `did`.
pub fn account_dir(repos_root: &Path, did: &str) -> PathBuf {
    repos_root.join(did)
}

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error(transparent)]
    Car(#[from] crate::car::Error),
    #[error("block {cid} is not a valid {kind}: {source}")]
    Decode {
        cid: Cid,
        kind: &'static str,
        #[source]
        source: serde_ipld_dagcbor::DecodeError<Infallible>,
    },
    #[error("missing block {0}")]
    MissingBlock(Cid),
    #[error("invalid record path {0:?}")]
    InvalidPath(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
