//! Incremental merge of repository exports into a local block map.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::Path,
};

use bytes::Bytes;
use cid::Cid;
use futures_util::TryStreamExt;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, warn};

use super::{commit::Commit, RepoError};
use crate::car::{CarHeader, CarReader, CarWriter};

/// Blocks of a repository by CID.
pub type BlockMap = BTreeMap<Cid, Bytes>;

/// A repository snapshot held in memory.
#[derive(Debug, Clone, Default)]
pub struct LocalRepo {
    /// CID of the current commit.
    pub root: Option<Cid>,
    pub blocks: BlockMap,
    /// Revision of the current commit.
    pub rev: Option<String>,
}

impl LocalRepo {
    /// Decodes the current commit.
    pub fn commit(&self) -> Result<Option<Commit>, RepoError> {
        let Some(root) = self.root else {
            return Ok(None);
        };
        let bytes = self.blocks.get(&root).ok_or(RepoError::MissingBlock(root))?;
        Commit::decode(root, bytes).map(Some)
    }
}

/// Result of merging a non-empty update.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub root: Cid,
    pub rev: Option<String>,
    /// Blocks the update added.
    pub new_blocks: BTreeSet<Cid>,
}

/// Reads a local archive.
///
/// A missing file yields an empty repository. The revision comes from the
/// declared root commit.
pub async fn load_local(path: &Path) -> Result<LocalRepo, RepoError> {
    let file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no local repository");
            return Ok(LocalRepo::default());
        }
        Err(err) => return Err(err.into()),
    };
    let reader = CarReader::new(tokio::io::BufReader::new(file)).await?;
    let root = reader.header().root();
    let blocks: BlockMap = reader
        .stream()
        .map_ok(|(cid, data)| (cid, Bytes::from(data)))
        .try_collect()
        .await?;

    let mut repo = LocalRepo {
        root,
        blocks,
        rev: None,
    };
    match repo.commit() {
        Ok(commit) => repo.rev = commit.map(|c| c.rev),
        Err(err) => warn!(path = %path.display(), "local repository has no readable commit: {err}"),
    }
    Ok(repo)
}

/// Merges an exported archive into `repo`.
///
/// Returns `None` if the update is empty or declares no root. Otherwise the
/// repository takes the update's root as its current commit and every block
/// not yet present is added. Merging the same update twice yields an empty
/// `new_blocks` the second time.
///
/// A malformed archive leaves `repo` untouched.
pub async fn merge_update(
    repo: &mut LocalRepo,
    update: &[u8],
) -> Result<Option<MergeOutcome>, RepoError> {
    if update.is_empty() {
        return Ok(None);
    }
    let reader = CarReader::new(update).await?;
    let Some(root) = reader.header().root() else {
        return Ok(None);
    };
    let incoming: Vec<(Cid, Vec<u8>)> = reader.stream().try_collect().await?;

    let mut new_blocks = BTreeSet::new();
    for (cid, data) in incoming {
        if !repo.blocks.contains_key(&cid) {
            new_blocks.insert(cid);
            repo.blocks.insert(cid, Bytes::from(data));
        }
    }
    repo.root = Some(root);
    match repo.commit() {
        Ok(commit) => repo.rev = commit.map(|c| c.rev),
        Err(err) => {
            warn!(%root, "update root is not a readable commit: {err}");
            repo.rev = None;
        }
    }
    Ok(Some(MergeOutcome {
        root,
        rev: repo.rev.clone(),
        new_blocks,
    }))
}

/// Writes the whole repository to `path`, replacing it atomically.
pub async fn write_local(path: &Path, repo: &LocalRepo) -> Result<(), RepoError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = std::path::PathBuf::from(tmp);

    let file = tokio::fs::File::create(&tmp).await?;
    let header = CarHeader::new_v1(repo.root.into_iter().collect());
    let mut writer = CarWriter::new(header, BufWriter::new(file));
    for (cid, data) in &repo.blocks {
        writer.write(*cid, data).await?;
    }
    let mut file = writer.finish().await?;
    file.flush().await?;
    file.into_inner().sync_all().await?;

    tokio::fs::rename(&tmp, path).await?;
    debug!(path = %path.display(), blocks = repo.blocks.len(), "wrote local repository");
    Ok(())
}
