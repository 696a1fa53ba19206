//! Merkle search tree nodes and the in-order walk over them.

use cid::Cid;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use super::{store::BlockMap, RepoError};

/// A tree node as stored in a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeData {
    /// Entries in key order.
    pub e: Vec<TreeEntry>,
    /// Subtree with keys below the first entry.
    pub l: Option<Cid>,
}

/// One key of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    /// Key suffix after the shared prefix.
    pub k: ByteBuf,
    /// Length of the prefix shared with the previous key in the node.
    pub p: u64,
    /// Subtree with keys between this entry and the next.
    pub t: Option<Cid>,
    /// Value of the key.
    pub v: Cid,
}

impl NodeData {
    pub fn decode(cid: Cid, bytes: &[u8]) -> Result<Self, RepoError> {
        serde_ipld_dagcbor::from_slice(bytes).map_err(|source| RepoError::Decode {
            cid,
            kind: "tree node",
            source,
        })
    }
}

enum Frame {
    Node(Cid),
    Leaf(String, Cid),
}

/// Lazy in-order walk yielding every `(key, value)` of a tree.
///
/// Keys come out in ascending order. Only the path to the current position
/// is held in memory.
pub struct MstWalk<'a> {
    blocks: &'a BlockMap,
    stack: Vec<Frame>,
}

impl std::fmt::Debug for MstWalk<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MstWalk")
            .field("pending", &self.stack.len())
            .finish()
    }
}

impl<'a> MstWalk<'a> {
    pub fn new(blocks: &'a BlockMap, root: Cid) -> Self {
        Self {
            blocks,
            stack: vec![Frame::Node(root)],
        }
    }

    fn expand(&mut self, cid: Cid) -> Result<(), RepoError> {
        let bytes = self.blocks.get(&cid).ok_or(RepoError::MissingBlock(cid))?;
        let node = NodeData::decode(cid, bytes)?;

        let mut frames = Vec::with_capacity(node.e.len() * 2 + 1);
        if let Some(left) = node.l {
            frames.push(Frame::Node(left));
        }
        let mut key: Vec<u8> = Vec::new();
        for entry in node.e {
            let prefix = usize::try_from(entry.p).unwrap_or(usize::MAX);
            if prefix > key.len() {
                return Err(RepoError::InvalidPath(format!(
                    "prefix {prefix} longer than previous key in node {cid}"
                )));
            }
            key.truncate(prefix);
            key.extend_from_slice(&entry.k);
            let path = String::from_utf8(key.clone())
                .map_err(|e| RepoError::InvalidPath(String::from_utf8_lossy(e.as_bytes()).into_owned()))?;
            frames.push(Frame::Leaf(path, entry.v));
            if let Some(tree) = entry.t {
                frames.push(Frame::Node(tree));
            }
        }
        self.stack.extend(frames.into_iter().rev());
        Ok(())
    }
}

impl Iterator for MstWalk<'_> {
    type Item = Result<(String, Cid), RepoError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.stack.pop()? {
                Frame::Leaf(key, value) => return Some(Ok((key, value))),
                Frame::Node(cid) => {
                    if let Err(err) = self.expand(cid) {
                        self.stack.clear();
                        return Some(Err(err));
                    }
                }
            }
        }
    }
}
