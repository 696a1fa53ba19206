use cid::Cid;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use super::RepoError;

/// Signed root of a repository snapshot.
///
/// Fields are declared in DAG-CBOR key order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub did: String,
    pub rev: String,
    pub sig: ByteBuf,
    /// Root of the record tree.
    pub data: Cid,
    pub prev: Option<Cid>,
    pub version: u64,
}

impl Commit {
    pub fn decode(cid: Cid, bytes: &[u8]) -> Result<Self, RepoError> {
        serde_ipld_dagcbor::from_slice(bytes).map_err(|source| RepoError::Decode {
            cid,
            kind: "commit",
            source,
        })
    }
}
