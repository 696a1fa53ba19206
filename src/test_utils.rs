//! Internal utilities to support testing.

use std::collections::BTreeMap;

use anyhow::Result;
use cid::Cid;
use multihash_codetable::{Code, MultihashDigest};
use serde::Serialize;
use serde_bytes::ByteBuf;
use tokio::net::TcpListener;
use tokio_util::task::AbortOnDropHandle;
use url::Url;

use crate::{
    car::{CarHeader, CarWriter, DAG_CBOR},
    repo::{BlockMap, Commit, NodeData, TreeEntry},
};

/// Serves `app` on a random local port until the returned handle is dropped.
pub async fn spawn_server(app: axum::Router) -> Result<(Url, AbortOnDropHandle<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let task = tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    let url = Url::parse(&format!("http://{addr}/"))?;
    Ok((url, AbortOnDropHandle::new(task)))
}

/// Encodes `value` as DAG-CBOR and stores it under its CID.
pub fn put_block<T: Serialize>(blocks: &mut BlockMap, value: &T) -> Cid {
    let bytes = serde_ipld_dagcbor::to_vec(value).expect("encodable block");
    let cid = Cid::new_v1(DAG_CBOR, Code::Sha2_256.digest(&bytes));
    blocks.insert(cid, bytes.into());
    cid
}

/// Builds small repositories: one tree node holding every record.
#[derive(Debug, Clone)]
pub struct RepoBuilder {
    did: String,
    records: BTreeMap<String, serde_json::Value>,
    prev: Option<Cid>,
}

impl RepoBuilder {
    pub fn new(did: &str) -> Self {
        Self {
            did: did.to_string(),
            records: BTreeMap::new(),
            prev: None,
        }
    }

    pub fn record(&mut self, collection: &str, rkey: &str, value: serde_json::Value) -> &mut Self {
        self.records.insert(format!("{collection}/{rkey}"), value);
        self
    }

    pub fn prev(&mut self, prev: Cid) -> &mut Self {
        self.prev = Some(prev);
        self
    }

    /// Returns the commit CID, the commit and every block of the repository.
    pub fn build(&self, rev: &str) -> (Cid, Commit, BlockMap) {
        let mut blocks = BlockMap::new();
        let mut entries = Vec::with_capacity(self.records.len());
        let mut last: &[u8] = &[];
        for (key, value) in &self.records {
            let v = put_block(&mut blocks, value);
            let key = key.as_bytes();
            let shared = last
                .iter()
                .zip(key)
                .take_while(|(a, b)| a == b)
                .count();
            entries.push(TreeEntry {
                k: ByteBuf::from(key[shared..].to_vec()),
                p: shared as u64,
                t: None,
                v,
            });
            last = key;
        }
        let data = put_block(&mut blocks, &NodeData { e: entries, l: None });
        let commit = Commit {
            did: self.did.clone(),
            rev: rev.to_string(),
            sig: ByteBuf::from(vec![0u8; 64]),
            data,
            prev: self.prev,
            version: 3,
        };
        let root = put_block(&mut blocks, &commit);
        (root, commit, blocks)
    }
}

/// A CARv1 archive with `root` and every block.
pub async fn car_bytes(root: Cid, blocks: &BlockMap) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut writer = CarWriter::new(CarHeader::new_v1(vec![root]), &mut out);
    for (cid, data) in blocks {
        writer.write(*cid, data).await?;
    }
    writer.finish().await?;
    Ok(out)
}

/// One export line holding a `plc_operation` hosted on `https://pds.example.com`.
pub fn plc_line(did: &str, cid: &str, created_at: &str, handle: &str) -> String {
    serde_json::json!({
        "did": did,
        "operation": {
            "type": "plc_operation",
            "rotationKeys": ["did:key:zQ3shhCGUqDKjStzuDxPkTxN6ujddP4RkEKJJouJGRRkaLGbg"],
            "verificationMethods": {
                "atproto": "did:key:zQ3shXjHeiBuRCKmM36cuYnm7YEMzhGnCmCyW92sRJ9pribSF"
            },
            "alsoKnownAs": [format!("at://{handle}")],
            "services": {
                "atproto_pds": {
                    "type": "AtprotoPersonalDataServer",
                    "endpoint": "https://pds.example.com"
                }
            },
            "prev": null,
            "sig": "c2lnbmF0dXJl"
        },
        "cid": cid,
        "nullified": false,
        "createdAt": created_at,
    })
    .to_string()
}
