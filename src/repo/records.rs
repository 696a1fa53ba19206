//! Projection of a repository snapshot into decoded records.

use std::collections::BTreeSet;

use cid::Cid;
use data_encoding::BASE64_NOPAD;
use ipld_core::ipld::Ipld;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{mst::MstWalk, store::BlockMap, Commit, RepoError};
use crate::plc::is_valid_did;

/// A record of a repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub collection: String,
    pub rkey: String,
    pub cid: Cid,
    pub value: Value,
}

/// A reference from a record to another account or record.
///
/// Bare account references have an empty `collection` and `rkey`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordRef {
    pub did: String,
    pub collection: String,
    pub rkey: String,
}

/// Lazy sequence of the records reachable from a commit, in key order.
#[derive(Debug)]
pub struct Records<'a> {
    walk: MstWalk<'a>,
    blocks: &'a BlockMap,
    only: Option<&'a BTreeSet<Cid>>,
}

/// Walks the record tree of `commit`.
///
/// With `only` set, records whose value block is not in the set are skipped;
/// pass the `new_blocks` of a merge to project just what it added.
pub fn project_records<'a>(
    commit: &Commit,
    blocks: &'a BlockMap,
    only: Option<&'a BTreeSet<Cid>>,
) -> Records<'a> {
    Records {
        walk: MstWalk::new(blocks, commit.data),
        blocks,
        only,
    }
}

impl Records<'_> {
    fn decode(&self, path: String, cid: Cid) -> Result<Record, RepoError> {
        let Some((collection, rkey)) = path.split_once('/') else {
            return Err(RepoError::InvalidPath(path));
        };
        let bytes = self.blocks.get(&cid).ok_or(RepoError::MissingBlock(cid))?;
        let ipld: Ipld = serde_ipld_dagcbor::from_slice(bytes).map_err(|source| RepoError::Decode {
            cid,
            kind: "record",
            source,
        })?;
        Ok(Record {
            collection: collection.to_string(),
            rkey: rkey.to_string(),
            cid,
            value: ipld_to_json(ipld),
        })
    }
}

impl Iterator for Records<'_> {
    type Item = Result<Record, RepoError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (path, cid) = match self.walk.next()? {
                Ok(leaf) => leaf,
                Err(err) => return Some(Err(err)),
            };
            if self.only.is_some_and(|only| !only.contains(&cid)) {
                continue;
            }
            return Some(self.decode(path, cid));
        }
    }
}

/// Converts a decoded block to JSON, using the `$link` and `$bytes`
/// conventions for CIDs and byte strings.
pub fn ipld_to_json(ipld: Ipld) -> Value {
    match ipld {
        Ipld::Null => Value::Null,
        Ipld::Bool(b) => Value::Bool(b),
        Ipld::Integer(i) => match i64::try_from(i) {
            Ok(i) => Value::from(i),
            Err(_) => Value::String(i.to_string()),
        },
        Ipld::Float(f) => serde_json::Number::from_f64(f).map_or(Value::Null, Value::Number),
        Ipld::String(s) => Value::String(s),
        Ipld::Bytes(b) => {
            let mut obj = Map::new();
            obj.insert("$bytes".to_string(), Value::String(BASE64_NOPAD.encode(&b)));
            Value::Object(obj)
        }
        Ipld::List(items) => Value::Array(items.into_iter().map(ipld_to_json).collect()),
        Ipld::Map(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, ipld_to_json(v)))
                .collect(),
        ),
        Ipld::Link(cid) => {
            let mut obj = Map::new();
            obj.insert("$link".to_string(), Value::String(cid.to_string()));
            Value::Object(obj)
        }
    }
}

/// Collects the accounts and records a record value refers to.
///
/// `at://` URIs with a DID authority yield record references; strings that
/// are DIDs yield account references.
pub fn extract_refs(value: &Value) -> BTreeSet<RecordRef> {
    let mut refs = BTreeSet::new();
    collect_refs(value, &mut refs);
    refs
}

fn collect_refs(value: &Value, refs: &mut BTreeSet<RecordRef>) {
    match value {
        Value::String(s) => {
            if let Some(r) = parse_ref(s) {
                refs.insert(r);
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_refs(v, refs)),
        Value::Object(map) => map.values().for_each(|v| collect_refs(v, refs)),
        _ => {}
    }
}

fn parse_ref(s: &str) -> Option<RecordRef> {
    if let Some(uri) = s.strip_prefix("at://") {
        let mut parts = uri.splitn(3, '/');
        let did = parts.next().filter(|d| is_valid_did(d))?;
        return Some(RecordRef {
            did: did.to_string(),
            collection: parts.next().unwrap_or_default().to_string(),
            rkey: parts.next().unwrap_or_default().to_string(),
        });
    }
    is_valid_did(s).then(|| RecordRef {
        did: s.to_string(),
        collection: String::new(),
        rkey: String::new(),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use multihash_codetable::{Code, MultihashDigest};
    use serde_json::json;

    use super::*;
    use crate::{car::DAG_CBOR, test_utils::RepoBuilder};

    #[test]
    fn json_conventions() {
        let cid = Cid::new_v1(DAG_CBOR, Code::Sha2_256.digest(b"blob"));
        let ipld = Ipld::Map(BTreeMap::from([
            ("blob".to_string(), Ipld::Link(cid)),
            ("raw".to_string(), Ipld::Bytes(vec![1, 2, 3])),
            ("n".to_string(), Ipld::Integer(7)),
            ("big".to_string(), Ipld::Integer(i128::MAX)),
            ("list".to_string(), Ipld::List(vec![Ipld::Null, Ipld::Bool(true)])),
        ]));
        assert_eq!(
            ipld_to_json(ipld),
            json!({
                "blob": {"$link": cid.to_string()},
                "raw": {"$bytes": "AQID"},
                "n": 7,
                "big": i128::MAX.to_string(),
                "list": [null, true],
            })
        );
    }

    #[test]
    fn refs_from_uris_and_dids() {
        let value = json!({
            "subject": {"uri": "at://did:plc:bob/app.bsky.feed.post/3kx", "cid": "bafy"},
            "facets": [{"features": [{"did": "did:plc:carol"}]}],
            "list": "at://did:plc:dave/app.bsky.graph.list",
            "text": "hello did:plc:nope",
            "handle": "at://bob.test/app.bsky.feed.post/1",
        });
        let refs: Vec<_> = extract_refs(&value).into_iter().collect();
        assert_eq!(
            refs,
            vec![
                RecordRef {
                    did: "did:plc:bob".to_string(),
                    collection: "app.bsky.feed.post".to_string(),
                    rkey: "3kx".to_string(),
                },
                RecordRef {
                    did: "did:plc:carol".to_string(),
                    collection: String::new(),
                    rkey: String::new(),
                },
                RecordRef {
                    did: "did:plc:dave".to_string(),
                    collection: "app.bsky.graph.list".to_string(),
                    rkey: String::new(),
                },
            ]
        );
    }

    #[test]
    fn projection_and_delta() {
        let mut builder = RepoBuilder::new("did:plc:alice");
        builder.record("app.bsky.feed.post", "3ka", json!({"text": "a"}));
        builder.record("app.bsky.feed.post", "3kb", json!({"text": "b"}));
        let (_, commit, blocks) = builder.build("3k1");

        let all: Vec<Record> = project_records(&commit, &blocks, None)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].collection, "app.bsky.feed.post");
        assert_eq!(all[0].rkey, "3ka");
        assert_eq!(all[0].value, json!({"text": "a"}));

        let only = BTreeSet::from([all[1].cid]);
        let delta: Vec<Record> = project_records(&commit, &blocks, Some(&only))
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(delta.len(), 1);
        assert_eq!(delta[0].rkey, "3kb");
    }
}
