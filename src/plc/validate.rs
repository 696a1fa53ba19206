//! Structural checks on log entries.
//!
//! [`Validator::check`] is the gate applied by the mirror before storing an
//! entry. [`Validator::annotate`] is the stricter offline variant that reports
//! every violation as a short code instead of stopping at the first.

use std::sync::LazyLock;

use regex::Regex;
use url::Url;

use super::{
    doc::{make_doc, DidDocument, DocError},
    types::OperationLogEntry,
};

/// Maximum length of a handle.
pub const MAX_HANDLE_LEN: usize = 253;

/// Annotation stops reporting aliases after this many bad ones.
const MAX_ALIAS_ERRORS: usize = 3;

static HANDLE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^([a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?\.)+[a-zA-Z]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?$",
    )
    .expect("valid handle regex")
});

static DID_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^did:[a-z]+:[a-zA-Z0-9._:%-]*[a-zA-Z0-9._-]$").expect("valid did regex")
});

/// Whether `handle` is a syntactically valid handle.
pub fn is_valid_handle(handle: &str) -> bool {
    handle.len() <= MAX_HANDLE_LEN && HANDLE_REGEX.is_match(handle)
}

/// Whether `did` is a syntactically valid DID.
pub fn is_valid_did(did: &str) -> bool {
    did.len() <= 2048 && DID_REGEX.is_match(did)
}

/// Why an entry was not stored.
#[derive(Debug, thiserror::Error)]
pub enum Rejection {
    #[error("empty DID")]
    EmptyDid,
    #[error("invalid handle {0:?}")]
    InvalidHandle(String),
    #[error("invalid PDS endpoint {0:?}")]
    InvalidEndpoint(String),
    #[error("denylisted PDS endpoint {0:?}")]
    Denylisted(String),
    #[error("cannot derive DID document: {0}")]
    Document(#[from] DocError),
}

#[derive(Debug, Clone, Default)]
pub struct Validator {
    denylist: Vec<String>,
}

impl Validator {
    pub fn new(denylist: impl IntoIterator<Item = String>) -> Self {
        let mut denylist: Vec<String> = denylist
            .into_iter()
            .map(|s| s.trim_end_matches('/').to_string())
            .collect();
        denylist.sort();
        denylist.dedup();
        Self { denylist }
    }

    pub fn is_denied(&self, endpoint: &str) -> bool {
        self.denylist
            .binary_search_by(|d| d.as_str().cmp(endpoint.trim_end_matches('/')))
            .is_ok()
    }

    /// Checks an entry and derives its DID document.
    ///
    /// The nullified flag plays no role here.
    pub fn check(&self, entry: &OperationLogEntry) -> Result<DidDocument, Rejection> {
        if entry.did.is_empty() {
            return Err(Rejection::EmptyDid);
        }
        let op = entry.operation.unsigned_op();
        if let Some(aka) = op.also_known_as.first() {
            let valid = aka
                .strip_prefix("at://")
                .is_some_and(is_valid_handle);
            if !valid {
                return Err(Rejection::InvalidHandle(aka.clone()));
            }
        }
        if let Some(endpoint) = op.pds_endpoint() {
            if Url::parse(endpoint).is_err() {
                return Err(Rejection::InvalidEndpoint(endpoint.to_string()));
            }
            if self.is_denied(endpoint) {
                return Err(Rejection::Denylisted(endpoint.to_string()));
            }
        }
        Ok(make_doc(&entry.did, &op)?)
    }

    /// Lists every rule the entry violates, as short codes.
    ///
    /// The result only depends on the entry and the denylist.
    pub fn annotate(&self, entry: &OperationLogEntry) -> Vec<String> {
        let mut notes = Vec::new();
        if !is_valid_did(&entry.did) {
            notes.push("DID:parse".to_string());
        }

        let op = entry.operation.unsigned_op();
        let mut bad = 0;
        for (i, aka) in op.also_known_as.iter().enumerate() {
            if bad > MAX_ALIAS_ERRORS {
                notes.push("HDL:too-many-errs".to_string());
                break;
            }
            let code = match aka.strip_prefix("at://") {
                None => "no-at",
                Some("") => "empty",
                Some(h) if h.starts_with("data:x") => "data-x",
                Some(h) if h.len() > MAX_HANDLE_LEN => "length",
                Some(h) if !HANDLE_REGEX.is_match(h) => "regex",
                Some(_) => continue,
            };
            notes.push(format!("HDL:{i}:{code}"));
            bad += 1;
        }

        match op.pds_endpoint() {
            Some(endpoint) => {
                if self.is_denied(endpoint) {
                    notes.push("PDS:known-bad".to_string());
                }
                match Url::parse(endpoint) {
                    Err(_) => notes.push("PDS:parse".to_string()),
                    Ok(url) if !is_canonical_endpoint(endpoint, &url) => {
                        notes.push("PDS:not-canonical".to_string())
                    }
                    Ok(_) => {}
                }
            }
            None => notes.push("PDS:not-set".to_string()),
        }

        if notes.is_empty() {
            match make_doc(&entry.did, &op) {
                Err(_) => notes.push("DOC:make-doc".to_string()),
                Ok(doc) => {
                    if serde_json::to_vec(&doc).is_err() {
                        notes.push("DOC:marshal".to_string());
                    }
                }
            }
        }
        notes
    }
}

/// `https://host` with nothing else: no port, path, query, fragment or credentials.
fn is_canonical_endpoint(raw: &str, url: &Url) -> bool {
    url.scheme() == "https"
        && url.path() == "/"
        && !raw.ends_with('/')
        && url.query().is_none()
        && url.fragment().is_none()
        && url.port().is_none()
        && !has_explicit_port(raw)
        && url.username().is_empty()
        && url.password().is_none()
}

/// Whether the authority of `raw` spells out a port. Parsed urls drop default
/// ports, so this looks at the text.
fn has_explicit_port(raw: &str) -> bool {
    let Some((_, rest)) = raw.split_once("://") else {
        return false;
    };
    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let host_port = authority.rsplit_once('@').map_or(authority, |(_, hp)| hp);
    let after_host = match host_port.strip_prefix('[') {
        Some(v6) => v6.split_once(']').map_or("", |(_, rest)| rest),
        None => host_port,
    };
    after_host.contains(':')
}
