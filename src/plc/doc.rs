//! Projection of an operation into a DID document.

use serde::{Deserialize, Serialize};
use url::Url;

use super::types::Op;

const DID_CONTEXT: &str = "https://www.w3.org/ns/did/v1";
const MULTIKEY_CONTEXT: &str = "https://w3id.org/security/multikey/v1";
const K256_CONTEXT: &str = "https://w3id.org/security/suites/secp256k1-2019/v1";
const P256_CONTEXT: &str = "https://w3id.org/security/suites/ecdsa-2019/v1";

/// Multibase prefixes of `did:key` values by curve.
const K256_PREFIX: &str = "zQ3s";
const P256_PREFIX: &str = "zDn";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DidDocument {
    #[serde(rename = "@context")]
    pub context: Vec<String>,
    pub id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub also_known_as: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub verification_method: Vec<VerificationMethod>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub service: Vec<DocumentService>,
}

impl DidDocument {
    /// Endpoint of the service with the given id fragment.
    pub fn service_endpoint(&self, id: &str) -> Option<&str> {
        self.service
            .iter()
            .find(|s| s.id.strip_prefix('#') == Some(id) || s.id.ends_with(&format!("#{id}")))
            .map(|s| s.service_endpoint.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationMethod {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub controller: String,
    pub public_key_multibase: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentService {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub service_endpoint: String,
}

#[derive(Debug, thiserror::Error)]
pub enum DocError {
    #[error("not a DID: {0:?}")]
    Did(String),
    #[error("alias {alias:?} is not a URI: {source}")]
    Alias {
        alias: String,
        #[source]
        source: url::ParseError,
    },
}

/// Builds the DID document for `did` in the state established by `op`.
pub fn make_doc(did: &str, op: &Op) -> Result<DidDocument, DocError> {
    if !did.starts_with("did:") {
        return Err(DocError::Did(did.to_string()));
    }
    for alias in &op.also_known_as {
        Url::parse(alias).map_err(|source| DocError::Alias {
            alias: alias.clone(),
            source,
        })?;
    }

    let mut context = vec![DID_CONTEXT.to_string(), MULTIKEY_CONTEXT.to_string()];
    let mut verification_method = Vec::with_capacity(op.verification_methods.len());
    for (fragment, key) in &op.verification_methods {
        let multibase = key.strip_prefix("did:key:").unwrap_or(key);
        let key_context = if multibase.starts_with(K256_PREFIX) {
            Some(K256_CONTEXT)
        } else if multibase.starts_with(P256_PREFIX) {
            Some(P256_CONTEXT)
        } else {
            None
        };
        if let Some(c) = key_context {
            if !context.iter().any(|existing| existing == c) {
                context.push(c.to_string());
            }
        }
        verification_method.push(VerificationMethod {
            id: format!("{did}#{fragment}"),
            kind: "Multikey".to_string(),
            controller: did.to_string(),
            public_key_multibase: multibase.to_string(),
        });
    }

    let service = op
        .services
        .iter()
        .map(|(id, s)| DocumentService {
            id: format!("#{id}"),
            kind: s.kind.clone(),
            service_endpoint: s.endpoint.clone(),
        })
        .collect();

    Ok(DidDocument {
        context,
        id: did.to_string(),
        also_known_as: op.also_known_as.clone(),
        verification_method,
        service,
    })
}
