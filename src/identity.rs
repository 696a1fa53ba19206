//! Resolution of handles and DIDs to an account and its hosting server.

use anyhow::{anyhow, bail, Context, Result};
use tracing::debug;
use url::Url;

use crate::{
    db::Store,
    plc::{is_valid_did, is_valid_handle, DidDocument, PDS_SERVICE_ID},
    proxy::Proxy,
};

/// A resolved account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub did: String,
    /// Endpoint of the hosting server.
    pub pds: String,
}

/// Looks accounts up in the local store first and asks the network only for
/// what the store does not know.
#[derive(Debug, Clone)]
pub struct Resolver {
    store: Store,
    proxy: Proxy,
    plc_upstream: Url,
}

impl Resolver {
    pub fn new(store: Store, proxy: Proxy, plc_upstream: Url) -> Self {
        Self {
            store,
            proxy,
            plc_upstream,
        }
    }

    /// Resolves a handle or DID.
    pub async fn resolve(&self, input: &str) -> Result<Account> {
        let input = input.trim().trim_start_matches('@');
        let did = if input.starts_with("did:") {
            if !is_valid_did(input) {
                bail!("invalid DID {input:?}");
            }
            input.to_string()
        } else {
            self.resolve_handle(input).await?
        };
        let pds = self.resolve_pds(&did).await?;
        debug!(%did, %pds, "account resolved");
        Ok(Account { did, pds })
    }

    /// The DID currently using `handle`.
    pub async fn resolve_handle(&self, handle: &str) -> Result<String> {
        if !is_valid_handle(handle) {
            bail!("invalid handle {handle:?}");
        }
        if let Some(did) = self.store.did_for_handle(handle)? {
            return Ok(did);
        }
        let url = Url::parse(&format!("https://{handle}/.well-known/atproto-did"))?;
        let body = self.fetch(url).await?;
        let did = String::from_utf8(body.to_vec())
            .context("handle resolution returned non-utf8 data")?
            .trim()
            .to_string();
        if !is_valid_did(&did) {
            bail!("handle {handle} resolved to invalid DID {did:?}");
        }
        Ok(did)
    }

    /// The hosting server of `did`.
    pub async fn resolve_pds(&self, did: &str) -> Result<String> {
        if let Some(pds) = self.store.account_info(did)?.and_then(|info| info.pds) {
            return Ok(pds);
        }
        let doc = self.did_document(did).await?;
        doc.service_endpoint(PDS_SERVICE_ID)
            .map(str::to_string)
            .ok_or_else(|| anyhow!("{did} declares no hosting server"))
    }

    /// Fetches the DID document of `did` from the PLC directory or, for
    /// `did:web`, from the named host.
    pub async fn did_document(&self, did: &str) -> Result<DidDocument> {
        let url = document_url(&self.plc_upstream, did)?;
        let body = self.fetch(url).await?;
        serde_json::from_slice(&body).with_context(|| format!("invalid DID document for {did}"))
    }

    async fn fetch(&self, url: Url) -> Result<bytes::Bytes> {
        let response = self.proxy.get(url.clone()).await?;
        if !response.status.is_success() {
            bail!("request to {url} failed with status {}", response.status);
        }
        Ok(response.body)
    }
}

fn document_url(plc_upstream: &Url, did: &str) -> Result<Url> {
    if let Some(host) = did.strip_prefix("did:web:") {
        if host.contains(':') {
            bail!("did:web with a path is not supported: {did}");
        }
        return Ok(Url::parse(&format!("https://{host}/.well-known/did.json"))?);
    }
    if !did.starts_with("did:plc:") {
        bail!("unsupported DID method: {did}");
    }
    let mut url = plc_upstream.clone();
    url.path_segments_mut()
        .map_err(|_| anyhow!("invalid PLC directory url {plc_upstream}"))?
        .pop_if_empty()
        .push(did);
    Ok(url)
}
