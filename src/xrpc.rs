//! Typed calls to the XRPC endpoints of hosting servers.

use bytes::Bytes;
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize};
use url::Url;

use crate::{
    db::RepoListing,
    proxy::{Proxy, ProxyError},
};

/// Page size for listing calls.
pub const LIST_LIMIT: usize = 1000;

#[derive(Debug, thiserror::Error)]
pub enum XrpcError {
    #[error(transparent)]
    Proxy(#[from] ProxyError),
    #[error("{method} returned {status}: {error} {message}")]
    Status {
        method: &'static str,
        status: StatusCode,
        /// Protocol error name from the response body, empty if none.
        error: String,
        message: String,
    },
    #[error("cannot decode {method} response: {source}")]
    Decode {
        method: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid host url: {0}")]
    Url(#[from] url::ParseError),
}

impl XrpcError {
    /// HTTP status of an error response.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            XrpcError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Protocol error name of an error response.
    pub fn error_name(&self) -> Option<&str> {
        match self {
            XrpcError::Status { error, .. } if !error.is_empty() => Some(error),
            _ => None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: String,
    #[serde(default)]
    message: String,
}

/// One page of `com.atproto.sync.listRepos`.
#[derive(Debug, Clone, Deserialize)]
pub struct ListReposPage {
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default)]
    pub repos: Vec<RepoListing>,
}

/// One page of `com.atproto.sync.listBlobs`.
#[derive(Debug, Clone, Deserialize)]
pub struct ListBlobsPage {
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default)]
    pub cids: Vec<String>,
}

/// XRPC client over the rate-limited proxy. Cheap to clone.
#[derive(Debug, Clone)]
pub struct XrpcClient {
    proxy: Proxy,
}

impl XrpcClient {
    pub fn new(proxy: Proxy) -> Self {
        Self { proxy }
    }

    pub fn proxy(&self) -> &Proxy {
        &self.proxy
    }

    /// Exports a repository, everything after `since` if given.
    ///
    /// An empty body means there is nothing new.
    pub async fn get_repo(&self, host: &str, did: &str, since: Option<&str>) -> Result<Bytes, XrpcError> {
        self.call(
            host,
            "com.atproto.sync.getRepo",
            &[("did", did), ("since", since.unwrap_or_default())],
        )
        .await
    }

    pub async fn list_repos(
        &self,
        host: &str,
        cursor: Option<&str>,
    ) -> Result<ListReposPage, XrpcError> {
        let limit = LIST_LIMIT.to_string();
        self.call_json(
            host,
            "com.atproto.sync.listRepos",
            &[("limit", &limit), ("cursor", cursor.unwrap_or_default())],
        )
        .await
    }

    /// Raw `describeRepo` output.
    pub async fn describe_repo(&self, host: &str, did: &str) -> Result<serde_json::Value, XrpcError> {
        self.call_json(host, "com.atproto.repo.describeRepo", &[("repo", did)])
            .await
    }

    pub async fn list_blobs(
        &self,
        host: &str,
        did: &str,
        cursor: Option<&str>,
    ) -> Result<ListBlobsPage, XrpcError> {
        let limit = LIST_LIMIT.to_string();
        self.call_json(
            host,
            "com.atproto.sync.listBlobs",
            &[
                ("did", did),
                ("limit", &limit),
                ("cursor", cursor.unwrap_or_default()),
            ],
        )
        .await
    }

    pub async fn get_blob(&self, host: &str, did: &str, cid: &str) -> Result<Bytes, XrpcError> {
        self.call(host, "com.atproto.sync.getBlob", &[("did", did), ("cid", cid)])
            .await
    }

    pub async fn describe_server(&self, host: &str) -> Result<serde_json::Value, XrpcError> {
        self.call_json(host, "com.atproto.server.describeServer", &[])
            .await
    }

    async fn call_json<T: DeserializeOwned>(
        &self,
        host: &str,
        method: &'static str,
        params: &[(&str, &str)],
    ) -> Result<T, XrpcError> {
        let body = self.call(host, method, params).await?;
        serde_json::from_slice(&body).map_err(|source| XrpcError::Decode { method, source })
    }

    /// Issues a query. Empty parameters are left out.
    async fn call(
        &self,
        host: &str,
        method: &'static str,
        params: &[(&str, &str)],
    ) -> Result<Bytes, XrpcError> {
        let url = method_url(host, method, params)?;
        let response = self.proxy.get(url).await?;
        if response.status.is_success() {
            return Ok(response.body);
        }
        let body: ErrorBody = serde_json::from_slice(&response.body).unwrap_or_default();
        Err(XrpcError::Status {
            method,
            status: response.status,
            error: body.error,
            message: body.message,
        })
    }
}

fn method_url(host: &str, method: &str, params: &[(&str, &str)]) -> Result<Url, url::ParseError> {
    let mut base = Url::parse(host)?;
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    let mut url = base.join(&format!("xrpc/{method}"))?;
    {
        let mut query = url.query_pairs_mut();
        for (key, value) in params.iter().filter(|(_, v)| !v.is_empty()) {
            query.append_pair(key, value);
        }
    }
    if url.query() == Some("") {
        url.set_query(None);
    }
    Ok(url)
}
