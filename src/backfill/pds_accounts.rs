//! Listing pass over hosting servers.

use std::collections::BTreeSet;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{db::Store, xrpc::XrpcClient};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostListingReport {
    pub hosts: usize,
    pub failed_hosts: usize,
    pub pages: usize,
    pub repos: usize,
}

/// Pages through `listRepos` of every host, in order, and upserts the
/// listed repositories.
///
/// Hosts sorting before `start` are skipped. A host that fails is logged and
/// the pass moves on. Without explicit hosts, every hosting server known from
/// account info is listed.
pub async fn list_hosts(
    store: &Store,
    xrpc: &XrpcClient,
    hosts: Vec<String>,
    start: Option<&str>,
    cancel: &CancellationToken,
) -> Result<HostListingReport> {
    let hosts: BTreeSet<String> = if hosts.is_empty() {
        store.known_hosts()?
    } else {
        hosts.into_iter().collect()
    };
    let mut report = HostListingReport::default();
    for host in hosts
        .iter()
        .filter(|h| start.map_or(true, |start| h.as_str() >= start))
    {
        if cancel.is_cancelled() {
            break;
        }
        report.hosts += 1;
        match list_host(store, xrpc, host, &mut report).await {
            Ok(repos) => info!(%host, repos, "host listed"),
            Err(err) => {
                report.failed_hosts += 1;
                warn!(%host, "failed to list host: {err:#}");
            }
        }
    }
    Ok(report)
}

async fn list_host(
    store: &Store,
    xrpc: &XrpcClient,
    host: &str,
    report: &mut HostListingReport,
) -> Result<usize> {
    let mut listed = 0;
    let mut cursor: Option<String> = None;
    loop {
        let page = xrpc.list_repos(host, cursor.as_deref()).await?;
        report.pages += 1;
        listed += store.upsert_pds_repos(host, &page.repos)?;
        report.repos += page.repos.len();
        match page.cursor {
            Some(next) if !page.repos.is_empty() && Some(&next) != cursor.as_ref() => {
                debug!(%host, cursor = %next, "next listing page");
                cursor = Some(next);
            }
            _ => break,
        }
    }
    Ok(listed)
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, sync::Arc};

    use axum::{extract::Query, routing::get, Json, Router};
    use serde_json::json;
    use testresult::TestResult;

    use super::*;
    use crate::{
        db::{RepoKey, Target},
        proxy::{LimiterRegistry, Proxy},
        test_utils::spawn_server,
    };

    fn client() -> XrpcClient {
        XrpcClient::new(Proxy::new(
            reqwest::Client::new(),
            Arc::new(LimiterRegistry::default()),
            CancellationToken::new(),
        ))
    }

    fn host_app() -> Router {
        Router::new().route(
            "/xrpc/com.atproto.sync.listRepos",
            get(|Query(params): Query<HashMap<String, String>>| async move {
                let page = match params.get("cursor").map(String::as_str) {
                    None => json!({
                        "cursor": "2",
                        "repos": [
                            {"did": "did:plc:a", "head": "bafya", "rev": "3ka"},
                            {"did": "did:plc:b", "head": "bafyb", "rev": "3kb", "active": false, "status": "takendown"},
                        ]
                    }),
                    Some("2") => json!({"cursor": "3", "repos": [{"did": "did:plc:c", "head": "bafyc", "rev": "3kc"}]}),
                    Some(_) => json!({"repos": []}),
                };
                Json(page)
            }),
        )
    }

    #[tokio::test]
    async fn pages_through_hosts_and_skips_failures() -> TestResult {
        let (base, _server) = spawn_server(host_app()).await?;
        let host = base.to_string();
        let store = Store::in_memory()?;

        let report = list_hosts(
            &store,
            &client(),
            vec![host.clone(), "http://127.0.0.1:1/".to_string()],
            None,
            &CancellationToken::new(),
        )
        .await?;
        assert_eq!(report.hosts, 2);
        assert_eq!(report.failed_hosts, 1);
        assert_eq!(report.pages, 3);
        assert_eq!(report.repos, 3);

        let b = store.pds_repo(&RepoKey::new(host.as_str(), "did:plc:b"))?.unwrap();
        assert!(!b.active);
        assert_eq!(b.status, "takendown");
        assert_eq!(store.count_eligible(Target::Describe, None)?, 2);
        Ok(())
    }

    #[tokio::test]
    async fn start_host_skips_earlier_hosts() -> TestResult {
        let store = Store::in_memory()?;
        let report = list_hosts(
            &store,
            &client(),
            vec!["http://127.0.0.1:1/".to_string(), "http://127.0.0.1:2/".to_string()],
            Some("http://127.0.0.1:2/"),
            &CancellationToken::new(),
        )
        .await?;
        assert_eq!(report.hosts, 1);
        assert_eq!(report.failed_hosts, 1);
        Ok(())
    }
}
