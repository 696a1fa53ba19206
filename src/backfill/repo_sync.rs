use anyhow::Result;

use super::Job;
use crate::{
    db::{PdsRepo, Store, Target},
    repo::{Phases, RepoSyncer},
};

/// Runs the sync pipeline for every listed account and records the attempt.
#[derive(Debug, Clone)]
pub struct RepoSyncJob {
    syncer: RepoSyncer,
    store: Store,
    phases: Phases,
}

impl RepoSyncJob {
    pub fn new(syncer: RepoSyncer, store: Store, phases: Phases) -> Self {
        Self {
            syncer,
            store,
            phases,
        }
    }
}

impl Job for RepoSyncJob {
    fn name(&self) -> &'static str {
        "repo-sync"
    }

    fn target(&self) -> Target {
        Target::RepoSync
    }

    async fn process(&self, repo: PdsRepo) -> Result<()> {
        let report = self.syncer.sync(&repo.did, &repo.pds, self.phases).await?;
        self.store
            .record_repo_sync(&repo.did, report.rev.as_deref(), report.changed)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, sync::Arc};

    use axum::{extract::Query, http::StatusCode, routing::get, Router};
    use bytes::Bytes;
    use testresult::TestResult;
    use time::OffsetDateTime;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::{
        backfill::Backfill,
        db::RepoListing,
        proxy::{LimiterRegistry, Proxy},
        session::AccountLocks,
        test_utils::{car_bytes, spawn_server, RepoBuilder},
        xrpc::XrpcClient,
    };

    #[tokio::test]
    async fn sync_state_is_recorded() -> TestResult {
        let mut builder = RepoBuilder::new("did:plc:alice");
        builder.record("app.bsky.feed.post", "3ka", serde_json::json!({"text": "hi"}));
        let (root, _, blocks) = builder.build("3k1");
        let car = Bytes::from(car_bytes(root, &blocks).await?);
        let app = Router::new().route(
            "/xrpc/com.atproto.sync.getRepo",
            get(move |Query(params): Query<HashMap<String, String>>| {
                let car = car.clone();
                async move {
                    match params.get("did").map(String::as_str) {
                        Some("did:plc:alice") if params.contains_key("since") => {
                            (StatusCode::OK, Bytes::new())
                        }
                        Some("did:plc:alice") => (StatusCode::OK, car),
                        _ => (StatusCode::INTERNAL_SERVER_ERROR, Bytes::new()),
                    }
                }
            }),
        );
        let (base, _server) = spawn_server(app).await?;
        let host = base.as_str();

        let store = Store::in_memory()?;
        let listings: Vec<RepoListing> = ["did:plc:alice", "did:plc:broken"]
            .into_iter()
            .map(|did| RepoListing {
                did: did.to_string(),
                head: String::new(),
                rev: String::new(),
                active: None,
                status: None,
            })
            .collect();
        store.upsert_pds_repos(host, &listings)?;

        let dir = tempfile::tempdir()?;
        let xrpc = XrpcClient::new(Proxy::new(
            reqwest::Client::new(),
            Arc::new(LimiterRegistry::default()),
            CancellationToken::new(),
        ));
        let syncer = RepoSyncer::new(xrpc, dir.path().to_path_buf(), AccountLocks::default());
        let job = RepoSyncJob::new(syncer, store.clone(), Phases::default());
        let backfill = Backfill::new(store.clone(), job, CancellationToken::new());

        let report = backfill.run_pass(None).await?;
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.server_errors, 1);

        let first = store.account_repo("did:plc:alice")?.unwrap();
        assert_eq!(first.rev.as_deref(), Some("3k1"));
        let changed_at = first.last_changed.unwrap();
        assert!(store.account_repo("did:plc:broken")?.is_none());

        let resume = OffsetDateTime::now_utc() + time::Duration::seconds(1);
        let report = backfill.run_pass(Some(resume)).await?;
        assert_eq!(report.processed, 1);

        let second = store.account_repo("did:plc:alice")?.unwrap();
        assert_eq!(second.rev.as_deref(), Some("3k1"));
        assert_eq!(second.last_changed, Some(changed_at));
        assert!(second.updated_at > first.updated_at);
        Ok(())
    }
}
