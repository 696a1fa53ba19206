//! Resumable batch jobs over the host-scoped repository listing.
//!
//! A [`Backfill`] pages through the listing rows a [`Job`] still has to
//! process, shuffles every page so concurrent units spread over many hosts,
//! and runs the units with bounded concurrency. Failures stay with their
//! unit: they are classified, recorded on the listing row where terminal,
//! and counted.

use std::future::Future;

use anyhow::Result;
use futures_util::{stream, StreamExt};
use iroh_metrics::inc;
use rand::seq::SliceRandom;
use reqwest::StatusCode;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    db::{BatchCursor, PdsRepo, RepoKey, Store, Target},
    metrics::Metrics,
    xrpc::XrpcError,
};

mod describe;
mod pds_accounts;
mod repo_sync;

pub use self::{
    describe::DescribeJob,
    pds_accounts::{list_hosts, HostListingReport},
    repo_sync::RepoSyncJob,
};

/// How a unit ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    /// The account is gone for good. The row is deactivated with this status.
    Inactive(String),
    /// The host asked us to slow down. The row is left for the next pass.
    RateLimited,
    /// The host failed. The row is deactivated with this status until
    /// reactivated by hand.
    ServerError(String),
    /// Any other error. The row is left for the next pass.
    Failed,
}

impl Outcome {
    /// Status to record on the listing row, if any.
    fn status(&self) -> Option<&str> {
        match self {
            Outcome::Inactive(status) | Outcome::ServerError(status) => Some(status),
            _ => None,
        }
    }
}

/// Classifies a unit error by the remote response it carries.
pub fn classify(err: &anyhow::Error) -> Outcome {
    let Some(xrpc) = err.chain().find_map(|e| e.downcast_ref::<XrpcError>()) else {
        return Outcome::Failed;
    };
    let Some(status) = xrpc.status() else {
        return Outcome::Failed;
    };
    match (status, xrpc.error_name()) {
        (StatusCode::NOT_FOUND, _) => Outcome::Inactive("notfound".to_string()),
        (StatusCode::BAD_REQUEST, Some("NotFound" | "RepoNotFound")) => {
            Outcome::Inactive("notfound".to_string())
        }
        (StatusCode::BAD_REQUEST, Some("RepoTakendown")) => {
            Outcome::Inactive("takendown".to_string())
        }
        (StatusCode::BAD_REQUEST, Some("RepoDeactivated")) => {
            Outcome::Inactive("deactivated".to_string())
        }
        (StatusCode::TOO_MANY_REQUESTS, _) => Outcome::RateLimited,
        (status, _) if status.is_server_error() => {
            Outcome::ServerError(format!("server_error_{}", status.as_u16()))
        }
        _ => Outcome::Failed,
    }
}

/// Work done for one listing row.
pub trait Job: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Relation in which the job records its attempts.
    fn target(&self) -> Target;

    fn process(&self, repo: PdsRepo) -> impl Future<Output = Result<()>> + Send;
}

/// Counters of one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackfillReport {
    /// Eligible rows when the pass started.
    pub total: u64,
    pub batches: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub inactive: usize,
    pub rate_limited: usize,
    pub server_errors: usize,
    pub failed: usize,
}

impl BackfillReport {
    fn record(&mut self, outcome: &Outcome) {
        self.processed += 1;
        match outcome {
            Outcome::Succeeded => self.succeeded += 1,
            Outcome::Inactive(_) => self.inactive += 1,
            Outcome::RateLimited => self.rate_limited += 1,
            Outcome::ServerError(_) => self.server_errors += 1,
            Outcome::Failed => self.failed += 1,
        }
    }
}

/// Drives a [`Job`] over every eligible listing row.
#[derive(Debug)]
pub struct Backfill<J> {
    store: Store,
    job: J,
    parallelism: usize,
    batch_size: usize,
    cancel: CancellationToken,
}

impl<J: Job> Backfill<J> {
    pub fn new(store: Store, job: J, cancel: CancellationToken) -> Self {
        Self {
            store,
            job,
            parallelism: 16,
            batch_size: 1000,
            cancel,
        }
    }

    pub fn parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Runs until no eligible row is left or the pass is cancelled.
    ///
    /// Rows never attempted are eligible. With a `resume` marker, so are
    /// rows last attempted before it.
    pub async fn run_pass(&self, resume: Option<OffsetDateTime>) -> Result<BackfillReport> {
        let target = self.job.target();
        let mut report = BackfillReport {
            total: self.store.count_eligible(target, resume)?,
            ..Default::default()
        };
        info!(job = self.job.name(), total = report.total, "backfill pass started");

        let mut after: Option<BatchCursor> = None;
        loop {
            if self.cancel.is_cancelled() {
                info!(job = self.job.name(), "backfill pass cancelled");
                break;
            }
            let batch = self
                .store
                .select_batch(target, after.as_ref(), resume, self.batch_size)?;
            if batch.rows.is_empty() {
                break;
            }
            after = batch.cursor;
            report.batches += 1;

            let mut rows = batch.rows;
            rows.shuffle(&mut rand::thread_rng());
            let mut outcomes = stream::iter(rows)
                .map(|row| self.process_unit(row))
                .buffer_unordered(self.parallelism);
            while let Some(outcome) = outcomes.next().await {
                report.record(&outcome);
            }

            info!(
                job = self.job.name(),
                processed = report.processed,
                total = report.total,
                succeeded = report.succeeded,
                inactive = report.inactive,
                rate_limited = report.rate_limited,
                server_errors = report.server_errors,
                failed = report.failed,
                "backfill progress"
            );
        }
        Ok(report)
    }

    async fn process_unit(&self, row: PdsRepo) -> Outcome {
        let key = row.key();
        inc!(Metrics, backfill_units);
        let outcome = match self.job.process(row).await {
            Ok(()) => Outcome::Succeeded,
            Err(err) => {
                let outcome = classify(&err);
                match outcome {
                    Outcome::Failed => warn!(job = self.job.name(), repo = %key, "unit failed: {err:#}"),
                    _ => debug!(job = self.job.name(), repo = %key, ?outcome, "unit not completed: {err:#}"),
                }
                outcome
            }
        };
        match &outcome {
            Outcome::Succeeded => inc!(Metrics, backfill_units_succeeded),
            Outcome::Inactive(_) => inc!(Metrics, backfill_units_terminal),
            Outcome::RateLimited => inc!(Metrics, backfill_units_rate_limited),
            Outcome::ServerError(_) => inc!(Metrics, backfill_units_server_error),
            Outcome::Failed => inc!(Metrics, backfill_units_failed),
        }
        if let Some(status) = outcome.status() {
            if let Err(err) = self.store.set_repo_status(&key, false, status) {
                warn!(repo = %key, %status, "failed to record status: {err:#}");
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use parking_lot::Mutex;
    use testresult::TestResult;

    use super::*;
    use crate::db::RepoListing;

    #[derive(Debug, Default)]
    struct FakeJob {
        store: Option<Store>,
        failures: HashMap<String, (StatusCode, &'static str)>,
        seen: Mutex<Vec<String>>,
    }

    impl Job for FakeJob {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn target(&self) -> Target {
            Target::RepoSync
        }

        async fn process(&self, repo: PdsRepo) -> Result<()> {
            self.seen.lock().push(repo.did.clone());
            if let Some((status, error)) = self.failures.get(&repo.did) {
                return Err(XrpcError::Status {
                    method: "com.atproto.sync.getRepo",
                    status: *status,
                    error: error.to_string(),
                    message: String::new(),
                }
                .into());
            }
            if let Some(store) = &self.store {
                store.record_repo_sync(&repo.did, Some("3k1"), true)?;
            }
            Ok(())
        }
    }

    fn seed(store: &Store, n: usize) -> Result<()> {
        for (h, host) in ["https://a.example", "https://b.example", "https://c.example"]
            .iter()
            .enumerate()
        {
            let listings: Vec<_> = (0..n)
                .filter(|i| i % 3 == h)
                .map(|i| RepoListing {
                    did: format!("did:plc:{i:04}"),
                    head: String::new(),
                    rev: String::new(),
                    active: None,
                    status: None,
                })
                .collect();
            store.upsert_pds_repos(host, &listings)?;
        }
        Ok(())
    }

    fn xrpc_error(status: StatusCode, error: &str) -> anyhow::Error {
        XrpcError::Status {
            method: "m",
            status,
            error: error.to_string(),
            message: String::new(),
        }
        .into()
    }

    #[test]
    fn classification() {
        let inactive = |s: &str| Outcome::Inactive(s.to_string());
        assert_eq!(classify(&xrpc_error(StatusCode::NOT_FOUND, "")), inactive("notfound"));
        assert_eq!(classify(&xrpc_error(StatusCode::BAD_REQUEST, "RepoNotFound")), inactive("notfound"));
        assert_eq!(classify(&xrpc_error(StatusCode::BAD_REQUEST, "NotFound")), inactive("notfound"));
        assert_eq!(classify(&xrpc_error(StatusCode::BAD_REQUEST, "RepoTakendown")), inactive("takendown"));
        assert_eq!(
            classify(&xrpc_error(StatusCode::BAD_REQUEST, "RepoDeactivated")),
            inactive("deactivated")
        );
        assert_eq!(classify(&xrpc_error(StatusCode::TOO_MANY_REQUESTS, "")), Outcome::RateLimited);
        assert_eq!(
            classify(&xrpc_error(StatusCode::BAD_GATEWAY, "")),
            Outcome::ServerError("server_error_502".to_string())
        );
        assert_eq!(classify(&xrpc_error(StatusCode::BAD_REQUEST, "InvalidRequest")), Outcome::Failed);
        assert_eq!(classify(&anyhow::anyhow!("disk full")), Outcome::Failed);

        // context layers are looked through
        let wrapped = xrpc_error(StatusCode::NOT_FOUND, "").context("sync failed");
        assert_eq!(classify(&wrapped), inactive("notfound"));
    }

    #[tokio::test]
    async fn every_row_is_processed_once_at_any_parallelism() -> TestResult {
        for parallelism in [1, 4] {
            let store = Store::in_memory()?;
            seed(&store, 25)?;
            let job = FakeJob {
                store: Some(store.clone()),
                ..Default::default()
            };
            let backfill = Backfill::new(store.clone(), job, CancellationToken::new())
                .parallelism(parallelism)
                .batch_size(7);

            let report = backfill.run_pass(None).await?;
            assert_eq!(report.total, 25);
            assert_eq!(report.processed, 25);
            assert_eq!(report.succeeded, 25);
            assert_eq!(report.batches, 4);
            let mut seen = backfill.job.seen.lock().clone();
            seen.sort();
            seen.dedup();
            assert_eq!(seen.len(), 25);

            // attempted rows are not selected again without a resume marker
            let report = backfill.run_pass(None).await?;
            assert_eq!(report.processed, 0);

            let resume = OffsetDateTime::now_utc() + time::Duration::seconds(1);
            let report = backfill.run_pass(Some(resume)).await?;
            assert_eq!(report.processed, 25);
        }
        Ok(())
    }

    #[tokio::test]
    async fn outcomes_drive_row_status() -> TestResult {
        let store = Store::in_memory()?;
        seed(&store, 6)?;
        let failures = HashMap::from([
            ("did:plc:0000".to_string(), (StatusCode::NOT_FOUND, "")),
            ("did:plc:0001".to_string(), (StatusCode::BAD_REQUEST, "RepoTakendown")),
            ("did:plc:0002".to_string(), (StatusCode::TOO_MANY_REQUESTS, "")),
            ("did:plc:0003".to_string(), (StatusCode::SERVICE_UNAVAILABLE, "")),
            ("did:plc:0004".to_string(), (StatusCode::BAD_REQUEST, "InvalidRequest")),
        ]);
        let job = FakeJob {
            store: Some(store.clone()),
            failures,
            ..Default::default()
        };
        let backfill = Backfill::new(store.clone(), job, CancellationToken::new()).parallelism(3);

        let report = backfill.run_pass(None).await?;
        assert_eq!(report.processed, 6);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.inactive, 2);
        assert_eq!(report.rate_limited, 1);
        assert_eq!(report.server_errors, 1);
        assert_eq!(report.failed, 1);

        let row = |host: &str, did: &str| -> Result<(bool, String)> {
            let row = store.pds_repo(&RepoKey::new(host, did))?.unwrap();
            Ok((row.active, row.status))
        };
        assert_eq!(row("https://a.example", "did:plc:0000")?, (false, "notfound".to_string()));
        assert_eq!(row("https://b.example", "did:plc:0001")?, (false, "takendown".to_string()));
        assert_eq!(row("https://c.example", "did:plc:0002")?, (true, String::new()));
        assert_eq!(
            row("https://a.example", "did:plc:0003")?,
            (false, "server_error_503".to_string())
        );
        assert_eq!(row("https://b.example", "did:plc:0004")?, (true, String::new()));

        // rate limited and failed units come back in the next pass
        backfill.job.seen.lock().clear();
        let report = backfill.run_pass(None).await?;
        assert_eq!(report.processed, 2);
        let mut seen = backfill.job.seen.lock().clone();
        seen.sort();
        assert_eq!(seen, vec!["did:plc:0002", "did:plc:0004"]);
        Ok(())
    }

    #[tokio::test]
    async fn cancelled_pass_stops_before_the_next_batch() -> TestResult {
        let store = Store::in_memory()?;
        seed(&store, 10)?;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let backfill = Backfill::new(store, FakeJob::default(), cancel);
        let report = backfill.run_pass(None).await?;
        assert_eq!(report.total, 10);
        assert_eq!(report.processed, 0);
        Ok(())
    }
}
