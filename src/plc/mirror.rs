//! Cursor-tailing mirror of the PLC operation log.
//!
//! A pass starts at the store's watermark and requests export pages with
//! `after=<cursor>` until a page no longer advances the cursor. The cursor
//! moves on every decoded line, including lines that fail validation.
//!
//! Export requests go through the mirror's own pacer before the shared host
//! limiter, so limits advertised by the directory never raise the pace set
//! for the current watermark.

use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::{anyhow, bail, Context, Result};
use backon::{BackoffBuilder, ExponentialBuilder};
use bytes::Bytes;
use iroh_metrics::inc;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::{types::OperationLogEntry, validate::Validator};
use crate::{
    config::PlcConfig,
    db::{AccountInfoUpdate, Store},
    metrics::Metrics,
    proxy::{HostLimiter, Proxy, ProxyError, RateLimit},
};

/// Bookkeeping of one mirror pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub pages: usize,
    /// Lines that did not decode as log entries.
    pub invalid: usize,
    /// Entries that failed validation.
    pub rejected: usize,
    pub inserted: usize,
    pub duplicates: usize,
    /// Cursor the pass ended at.
    pub cursor: String,
}

/// Target export rate given the newest stored protocol timestamp.
///
/// The mirror slows down to `caught_up_rate` once it is within
/// `caught_up_threshold` of `now`.
pub fn desired_rate(config: &PlcConfig, newest: Option<&str>, now: OffsetDateTime) -> f64 {
    let caught_up = newest
        .and_then(|ts| OffsetDateTime::parse(ts, &Rfc3339).ok())
        .is_some_and(|ts| now - ts <= config.caught_up_threshold);
    if caught_up {
        config.caught_up_rate
    } else {
        config.backfill_rate
    }
}

#[derive(Debug, Clone)]
pub struct PlcMirror {
    store: Store,
    proxy: Proxy,
    config: PlcConfig,
    validator: Validator,
    export_url: Url,
    pacer: Arc<HostLimiter>,
    cancel: CancellationToken,
}

impl PlcMirror {
    pub fn new(
        store: Store,
        proxy: Proxy,
        config: PlcConfig,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let export_url = config.upstream.join("export")?;
        if export_url.host_str().is_none() {
            bail!("PLC upstream has no host: {}", config.upstream);
        }
        let pacer = Arc::new(HostLimiter::new(RateLimit::new(
            config.backfill_rate,
            config.burst,
        )));
        let validator = Validator::new(config.denylist.iter().cloned());
        Ok(Self {
            store,
            proxy,
            config,
            validator,
            export_url,
            pacer,
            cancel,
        })
    }

    /// Current export pace.
    pub fn pace(&self) -> RateLimit {
        self.pacer.limit()
    }

    /// Runs passes until cancelled, sleeping `pass_delay` after each one.
    ///
    /// Pass failures are logged, the next pass resumes from the watermark.
    pub async fn run(&self) {
        info!(upstream = %self.config.upstream, "PLC mirror started");
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            match self.run_pass().await {
                Ok(report) => info!(
                    cursor = %report.cursor,
                    pages = report.pages,
                    inserted = report.inserted,
                    rejected = report.rejected,
                    invalid = report.invalid,
                    "PLC mirror pass complete"
                ),
                Err(err) if self.cancel.is_cancelled() => debug!("PLC pass interrupted: {err:#}"),
                Err(err) => warn!("PLC mirror pass failed: {err:#}"),
            }
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.pass_delay) => {}
            }
        }
        info!("PLC mirror stopped");
    }

    /// Fetches pages from the watermark until caught up.
    pub async fn run_pass(&self) -> Result<PassReport> {
        let mut cursor = self.store.latest_plc_timestamp()?.unwrap_or_default();
        let mut report = PassReport::default();
        loop {
            if self.cancel.is_cancelled() {
                bail!("cancelled");
            }
            let page_start = cursor.clone();
            let body = self.fetch_page(&cursor).await?;
            report.pages += 1;
            inc!(Metrics, plc_pages);

            let accepted = self.decode_page(&body, &mut cursor, &mut report);
            if cursor == page_start {
                debug!(%cursor, "caught up with the PLC log");
                break;
            }
            self.persist(&accepted, &mut report)?;
            self.adjust_pace()?;
            debug!(%cursor, entries = accepted.len(), "PLC page stored");
        }
        inc!(Metrics, plc_passes);
        report.cursor = cursor;
        Ok(report)
    }

    async fn fetch_page(&self, cursor: &str) -> Result<Bytes> {
        let mut url = self.export_url.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("count", &self.config.page_size.to_string());
            if !cursor.is_empty() {
                query.append_pair("after", cursor);
            }
        }

        let mut backoff = ExponentialBuilder::new()
            .with_min_delay(Duration::from_millis(250))
            .with_max_delay(Duration::from_secs(30))
            .with_jitter()
            .with_max_times(self.config.max_retries)
            .build();
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => bail!(ProxyError::Cancelled),
                _ = self.pacer.acquire() => {}
            }
            let err = match self.proxy.get(url.clone()).await {
                Ok(response) if response.status.is_success() => return Ok(response.body),
                Ok(response) => anyhow!("PLC export returned {}", response.status),
                Err(ProxyError::Cancelled) => bail!(ProxyError::Cancelled),
                Err(err) => err.into(),
            };
            inc!(Metrics, plc_fetch_errors);
            let Some(delay) = backoff.next() else {
                return Err(err.context(format!("giving up on cursor {cursor:?}")));
            };
            warn!(%cursor, "PLC export fetch failed, retrying in {delay:?}: {err:#}");
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => bail!(ProxyError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Decodes JSON lines, advancing `cursor`, and returns the entries to store.
    fn decode_page(
        &self,
        body: &[u8],
        cursor: &mut String,
        report: &mut PassReport,
    ) -> Vec<OperationLogEntry> {
        let mut accepted = Vec::new();
        for line in body.split(|b| *b == b'\n') {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            let entry: OperationLogEntry = match serde_json::from_slice(line) {
                Ok(entry) => entry,
                Err(err) => {
                    debug!("skipping undecodable PLC line: {err}");
                    report.invalid += 1;
                    inc!(Metrics, plc_lines_invalid);
                    continue;
                }
            };
            cursor.clone_from(&entry.created_at);

            if self.config.filter {
                if let Err(reason) = self.validator.check(&entry) {
                    debug!(did = %entry.did, cid = %entry.cid, "rejected PLC entry: {reason}");
                    report.rejected += 1;
                    inc!(Metrics, plc_entries_rejected);
                    continue;
                }
            }
            accepted.push(entry);
        }
        accepted
    }

    fn persist(&self, entries: &[OperationLogEntry], report: &mut PassReport) -> Result<()> {
        let inserted = self
            .store
            .insert_log_entries(entries)
            .context("failed to store PLC entries")?;
        report.inserted += inserted.inserted;
        report.duplicates += inserted.duplicates;

        // newest state per account within the page
        let mut latest: HashMap<&str, &OperationLogEntry> = HashMap::new();
        for entry in entries.iter().filter(|e| !e.nullified) {
            match latest.get(entry.did.as_str()) {
                Some(seen) if seen.created_at > entry.created_at => {}
                _ => {
                    latest.insert(entry.did.as_str(), entry);
                }
            }
        }
        let updates: Vec<AccountInfoUpdate> =
            latest.into_values().map(AccountInfoUpdate::from).collect();
        self.store
            .upsert_account_infos(&updates)
            .context("failed to update account info")?;
        Ok(())
    }

    fn adjust_pace(&self) -> Result<()> {
        let newest = self.store.latest_plc_timestamp()?;
        let rate = desired_rate(&self.config, newest.as_deref(), OffsetDateTime::now_utc());
        if self.pacer.set_rate(rate) {
            info!(rate, "PLC export rate changed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{extract::Query, routing::get, Router};
    use parking_lot::Mutex;
    use testresult::TestResult;
    use tracing_test::traced_test;

    use super::*;
    use crate::{
        proxy::{HostLimiters, LimiterRegistry},
        test_utils,
    };

    const LAST: &str = "2024-01-01T00:00:00.000Z";

    fn config(upstream: Url) -> PlcConfig {
        PlcConfig {
            upstream,
            backfill_rate: 1000.0,
            caught_up_rate: 1000.0,
            burst: 100,
            pass_delay: Duration::from_secs(3600),
            ..Default::default()
        }
    }

    fn mirror(store: Store, upstream: Url, cancel: CancellationToken) -> Result<PlcMirror> {
        let proxy = Proxy::new(
            reqwest::Client::new(),
            Arc::new(LimiterRegistry::default()),
            cancel.clone(),
        );
        PlcMirror::new(store, proxy, config(upstream), cancel)
    }

    /// Export endpoint serving a fixed log, recording every `after` it is asked for.
    fn export_server(seen: Arc<Mutex<Vec<String>>>) -> Router {
        Router::new().route(
            "/export",
            get(move |Query(params): Query<HashMap<String, String>>| {
                let seen = seen.clone();
                async move {
                    let after = params.get("after").cloned().unwrap_or_default();
                    seen.lock().push(after.clone());
                    if !after.is_empty() {
                        return String::new();
                    }
                    [
                        test_utils::plc_line("did:plc:alice", "cid1", "2023-12-31T00:00:00.000Z", "alice.test"),
                        "{not json".to_string(),
                        test_utils::plc_line("did:plc:bob", "cid2", "2023-12-31T12:00:00.000Z", "bob.test"),
                        test_utils::plc_line("did:plc:alice", "cid3", LAST, "alice2.test"),
                    ]
                    .join("\n")
                }
            }),
        )
    }

    #[test]
    fn pacing_follows_watermark() {
        let config = PlcConfig::default();
        let now = OffsetDateTime::parse(LAST, &Rfc3339).unwrap();
        assert_eq!(desired_rate(&config, None, now), config.backfill_rate);
        assert_eq!(
            desired_rate(&config, Some("2023-12-31T23:55:00.000Z"), now),
            config.caught_up_rate
        );
        assert_eq!(
            desired_rate(&config, Some("2023-12-31T23:00:00.000Z"), now),
            config.backfill_rate
        );
        assert_eq!(desired_rate(&config, Some("garbage"), now), config.backfill_rate);
    }

    #[tokio::test]
    #[traced_test]
    async fn pass_runs_until_cursor_stops_moving() -> TestResult {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (base, _server) = test_utils::spawn_server(export_server(seen.clone())).await?;
        let store = Store::in_memory()?;
        let mirror = mirror(store.clone(), base, CancellationToken::new())?;

        let report = mirror.run_pass().await?;
        assert_eq!(*seen.lock(), vec![String::new(), LAST.to_string()]);
        assert_eq!(report.cursor, LAST);
        assert_eq!(report.pages, 2);
        assert_eq!(report.inserted, 3);
        assert_eq!(report.invalid, 1);
        assert_eq!(store.latest_plc_timestamp()?.as_deref(), Some(LAST));

        let alice = store.account_info("did:plc:alice")?.unwrap();
        assert_eq!(alice.handle.as_deref(), Some("alice2.test"));
        assert_eq!(alice.pds.as_deref(), Some("https://pds.example.com"));

        // the next pass starts at the watermark and finds nothing new
        let report = mirror.run_pass().await?;
        assert_eq!(report.pages, 1);
        assert_eq!(report.inserted, 0);
        assert_eq!(seen.lock().last().map(String::as_str), Some(LAST));
        Ok(())
    }

    #[tokio::test]
    async fn advertised_limits_do_not_override_caught_up_pace() -> TestResult {
        let recent = (OffsetDateTime::now_utc() - time::Duration::seconds(5)).format(&Rfc3339)?;
        let line = test_utils::plc_line("did:plc:alice", "cid1", &recent, "alice.test");
        let app = Router::new().route(
            "/export",
            get(move |Query(params): Query<HashMap<String, String>>| {
                let line = line.clone();
                async move {
                    let body = if params.contains_key("after") { String::new() } else { line };
                    ([("ratelimit-policy", "1000;w=1")], body)
                }
            }),
        );
        let (base, _server) = test_utils::spawn_server(app).await?;
        let registry = Arc::new(LimiterRegistry::default());
        let cancel = CancellationToken::new();
        let proxy = Proxy::new(reqwest::Client::new(), registry.clone(), cancel.clone());
        let config = PlcConfig {
            caught_up_rate: 7.0,
            ..config(base.clone())
        };
        let mirror = PlcMirror::new(Store::in_memory()?, proxy, config, cancel)?;

        let report = mirror.run_pass().await?;
        assert_eq!(report.inserted, 1);
        assert_eq!(mirror.pace(), RateLimit::new(7.0, 100));
        let host = registry.get_or_create(base.host_str().unwrap_or_default());
        assert_eq!(host.limit().rate, 1000.0);
        Ok(())
    }

    #[tokio::test]
    async fn invalid_entries_are_skipped_but_advance_the_cursor() -> TestResult {
        let app = Router::new().route(
            "/export",
            get(|Query(params): Query<HashMap<String, String>>| async move {
                if params.contains_key("after") {
                    return String::new();
                }
                let mut bad = test_utils::plc_line("did:plc:eve", "cid9", LAST, "eve.test");
                bad = bad.replace("https://pds.example.com", "https://uwu");
                bad
            }),
        );
        let (base, _server) = test_utils::spawn_server(app).await?;
        let store = Store::in_memory()?;
        let report = mirror(store.clone(), base, CancellationToken::new())?
            .run_pass()
            .await?;
        assert_eq!(report.rejected, 1);
        assert_eq!(report.cursor, LAST);
        assert_eq!(store.log_entry_count()?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn run_sleeps_between_passes_and_stops_on_cancel() -> TestResult {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (base, _server) = test_utils::spawn_server(export_server(seen.clone())).await?;
        let cancel = CancellationToken::new();
        let mirror = mirror(Store::in_memory()?, base, cancel.clone())?;

        let task = tokio::spawn(async move { mirror.run().await });
        while seen.lock().len() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // the pass is done, the loop now sleeps for an hour
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(seen.lock().len(), 2);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), task).await??;
        Ok(())
    }
}
