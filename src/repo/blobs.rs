//! Blob download for one account.

use std::path::Path;

use anyhow::{Context, Result};
use cid::Cid;
use iroh_metrics::inc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::{metrics::Metrics, xrpc::XrpcClient};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlobReport {
    pub listed: usize,
    pub fetched: usize,
    /// Blobs already on disk.
    pub present: usize,
    pub failed: usize,
}

/// Downloads every blob of `did` missing from `dir`.
///
/// Listing failures abort the sync. Failures of single blobs are logged and
/// counted.
pub async fn sync_blobs(xrpc: &XrpcClient, host: &str, did: &str, dir: &Path) -> Result<BlobReport> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("failed to create {}", dir.display()))?;

    let mut report = BlobReport::default();
    let mut cursor: Option<String> = None;
    loop {
        let page = xrpc
            .list_blobs(host, did, cursor.as_deref())
            .await
            .context("failed to list blobs")?;
        report.listed += page.cids.len();
        for cid in &page.cids {
            let Ok(cid) = cid.parse::<Cid>() else {
                warn!(%did, %cid, "skipping blob with invalid cid");
                report.failed += 1;
                continue;
            };
            let path = dir.join(cid.to_string());
            if tokio::fs::try_exists(&path).await? {
                report.present += 1;
                continue;
            }
            match fetch_blob(xrpc, host, did, &cid, &path).await {
                Ok(()) => {
                    report.fetched += 1;
                    inc!(Metrics, blobs_fetched);
                }
                Err(err) => {
                    warn!(%did, %cid, "failed to fetch blob: {err:#}");
                    report.failed += 1;
                    inc!(Metrics, blobs_failed);
                }
            }
        }
        match page.cursor {
            Some(next) if !next.is_empty() && !page.cids.is_empty() => cursor = Some(next),
            _ => break,
        }
    }
    debug!(%did, ?report, "blob sync complete");
    Ok(report)
}

async fn fetch_blob(xrpc: &XrpcClient, host: &str, did: &str, cid: &Cid, path: &Path) -> Result<()> {
    let data = xrpc.get_blob(host, did, &cid.to_string()).await?;
    let tmp = path.with_extension("tmp");
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(&data).await?;
    file.sync_all().await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
