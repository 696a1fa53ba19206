use anyhow::Result;

use super::Job;
use crate::{
    db::{PdsRepo, Store, Target},
    xrpc::XrpcClient,
};

/// Fetches `describeRepo` for every listed account and stores the raw
/// result on its account info row.
#[derive(Debug, Clone)]
pub struct DescribeJob {
    xrpc: XrpcClient,
    store: Store,
}

impl DescribeJob {
    pub fn new(xrpc: XrpcClient, store: Store) -> Self {
        Self { xrpc, store }
    }
}

impl Job for DescribeJob {
    fn name(&self) -> &'static str {
        "describe"
    }

    fn target(&self) -> Target {
        Target::Describe
    }

    async fn process(&self, repo: PdsRepo) -> Result<()> {
        let describe = self.xrpc.describe_repo(&repo.pds, &repo.did).await?;
        self.store.record_describe(&repo.did, &repo.pds, describe)?;
        self.store.set_repo_status(&repo.key(), true, "")?;
        Ok(())
    }
}
