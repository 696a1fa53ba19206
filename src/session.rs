//! Runtime state shared by every component of the mirror.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Weak},
};

use anyhow::{Context, Result};
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    config::Config,
    db::Store,
    identity::Resolver,
    plc::PlcMirror,
    proxy::{LimiterRegistry, Proxy},
    repo::RepoSyncer,
    xrpc::XrpcClient,
};

/// Name of the directory below the data dir holding account repositories.
const REPOS_DIR_NAME: &str = "repos";

/// One lock per account, held while the account's local repository is
/// being updated.
///
/// Entries of unlocked accounts are dropped on the next lock call.
#[derive(Debug, Clone, Default)]
pub struct AccountLocks {
    locks: Arc<parking_lot::Mutex<HashMap<String, Weak<tokio::sync::Mutex<()>>>>>,
}

impl AccountLocks {
    /// Waits for and takes the lock of `did`.
    pub async fn lock(&self, did: &str) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self.locks.lock();
            locks.retain(|_, lock| lock.strong_count() > 0);
            match locks.get(did).and_then(Weak::upgrade) {
                Some(mutex) => mutex,
                None => {
                    let mutex = Arc::new(tokio::sync::Mutex::new(()));
                    locks.insert(did.to_string(), Arc::downgrade(&mutex));
                    mutex
                }
            }
        };
        mutex.lock_owned().await
    }

    /// Number of accounts currently tracked.
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Explicit runtime object owning the store, the outbound proxy with its
/// host limiters, the account locks and the cancellation token.
///
/// Cheap to clone.
#[derive(Debug, Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    config: Config,
    data_dir: PathBuf,
    store: Store,
    xrpc: XrpcClient,
    locks: AccountLocks,
    cancel: CancellationToken,
}

impl Session {
    /// Opens the persistent store in the configured data directory.
    pub fn new(config: Config) -> Result<Self> {
        let data_dir = config.data_dir()?;
        let store = Store::persistent(config.store_path()?)?;
        Self::with_store(config, data_dir, store)
    }

    pub fn with_store(config: Config, data_dir: PathBuf, store: Store) -> Result<Self> {
        let cancel = CancellationToken::new();
        let client = reqwest::Client::builder()
            .timeout(config.proxy.timeout)
            .user_agent(config.proxy.user_agent.as_str())
            .build()
            .context("failed to build http client")?;
        let limiters = Arc::new(LimiterRegistry::new(config.proxy.default_limit()));
        let proxy = Proxy::new(client, limiters, cancel.clone());
        debug!(data_dir = %data_dir.display(), "session created");
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                data_dir,
                store,
                xrpc: XrpcClient::new(proxy),
                locks: AccountLocks::default(),
                cancel,
            }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn data_dir(&self) -> &Path {
        &self.inner.data_dir
    }

    pub fn repos_dir(&self) -> PathBuf {
        self.inner.data_dir.join(REPOS_DIR_NAME)
    }

    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    pub fn proxy(&self) -> &Proxy {
        self.inner.xrpc.proxy()
    }

    pub fn xrpc(&self) -> &XrpcClient {
        &self.inner.xrpc
    }

    pub fn account_locks(&self) -> &AccountLocks {
        &self.inner.locks
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    /// Cancels in-flight requests, pass loops and sleeps.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
    }

    pub fn syncer(&self) -> RepoSyncer {
        RepoSyncer::new(
            self.inner.xrpc.clone(),
            self.repos_dir(),
            self.inner.locks.clone(),
        )
    }

    pub fn plc_mirror(&self) -> Result<PlcMirror> {
        PlcMirror::new(
            self.inner.store.clone(),
            self.proxy().clone(),
            self.inner.config.plc.clone(),
            self.inner.cancel.clone(),
        )
    }

    pub fn resolver(&self) -> Resolver {
        Resolver::new(
            self.inner.store.clone(),
            self.proxy().clone(),
            self.inner.config.plc.upstream.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn account_locks_serialize_one_account() {
        let locks = AccountLocks::default();
        let guard = locks.lock("did:plc:a").await;

        // another account is independent
        let other = locks.lock("did:plc:b").await;
        drop(other);

        let waiting = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock("did:plc:a").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(5), waiting)
            .await
            .unwrap()
            .unwrap();

        // released locks are pruned on the next call
        let _guard = locks.lock("did:plc:c").await;
        assert_eq!(locks.len(), 1);
    }
}
