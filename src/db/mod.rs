//! Relational store shared by the PLC mirror and the batch jobs.
//!
//! Every operation is a single [`redb`] transaction. Writes are inserts that
//! ignore duplicates or upserts, so an interrupted pass never leaves anything
//! to roll back.

use std::{path::Path, sync::Arc};

use anyhow::{Context, Result};
use redb::{backends::InMemoryBackend, Database, ReadableTable, ReadableTableMetadata};
use serde::de::DeserializeOwned;
use tracing::info;

mod models;
mod plc_log;
mod tables;
mod tracking;

pub use self::{models::*, plc_log::InsertReport};
use self::tables::*;

/// Handle to the store. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Store {
    db: Arc<Database>,
}

impl Store {
    pub fn persistent(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("loading mirror database from {}", path.to_string_lossy());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!(
                    "failed to create database directory at {}",
                    path.to_string_lossy()
                )
            })?;
        }
        let db = Database::builder()
            .create(path)
            .context("failed to open mirror database")?;
        Self::open(db)
    }

    pub fn in_memory() -> Result<Self> {
        info!("using in-memory mirror database");
        let db = Database::builder().create_with_backend(InMemoryBackend::new())?;
        Self::open(db)
    }

    pub fn open(db: Database) -> Result<Self> {
        let write_tx = db.begin_write()?;
        {
            let _table = write_tx.open_table(PLC_LOG_TABLE)?;
            let _table = write_tx.open_table(PLC_LOG_KEYS_TABLE)?;
            let _table = write_tx.open_table(PLC_LOG_BY_TIME_TABLE)?;
            let _table = write_tx.open_table(ACCOUNT_INFO_TABLE)?;
            let _table = write_tx.open_table(ACCOUNT_HANDLES_TABLE)?;
            let _table = write_tx.open_table(ACCOUNT_REPOS_TABLE)?;
            let repos = write_tx.open_table(PDS_REPOS_TABLE)?;
            let mut by_shard = write_tx.open_table(PDS_REPOS_BY_SHARD_TABLE)?;
            if by_shard.len()? != repos.len()? {
                info!("rebuilding listing scan order");
                for item in repos.iter()? {
                    let (key, _) = item?;
                    let (pds, did) = key.value();
                    by_shard.insert((did_shard(did), did, pds), ())?;
                }
            }
        }
        write_tx.commit()?;
        Ok(Self { db: Arc::new(db) })
    }
}

fn get_json<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    key: &str,
) -> Result<Option<T>> {
    let Some(row) = table.get(key)? else {
        return Ok(None);
    };
    let value = serde_json::from_slice(row.value())
        .with_context(|| format!("corrupt row for {key}"))?;
    Ok(Some(value))
}
