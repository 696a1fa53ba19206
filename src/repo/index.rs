//! Per-account record index.

use std::{collections::BTreeSet, path::Path};

use anyhow::{Context, Result};
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};

use super::records::{extract_refs, Record};

/// (collection, rkey, cid) to the record as JSON.
const RECORDS_TABLE: TableDefinition<(&str, &str, &str), &[u8]> =
    TableDefinition::new("records-1");

/// (did, collection, rkey, source collection, source rkey) of every reference.
const REFS_TABLE: TableDefinition<(&str, &str, &str, &str, &str), ()> =
    TableDefinition::new("refs-1");

/// Index state. `rev` holds the repository revision last fully indexed.
const META_TABLE: TableDefinition<&str, &str> = TableDefinition::new("meta-1");

const REV_KEY: &str = "rev";

/// Record store of one account, kept next to its repository archive.
#[derive(Debug)]
pub struct RecordIndex {
    db: Database,
}

impl RecordIndex {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let db = Database::create(path)
            .with_context(|| format!("failed to open record index {}", path.display()))?;
        let tx = db.begin_write()?;
        {
            let _table = tx.open_table(RECORDS_TABLE)?;
            let _table = tx.open_table(REFS_TABLE)?;
            let _table = tx.open_table(META_TABLE)?;
        }
        tx.commit()?;
        Ok(Self { db })
    }

    /// Stores records and their references. Records already present are
    /// overwritten with the same content.
    ///
    /// `rev` marks the repository revision the index is complete for once
    /// the records are in.
    pub fn insert(&self, records: &[Record], rev: Option<&str>) -> Result<usize> {
        let tx = self.db.begin_write()?;
        {
            if let Some(rev) = rev {
                tx.open_table(META_TABLE)?.insert(REV_KEY, rev)?;
            }
            let mut table = tx.open_table(RECORDS_TABLE)?;
            let mut refs = tx.open_table(REFS_TABLE)?;
            for record in records {
                let cid = record.cid.to_string();
                let value = serde_json::to_vec(&record.value)?;
                table.insert(
                    (record.collection.as_str(), record.rkey.as_str(), cid.as_str()),
                    value.as_slice(),
                )?;
                for r in extract_refs(&record.value) {
                    refs.insert(
                        (
                            r.did.as_str(),
                            r.collection.as_str(),
                            r.rkey.as_str(),
                            record.collection.as_str(),
                            record.rkey.as_str(),
                        ),
                        (),
                    )?;
                }
            }
        }
        tx.commit()?;
        Ok(records.len())
    }

    /// Revision the index was last completed for.
    pub fn indexed_rev(&self) -> Result<Option<String>> {
        let tx = self.db.begin_read()?;
        let meta = tx.open_table(META_TABLE)?;
        Ok(meta.get(REV_KEY)?.map(|rev| rev.value().to_string()))
    }

    pub fn len(&self) -> Result<u64> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(RECORDS_TABLE)?;
        Ok(table.len()?)
    }

    /// The stored versions of one record, as JSON.
    pub fn get(&self, collection: &str, rkey: &str) -> Result<Vec<serde_json::Value>> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(RECORDS_TABLE)?;
        let mut values = Vec::new();
        for item in table.range((collection, rkey, "")..)? {
            let (key, value) = item?;
            let (c, r, _) = key.value();
            if c != collection || r != rkey {
                break;
            }
            values.push(serde_json::from_slice(value.value())?);
        }
        Ok(values)
    }

    /// Distinct accounts referenced by any record.
    pub fn referenced_accounts(&self) -> Result<BTreeSet<String>> {
        let tx = self.db.begin_read()?;
        let refs = tx.open_table(REFS_TABLE)?;
        let mut dids = BTreeSet::new();
        for item in refs.iter()? {
            let (key, _) = item?;
            dids.insert(key.value().0.to_string());
        }
        Ok(dids)
    }
}
