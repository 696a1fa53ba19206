//! Table definitions.
//!
//! Row values are JSON encoded.

use redb::TableDefinition;

/// Table: PLC operation log
/// Key:   `u64` # id, assigned in insertion order
/// Value: `&[u8]` # [`super::LogEntryRow`]
pub const PLC_LOG_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("plc-log-1");

/// Table: PLC log uniqueness index
/// Key:   `(&str, &str)` # (did, cid)
/// Value: `u64` # id in [`PLC_LOG_TABLE`]
pub const PLC_LOG_KEYS_TABLE: TableDefinition<(&str, &str), u64> =
    TableDefinition::new("plc-log-keys-1");

/// Table: PLC log by protocol timestamp
/// Key:   `(&str, u64)` # (plc timestamp, id)
/// Value: `()`
pub const PLC_LOG_BY_TIME_TABLE: TableDefinition<(&str, u64), ()> =
    TableDefinition::new("plc-log-by-time-1");

/// Table: Account info
/// Key:   `&str` # did
/// Value: `&[u8]` # [`super::AccountInfo`]
pub const ACCOUNT_INFO_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("account-info-1");

/// Table: Handle index of account info
/// Key:   `(&str, &str)` # (handle, did)
/// Value: `()`
pub const ACCOUNT_HANDLES_TABLE: TableDefinition<(&str, &str), ()> =
    TableDefinition::new("account-handles-1");

/// Table: Repositories listed by hosting servers
/// Key:   `(&str, &str)` # (pds, did)
/// Value: `&[u8]` # [`super::PdsRepo`]
pub const PDS_REPOS_TABLE: TableDefinition<(&str, &str), &[u8]> =
    TableDefinition::new("pds-repos-1");

/// Table: Scan order of [`PDS_REPOS_TABLE`]
/// Key:   `(u64, &str, &str)` # (did shard, did, pds)
/// Value: `()`
pub const PDS_REPOS_BY_SHARD_TABLE: TableDefinition<(u64, &str, &str), ()> =
    TableDefinition::new("pds-repos-by-shard-1");

/// Table: Repository sync state
/// Key:   `&str` # did
/// Value: `&[u8]` # [`super::AccountRepo`]
pub const ACCOUNT_REPOS_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("account-repos-1");
