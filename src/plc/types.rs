//! Wire types of the PLC operation log export.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Service id of the account's hosting server.
pub const PDS_SERVICE_ID: &str = "atproto_pds";

/// Service type of the account's hosting server.
pub const PDS_SERVICE_TYPE: &str = "AtprotoPersonalDataServer";

/// One line of the `/export` stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationLogEntry {
    pub did: String,
    pub operation: Operation,
    pub cid: String,
    #[serde(default)]
    pub nullified: bool,
    /// Timestamp assigned by the log. Doubles as the export cursor.
    pub created_at: String,
}

/// An identity operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Operation {
    #[serde(rename = "plc_operation")]
    Op(Op),
    #[serde(rename = "plc_tombstone")]
    Tombstone(Tombstone),
    #[serde(rename = "create")]
    LegacyCreate(LegacyCreateOp),
}

impl Operation {
    /// The identity state this operation establishes.
    ///
    /// Legacy creates are converted to the current format; tombstones map to
    /// an empty state.
    pub fn unsigned_op(&self) -> Op {
        match self {
            Operation::Op(op) => op.clone(),
            Operation::LegacyCreate(op) => op.as_unsigned_op(),
            Operation::Tombstone(_) => Op::default(),
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self, Operation::Tombstone(_))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Op {
    #[serde(default)]
    pub rotation_keys: Vec<String>,
    #[serde(default)]
    pub verification_methods: BTreeMap<String, String>,
    #[serde(default)]
    pub also_known_as: Vec<String>,
    #[serde(default)]
    pub services: BTreeMap<String, Service>,
    pub prev: Option<String>,
    #[serde(default)]
    pub sig: String,
}

impl Op {
    /// The primary handle, without its `at://` prefix.
    pub fn handle(&self) -> Option<&str> {
        let aka = self.also_known_as.first()?;
        Some(aka.strip_prefix("at://").unwrap_or(aka))
    }

    /// The endpoint of the hosting server.
    pub fn pds_endpoint(&self) -> Option<&str> {
        self.services
            .get(PDS_SERVICE_ID)
            .map(|s| s.endpoint.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    #[serde(rename = "type")]
    pub kind: String,
    pub endpoint: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    pub prev: String,
    #[serde(default)]
    pub sig: String,
}

/// Genesis operation format used before `plc_operation` existed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyCreateOp {
    pub signing_key: String,
    pub recovery_key: String,
    pub handle: String,
    pub service: String,
    pub prev: Option<String>,
    #[serde(default)]
    pub sig: String,
}

impl LegacyCreateOp {
    pub fn as_unsigned_op(&self) -> Op {
        Op {
            rotation_keys: vec![self.recovery_key.clone(), self.signing_key.clone()],
            verification_methods: BTreeMap::from([(
                "atproto".to_string(),
                self.signing_key.clone(),
            )]),
            also_known_as: vec![format!("at://{}", self.handle)],
            services: BTreeMap::from([(
                PDS_SERVICE_ID.to_string(),
                Service {
                    kind: PDS_SERVICE_TYPE.to_string(),
                    endpoint: self.service.clone(),
                },
            )]),
            prev: self.prev.clone(),
            sig: String::new(),
        }
    }
}
