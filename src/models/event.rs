use alloy_dyn_abi::DynSolValue;
use alloy_primitives::{Address, B256};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

////////////////////////////////////// RPC Data ////////////////////////////////////////
// A chain log after it has been matched against the contract ABI
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedLog {
    pub event_name: String,
    // Declared ABI order, indexed and body arguments interleaved as declared
    pub args: Vec<(String, DynSolValue)>,
    pub block_number: u64,
    pub transaction_hash: B256,
    pub log_index: u64,
    pub address: Address,
}

/////////////////////////////////// Canonical Data ///////////////////////////////////
/// Canonical representation of one chain event.
///
/// `(transaction_hash, log_index)` identifies a record. Records are never
/// mutated after the normalizer builds them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub block_number: u64,
    pub block_timestamp: u64,
    #[serde(default)]
    pub timestamp_approximate: bool,
    pub transaction_hash: String,
    pub log_index: u64,
    pub contract_address: String,
    pub event_name: String,
    pub event_data: IndexMap<String, serde_json::Value>,
}

impl EventRecord {
    pub fn key(&self) -> EventKey {
        EventKey {
            transaction_hash: self.transaction_hash.to_lowercase(),
            log_index: self.log_index,
        }
    }

    /// Resource identifier used to scope a per-event proof.
    pub fn resource(&self) -> String {
        format!("evmEvent:{}:{}", self.transaction_hash, self.log_index)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventKey {
    pub transaction_hash: String,
    pub log_index: u64,
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.transaction_hash, self.log_index)
    }
}
