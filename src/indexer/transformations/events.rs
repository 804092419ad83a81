use alloy_dyn_abi::DynSolValue;
use alloy_primitives::hex;
use indexmap::IndexMap;
use serde_json::Value;
use tracing::debug;

use crate::models::event::{DecodedLog, EventRecord};
use crate::utils::unix_now;

pub trait EventNormalizer {
    /// Build the canonical record. A missing block timestamp is replaced by
    /// the receive time and the record is flagged as approximate.
    fn normalize(self, block_timestamp: Option<u64>) -> EventRecord;
}

impl EventNormalizer for DecodedLog {
    fn normalize(self, block_timestamp: Option<u64>) -> EventRecord {
        let (block_timestamp, timestamp_approximate) = match block_timestamp {
            Some(ts) => (ts, false),
            None => {
                debug!(
                    "No block timestamp for block {}, using receive time",
                    self.block_number
                );
                (unix_now(), true)
            }
        };

        let event_data: IndexMap<String, Value> = self
            .args
            .into_iter()
            .filter(|(name, _)| is_named(name))
            .map(|(name, value)| (name, to_json(value)))
            .collect();

        EventRecord {
            block_number: self.block_number,
            block_timestamp,
            timestamp_approximate,
            transaction_hash: format!("{:#x}", self.transaction_hash),
            log_index: self.log_index,
            contract_address: format!("{:#x}", self.address),
            event_name: self.event_name,
            event_data,
        }
    }
}

// Positional artifacts of tuple/array decoding carry empty or numeric names
fn is_named(name: &str) -> bool {
    !name.is_empty() && !name.chars().all(|c| c.is_ascii_digit())
}

fn to_json(value: DynSolValue) -> Value {
    match value {
        DynSolValue::Bool(b) => Value::Bool(b),
        // Integers as decimal strings; uint256 does not fit a JSON number
        DynSolValue::Int(i, _) => Value::String(i.to_string()),
        DynSolValue::Uint(u, _) => Value::String(u.to_string()),
        DynSolValue::FixedBytes(word, size) => {
            Value::String(hex::encode_prefixed(&word[..size.min(32)]))
        }
        DynSolValue::Bytes(bytes) => Value::String(hex::encode_prefixed(bytes)),
        DynSolValue::String(s) => Value::String(s),
        DynSolValue::Address(address) => Value::String(address.to_checksum(None)),
        DynSolValue::Function(function) => Value::String(hex::encode_prefixed(function.as_slice())),
        DynSolValue::Array(values)
        | DynSolValue::FixedArray(values)
        | DynSolValue::Tuple(values) => Value::Array(values.into_iter().map(to_json).collect()),
        #[allow(unreachable_patterns)]
        other => Value::String(format!("{other:?}")),
    }
}
