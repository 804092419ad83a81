//! Contract ABI handling: maps raw logs onto declared events.

use alloy_dyn_abi::{DynSolType, DynSolValue, Specifier};
use alloy_json_abi::{Event, JsonAbi};
use alloy_primitives::{B256, LogData};
use alloy_rpc_types_eth::Log;
use std::collections::HashMap;

use crate::models::errors::{ConfigError, DecodeError};
use crate::models::event::DecodedLog;

/// Events of one contract, keyed by topic-0 selector.
#[derive(Debug, Clone)]
pub struct ContractAbi {
    events: HashMap<B256, Vec<Event>>,
}

impl ContractAbi {
    pub fn from_json(domain: &str, abi: &serde_json::Value) -> Result<Self, ConfigError> {
        let parsed: JsonAbi =
            serde_json::from_value(abi.clone()).map_err(|e| ConfigError::InvalidAbi {
                domain: domain.to_string(),
                reason: e.to_string(),
            })?;

        let mut events: HashMap<B256, Vec<Event>> = HashMap::new();
        // Anonymous events carry no selector and cannot be matched
        for event in parsed.events().filter(|event| !event.anonymous) {
            events.entry(event.selector()).or_default().push(event.clone());
        }

        if events.is_empty() {
            return Err(ConfigError::InvalidAbi {
                domain: domain.to_string(),
                reason: "ABI declares no events".to_string(),
            });
        }

        Ok(Self { events })
    }

    pub fn event_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .events
            .values()
            .flatten()
            .map(|event| event.name.clone())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Decode an RPC log into its declared event.
    pub fn decode(&self, log: &Log) -> Result<DecodedLog, DecodeError> {
        let block_number = log.block_number.ok_or_else(|| DecodeError::MissingField {
            field: "block_number".to_string(),
        })?;
        let transaction_hash = log.transaction_hash.ok_or_else(|| DecodeError::MissingField {
            field: "transaction_hash".to_string(),
        })?;
        let log_index = log.log_index.ok_or_else(|| DecodeError::MissingField {
            field: "log_index".to_string(),
        })?;

        let (event_name, args) = self.decode_data(&log.inner.data)?;

        Ok(DecodedLog {
            event_name,
            args,
            block_number,
            transaction_hash,
            log_index,
            address: log.inner.address,
        })
    }

    /// Decode topics and data, trying every event sharing the selector.
    /// ERC-20 and ERC-721 `Transfer` share a selector but differ in indexing.
    pub fn decode_data(
        &self,
        data: &LogData,
    ) -> Result<(String, Vec<(String, DynSolValue)>), DecodeError> {
        let selector = data.topics().first().ok_or(DecodeError::MissingTopics)?;
        let candidates = self
            .events
            .get(selector)
            .ok_or_else(|| DecodeError::UnknownSelector {
                selector: selector.to_string(),
            })?;

        let mut last_error = None;
        for event in candidates {
            match decode_event(event, data) {
                Ok(args) => return Ok((event.name.clone(), args)),
                Err(e) => last_error = Some(e),
            }
        }

        Err(last_error.unwrap_or_else(|| DecodeError::UnknownSelector {
            selector: selector.to_string(),
        }))
    }
}

fn decode_event(
    event: &Event,
    data: &LogData,
) -> Result<Vec<(String, DynSolValue)>, DecodeError> {
    let failed = |reason: String| DecodeError::AbiDecodeFailed {
        event: event.name.clone(),
        reason,
    };

    let indexed_count = event.inputs.iter().filter(|input| input.indexed).count();
    let topics = data.topics();
    if topics.len() != indexed_count + 1 {
        return Err(failed(format!(
            "expected {} topics, got {}",
            indexed_count + 1,
            topics.len()
        )));
    }

    let mut body_types = Vec::new();
    for input in event.inputs.iter().filter(|input| !input.indexed) {
        body_types.push(input.resolve().map_err(|e| failed(e.to_string()))?);
    }

    let body = if body_types.is_empty() {
        Vec::new()
    } else {
        match DynSolType::Tuple(body_types)
            .abi_decode_sequence(&data.data)
            .map_err(|e| failed(e.to_string()))?
        {
            DynSolValue::Tuple(values) => values,
            other => vec![other],
        }
    };

    // Walk the declared inputs so arguments keep their ABI order
    let mut topic_iter = topics.iter().skip(1);
    let mut body_iter = body.into_iter();
    let mut args = Vec::with_capacity(event.inputs.len());
    for input in &event.inputs {
        let value = if input.indexed {
            let topic = topic_iter
                .next()
                .ok_or_else(|| failed(format!("missing topic for {}", input.name)))?;
            let ty = input.resolve().map_err(|e| failed(e.to_string()))?;
            decode_topic(&ty, topic).map_err(|e| failed(e))?
        } else {
            body_iter
                .next()
                .ok_or_else(|| failed(format!("missing data for {}", input.name)))?
        };
        args.push((input.name.clone(), value));
    }

    Ok(args)
}

fn decode_topic(ty: &DynSolType, topic: &B256) -> Result<DynSolValue, String> {
    match ty {
        // Reference types are stored as the keccak256 of their encoding
        DynSolType::String
        | DynSolType::Bytes
        | DynSolType::Array(_)
        | DynSolType::FixedArray(..)
        | DynSolType::Tuple(_) => Ok(DynSolValue::FixedBytes(*topic, 32)),
        _ => ty.abi_decode(topic.as_slice()).map_err(|e| e.to_string()),
    }
}
