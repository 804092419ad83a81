use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub address: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiweConfig {
    pub domain: String,
    pub uri: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletConfig {
    pub private_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NonceConfig {
    pub ttl_secs: u64,
    // Server-issued nonces are fetched from here when set
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub peers: usize,
}

/// Per-domain contract configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainConfig {
    // Aliases cover keys lowercased by environment overrides
    #[serde(alias = "rpcurl", alias = "rpc_url")]
    pub rpc_url: String,
    #[serde(alias = "contractaddress", alias = "contract_address")]
    pub contract_address: String,
    #[serde(alias = "contractabi", alias = "contract_abi")]
    pub contract_abi: serde_json::Value,
    #[serde(default, alias = "startblock", alias = "start_block")]
    pub start_block: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaderConfig {
    pub domain: String,
    pub contract_address: String,
    pub event_name: Option<String>,
    pub dedup_capacity: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub chain_id: u64,
    pub siwe: SiweConfig,
    pub wallet: WalletConfig,
    pub nonce: NonceConfig,
    pub store: StoreConfig,
    pub state_dir: String,
    pub poll_interval_ms: u64,
    pub batch_size: u64,
    pub retry_queue_capacity: usize,
    pub report_url: Option<String>,
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub domains: BTreeMap<String, DomainConfig>,
    #[serde(default)]
    pub readers: Vec<ReaderConfig>,
}
