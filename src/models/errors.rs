use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Authentication failed: {reason}")]
    AuthenticationFailed { reason: String },
    #[error("Nonce unavailable: {reason}")]
    NonceUnavailable { reason: String },
    #[error("Nonce {nonce} was already used for a previous proof")]
    NonceReused { nonce: String },
    #[error("Nonce {nonce} expired before it could be signed")]
    NonceExpired { nonce: String },
    #[error("Invalid proof: {reason}")]
    InvalidProof { reason: String },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration missing for domain {domain}")]
    ConfigurationMissing { domain: String },
    #[error("Invalid contract ABI for domain {domain}: {reason}")]
    InvalidAbi { domain: String, reason: String },
    #[error("Invalid contract address {address}")]
    InvalidContractAddress { address: String },
    #[error("RPC endpoint for domain {domain} serves chain {actual}, expected {expected}")]
    ChainMismatch {
        domain: String,
        expected: u64,
        actual: u64,
    },
}

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Log has no topics")]
    MissingTopics,
    #[error("No ABI event matches selector {selector}")]
    UnknownSelector { selector: String },
    #[error("Failed to decode {event}: {reason}")]
    AbiDecodeFailed { event: String, reason: String },
    #[error("Missing required field in log: {field}")]
    MissingField { field: String },
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store unreachable: {reason}")]
    Unreachable { reason: String },
    #[error("Invalid path segment {segment:?}")]
    InvalidSegment { segment: String },
    #[error("Record at {path} could not be read: {reason}")]
    MalformedRecord { path: String, reason: String },
}

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Publish failed for {tx_hash}:{log_index}: {source}")]
    PublishFailed {
        tx_hash: String,
        log_index: u64,
        #[source]
        source: StoreError,
    },
}

#[derive(Error, Debug)]
pub enum CursorError {
    #[error("Cursor I/O failed for domain {domain}: {source}")]
    Io {
        domain: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Corrupt cursor value for domain {domain}: {value:?}")]
    Corrupt { domain: String, value: String },
}

#[derive(Error, Debug)]
pub enum ReaderError {
    #[error(transparent)]
    InvalidContract(#[from] ConfigError),
    #[error("Subscription setup failed: {0}")]
    Store(#[from] StoreError),
}

#[derive(Error, Debug)]
pub enum IndexerError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Cursor(#[from] CursorError),
    #[error("Log source unavailable: {0}")]
    Source(anyhow::Error),
    #[error("Cannot start indexer in state {state}")]
    InvalidState { state: String },
}
