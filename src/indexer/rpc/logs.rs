use alloy_eips::BlockNumberOrTag;
use alloy_primitives::Address;
use alloy_provider::{DynProvider, Provider, ProviderBuilder};
use alloy_rpc_types_eth::{Filter, Log};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{stream, Stream};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::indexer::rpc::abi::ContractAbi;
use crate::metrics::Metrics;
use crate::models::common::DomainConfig;
use crate::models::errors::ConfigError;
use crate::models::event::DecodedLog;
use crate::utils::retry::{retry, RetryConfig};

const LOG_CHANNEL_CAPACITY: usize = 1024;

/// A stream of ABI-decoded logs from one contract.
pub type LogStream = Pin<Box<dyn Stream<Item = DecodedLog> + Send>>;

/// Source of decoded contract logs.
#[async_trait]
pub trait LogSource: Send + Sync {
    /// Latest block number on chain.
    async fn head(&self) -> Result<u64>;

    /// Stream every decodable log from `from_block` onwards, historical
    /// blocks first, then live ones as they are produced.
    async fn watch(&self, from_block: u64) -> Result<LogStream>;

    /// Block timestamp in unix seconds, `None` if the node has no such block.
    async fn block_timestamp(&self, block_number: u64) -> Result<Option<u64>>;

    /// Cancel the running watch, if any.
    fn stop(&self);
}

#[derive(Debug, Clone)]
pub struct PollSettings {
    pub poll_interval: Duration,
    pub batch_size: u64,
    /// Backoff around each RPC call of the watch loop.
    pub backoff: RetryConfig,
}

/// Next inclusive block range to request, `None` while `next_block` is
/// beyond the chain head.
fn next_range(next_block: u64, head: u64, batch_size: u64) -> Option<(u64, u64)> {
    if next_block > head {
        return None;
    }
    let last = next_block.saturating_add(batch_size.max(1) - 1);
    Some((next_block, head.min(last)))
}

struct SourceInner {
    domain: String,
    provider: DynProvider,
    address: Address,
    abi: ContractAbi,
    settings: PollSettings,
    metrics: Option<Metrics>,
}

/// `eth_getLogs` polling source for one contract.
///
/// Ranges are requested from the last delivered block + 1, so a dropped
/// connection resumes without gaps once the endpoint is reachable again.
pub struct RpcLogSource {
    inner: Arc<SourceInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RpcLogSource {
    pub async fn connect(
        domain: &str,
        config: &DomainConfig,
        settings: PollSettings,
        metrics: Option<Metrics>,
    ) -> Result<Self> {
        info!("Connecting to RPC for domain {}: {}", domain, config.rpc_url);
        let provider = ProviderBuilder::new()
            .connect(&config.rpc_url)
            .await
            .with_context(|| format!("Invalid RPC URL: {}", config.rpc_url))?
            .erased();

        Self::with_provider(domain, config, provider, settings, metrics)
    }

    /// Build a source over an existing provider.
    pub fn with_provider(
        domain: &str,
        config: &DomainConfig,
        provider: DynProvider,
        settings: PollSettings,
        metrics: Option<Metrics>,
    ) -> Result<Self> {
        let address: Address = config.contract_address.parse().map_err(|_| {
            ConfigError::InvalidContractAddress {
                address: config.contract_address.clone(),
            }
        })?;
        let abi = ContractAbi::from_json(domain, &config.contract_abi)?;
        debug!(
            "Domain {} decodes events: {}",
            domain,
            abi.event_names().join(", ")
        );

        Ok(Self {
            inner: Arc::new(SourceInner {
                domain: domain.to_string(),
                provider,
                address,
                abi,
                settings,
                metrics,
            }),
            task: Mutex::new(None),
        })
    }

    pub async fn chain_id(&self) -> Result<u64> {
        let inner = &self.inner;
        inner
            .instrumented("get_chain_id", || inner.provider.get_chain_id())
            .await
    }

    /// Fail unless the endpoint serves `expected`.
    pub async fn ensure_chain(&self, expected: u64) -> Result<()> {
        let actual = self.chain_id().await?;
        if actual != expected {
            return Err(ConfigError::ChainMismatch {
                domain: self.inner.domain.clone(),
                expected,
                actual,
            }
            .into());
        }
        Ok(())
    }
}

impl SourceInner {
    async fn instrumented<F, Fut, T, E>(&self, method: &'static str, call: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: std::fmt::Display,
    {
        let labels = Metrics::rpc_labels(&self.domain, method);
        let start = Instant::now();

        if let Some(metrics) = &self.metrics {
            metrics.rpc_requests.add(1, &labels);
        }

        let result = call().await;

        if let Some(metrics) = &self.metrics {
            metrics
                .rpc_latency
                .record(start.elapsed().as_secs_f64(), &labels);
            if result.is_err() {
                metrics.rpc_errors.add(1, &labels);
            }
        }

        result.map_err(|e| anyhow!("RPC error in {}: {}", method, e))
    }

    async fn get_logs(&self, from_block: u64, to_block: u64) -> Result<Vec<Log>> {
        let filter = Filter::new()
            .address(self.address)
            .from_block(from_block)
            .to_block(to_block);

        self.instrumented("get_logs", || self.provider.get_logs(&filter))
            .await
    }

    async fn head(&self) -> Result<u64> {
        self.instrumented("get_block_number", || self.provider.get_block_number())
            .await
    }

    fn decode_batch(&self, logs: Vec<Log>) -> Vec<DecodedLog> {
        let labels = Metrics::domain_labels(&self.domain);
        if let Some(metrics) = &self.metrics {
            metrics.logs_received.add(logs.len() as u64, &labels);
        }

        let mut decoded = Vec::with_capacity(logs.len());
        for log in logs {
            if log.removed {
                debug!("Skipping removed log {:?}", log.transaction_hash);
                continue;
            }
            match self.abi.decode(&log) {
                Ok(event) => decoded.push(event),
                Err(e) => {
                    // Unrecognised logs are dropped, never fatal
                    warn!(
                        "Dropping undecodable log for domain {} (tx {:?}, index {:?}): {}",
                        self.domain, log.transaction_hash, log.log_index, e
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.decode_errors.add(1, &labels);
                    }
                }
            }
        }
        decoded
    }

    async fn run(self: Arc<Self>, mut next_block: u64, tx: mpsc::Sender<DecodedLog>) {
        let backoff = &self.settings.backoff;
        info!(
            "Watching {} for domain {} from block {}",
            self.address, self.domain, next_block
        );

        loop {
            let head = match retry(|| self.head(), backoff, "get_block_number").await {
                Ok(head) => head,
                Err(e) => {
                    warn!("Head lookup abandoned for domain {}: {}", self.domain, e);
                    tokio::time::sleep(self.settings.poll_interval).await;
                    continue;
                }
            };

            let Some((from_block, to_block)) =
                next_range(next_block, head, self.settings.batch_size)
            else {
                tokio::time::sleep(self.settings.poll_interval).await;
                continue;
            };

            let logs = match retry(
                || self.get_logs(from_block, to_block),
                backoff,
                "get_logs",
            )
            .await
            {
                Ok(logs) => logs,
                Err(e) => {
                    warn!(
                        "Log fetch for blocks {}-{} abandoned for domain {}: {}",
                        from_block, to_block, self.domain, e
                    );
                    continue;
                }
            };

            debug!(
                "Domain {}: {} logs in blocks {}-{}",
                self.domain,
                logs.len(),
                from_block,
                to_block
            );

            for event in self.decode_batch(logs) {
                if tx.send(event).await.is_err() {
                    debug!("Log consumer for domain {} went away", self.domain);
                    return;
                }
            }

            next_block = to_block + 1;
        }
    }
}

#[async_trait]
impl LogSource for RpcLogSource {
    async fn head(&self) -> Result<u64> {
        self.inner.head().await
    }

    async fn watch(&self, from_block: u64) -> Result<LogStream> {
        let (tx, rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);
        let handle = tokio::spawn(self.inner.clone().run(from_block, tx));

        let mut task = self.task.lock().map_err(|_| anyhow!("log source lock poisoned"))?;
        if let Some(previous) = task.replace(handle) {
            previous.abort();
        }

        Ok(receiver_stream(rx))
    }

    async fn block_timestamp(&self, block_number: u64) -> Result<Option<u64>> {
        let inner = &self.inner;
        let block = inner
            .instrumented("get_block_by_number", || async {
                inner
                    .provider
                    .get_block_by_number(BlockNumberOrTag::Number(block_number))
                    .await
            })
            .await?;

        Ok(block.map(|block| block.header.timestamp))
    }

    fn stop(&self) {
        if let Ok(mut task) = self.task.lock() {
            if let Some(handle) = task.take() {
                info!("Stopping log source for domain {}", self.inner.domain);
                handle.abort();
            }
        }
    }
}

impl Drop for RpcLogSource {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Adapt an mpsc receiver into a boxed stream.
pub fn receiver_stream<T: Send + 'static>(rx: mpsc::Receiver<T>) -> Pin<Box<dyn Stream<Item = T> + Send>> {
    Box::pin(stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    }))
}
