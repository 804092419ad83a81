use alloy_signer_local::PrivateKeySigner;
use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{self, EnvFilter};
use url::Url;

use evm_event_mesh::auth::{NonceProvider, RandomNonceProvider, RemoteNonceProvider, WalletAuthenticator};
use evm_event_mesh::indexer::report::ReportClient;
use evm_event_mesh::indexer::rpc::logs::PollSettings;
use evm_event_mesh::indexer::{
    IndexerDeps, IndexerService, IndexerSettings, RpcConnector, StaticConfigSource,
};
use evm_event_mesh::metrics::Metrics;
use evm_event_mesh::reader::ReaderService;
use evm_event_mesh::storage::cursor::FileCursorStore;
use evm_event_mesh::storage::mesh::mesh;
use evm_event_mesh::storage::propagation::PropagationAdapter;
use evm_event_mesh::utils::load_config;
use evm_event_mesh::utils::retry::RetryConfig;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    println!();
    info!("=========================== INITIALIZING ===========================");

    let config_path = std::env::var("EVENT_MESH_CONFIG").unwrap_or_else(|_| "config.yml".to_string());
    let config = match load_config(&config_path) {
        Ok(config) => {
            info!("Config loaded successfully");
            config
        }
        Err(e) => {
            error!("Failed to load config: {}", e);
            return Err(anyhow!(e));
        }
    };

    // Initialize optional metrics
    let metrics = if config.metrics.enabled {
        let metrics = Metrics::new()?;
        metrics
            .start_metrics_server(&config.metrics.address, config.metrics.port)
            .await?;
        Some(metrics)
    } else {
        info!("Metrics are disabled");
        None
    };

    // Every indexer writes through peer 0; readers are spread over the mesh
    let peers = mesh(config.store.peers.max(1));
    info!("Started store mesh with {} peers", peers.len());
    let publisher = PropagationAdapter::new(Arc::new(peers[0].clone()));

    let wallet: PrivateKeySigner = config
        .wallet
        .private_key
        .parse()
        .context("invalid wallet private key")?;
    info!("Reporting as {}", wallet.address());

    let http = reqwest::Client::new();
    let nonce_ttl = Duration::from_secs(config.nonce.ttl_secs);
    let nonces: Arc<dyn NonceProvider> = match &config.nonce.url {
        Some(url) => Arc::new(RemoteNonceProvider::new(
            http.clone(),
            Url::parse(url).context("invalid nonce url")?,
            nonce_ttl,
        )),
        None => Arc::new(RandomNonceProvider::new(nonce_ttl)),
    };
    let authenticator = Arc::new(WalletAuthenticator::new(
        Arc::new(wallet),
        nonces,
        config.siwe.clone(),
        config.chain_id,
    ));

    let reporter = match &config.report_url {
        Some(url) => Some(ReportClient::new(
            http.clone(),
            Url::parse(url).context("invalid report url")?,
        )),
        None => None,
    };

    let deps = IndexerDeps {
        authenticator,
        config_source: Arc::new(StaticConfigSource::new(config.domains.clone())),
        connector: Arc::new(RpcConnector::new(
            config.chain_id,
            PollSettings {
                poll_interval: Duration::from_millis(config.poll_interval_ms),
                batch_size: config.batch_size,
                backoff: RetryConfig::reconnect(),
            },
            metrics.clone(),
        )),
        adapter: publisher,
        cursor_store: Arc::new(FileCursorStore::new(&config.state_dir)),
        reporter,
        metrics: metrics.clone(),
    };
    let settings = IndexerSettings {
        retry_queue_capacity: config.retry_queue_capacity,
        ..IndexerSettings::default()
    };

    let mut indexers = Vec::new();
    for domain in config.domains.keys() {
        let service = IndexerService::new(domain, deps.clone(), settings.clone());
        if let Err(e) = service.start().await {
            error!("Indexer for domain {} not started: {}", domain, e);
        }
        indexers.push(service);
    }

    let mut readers = Vec::new();
    for (i, reader_config) in config.readers.iter().enumerate() {
        let peer = peers[(i + 1) % peers.len()].clone();
        let reader = ReaderService::new(
            &reader_config.domain,
            PropagationAdapter::new(Arc::new(peer)),
            reader_config.dedup_capacity,
            metrics.clone(),
        );

        let domain = reader_config.domain.clone();
        let subscribed = reader.subscribe_to_events(
            &reader_config.contract_address,
            reader_config.event_name.as_deref(),
            move |event| {
                info!(
                    "[{}] {} {}:{} at block {}: {}",
                    domain,
                    event.event_name,
                    event.transaction_hash,
                    event.log_index,
                    event.block_number,
                    serde_json::to_string(&event.event_data).unwrap_or_default()
                );
            },
        );
        match subscribed {
            Ok(id) => info!("Reader {} subscribed to {}", id, reader_config.contract_address),
            Err(e) => warn!("Reader for {} not subscribed: {}", reader_config.contract_address, e),
        }
        readers.push(reader);
    }

    info!("============================ RUNNING ============================");
    signal::ctrl_c().await.context("failed to listen for Ctrl+C")?;
    info!("Received Ctrl+C signal, initiating shutdown...");

    for reader in &readers {
        reader.disconnect_all();
    }
    for indexer in &indexers {
        indexer.stop();
        info!("Domain {} final status: {:?}", indexer.domain(), indexer.status());
    }

    Ok(())
}
