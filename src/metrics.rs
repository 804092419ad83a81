use std::sync::Arc;
use tracing::info;

use anyhow::{Context, Result};
use axum::{http::StatusCode, routing::get, Router};
use opentelemetry::metrics::{Counter, Gauge, Histogram, MeterProvider};
use opentelemetry::KeyValue;
use opentelemetry_sdk::metrics::{MetricError, SdkMeterProvider};
use prometheus::{Encoder, TextEncoder};
use std::net::SocketAddr;

#[derive(Clone)]
pub struct Metrics {
    registry: Arc<prometheus::Registry>,
    _provider: SdkMeterProvider,

    // Indexer metrics
    pub logs_received: Counter<u64>,
    pub decode_errors: Counter<u64>,
    pub events_published: Counter<u64>,
    pub publish_failures: Counter<u64>,
    pub auth_failures: Counter<u64>,
    pub cursor_block: Gauge<u64>,
    pub retry_queue_depth: Gauge<u64>,

    // Reader metrics
    pub reader_deliveries: Counter<u64>,
    pub reader_duplicates: Counter<u64>,

    // RPC metrics
    pub rpc_requests: Counter<u64>,
    pub rpc_errors: Counter<u64>,
    pub rpc_latency: Histogram<f64>,
}

impl Metrics {
    pub fn new() -> Result<Self, MetricError> {
        let registry = prometheus::Registry::new();

        // Configure OpenTelemetry to use this registry
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()?;

        let provider = SdkMeterProvider::builder().with_reader(exporter).build();
        let meter = provider.meter("event_mesh_metrics");

        let logs_received = meter
            .u64_counter("indexer_logs_received")
            .with_description("Chain logs received from the RPC endpoint")
            .build();

        let decode_errors = meter
            .u64_counter("indexer_decode_errors")
            .with_description("Chain logs dropped because they did not match the ABI")
            .build();

        let events_published = meter
            .u64_counter("indexer_events_published")
            .with_description("Event records acknowledged by the propagation store")
            .build();

        let publish_failures = meter
            .u64_counter("indexer_publish_failures")
            .with_description("Event records the propagation store did not acknowledge")
            .build();

        let auth_failures = meter
            .u64_counter("indexer_auth_failures")
            .with_description("Wallet signing attempts that failed")
            .build();

        let cursor_block = meter
            .u64_gauge("indexer_cursor_block_number")
            .with_description("Highest block with a published event and no unpublished predecessor")
            .build();

        let retry_queue_depth = meter
            .u64_gauge("indexer_retry_queue_depth")
            .with_description("Events waiting to be republished")
            .build();

        let reader_deliveries = meter
            .u64_counter("reader_deliveries")
            .with_description("Distinct events delivered to reader callbacks")
            .build();

        let reader_duplicates = meter
            .u64_counter("reader_duplicate_deliveries")
            .with_description("Repeated deliveries absorbed by reader deduplication")
            .build();

        let rpc_requests = meter
            .u64_counter("indexer_rpc_requests")
            .with_description("Number of RPC requests made")
            .build();

        let rpc_errors = meter
            .u64_counter("indexer_rpc_errors")
            .with_description("Number of RPC errors encountered")
            .build();

        let rpc_latency = meter
            .f64_histogram("indexer_rpc_latency")
            .with_description("RPC request latency")
            .with_boundaries(vec![
                0.025, 0.05, 0.075, 0.1, 0.15, 0.2, 0.3, 0.5, 1.0, 5.0, 10.0,
            ])
            .with_unit("s")
            .build();

        Ok(Self {
            registry: Arc::new(registry),
            _provider: provider,
            logs_received,
            decode_errors,
            events_published,
            publish_failures,
            auth_failures,
            cursor_block,
            retry_queue_depth,
            reader_deliveries,
            reader_duplicates,
            rpc_requests,
            rpc_errors,
            rpc_latency,
        })
    }

    pub fn domain_labels(domain: &str) -> [KeyValue; 1] {
        [KeyValue::new("domain", domain.to_string())]
    }

    pub fn rpc_labels(domain: &str, method: &'static str) -> [KeyValue; 2] {
        [
            KeyValue::new("domain", domain.to_string()),
            KeyValue::new("method", method),
        ]
    }

    pub async fn start_metrics_server(&self, addr: &str, port: u16) -> Result<()> {
        let addr = format!("{addr}:{port}")
            .parse::<SocketAddr>()
            .context("invalid metrics address")?;
        let registry = self.registry.clone();

        let app = Router::new().route("/metrics", get(move || metrics_handler(registry.clone())));

        // Determine the access URL based on the binding address. Only used for logging.
        let access_url = if addr.ip().to_string() == "0.0.0.0" {
            format!("http://localhost:{port}/metrics")
        } else {
            format!("http://{}:{port}/metrics", addr.ip())
        };

        info!(
            "Starting metrics server - binding to {} (accessible at {})",
            addr, access_url
        );

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .context("failed to bind metrics listener")?;

        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!("Metrics server stopped: {}", e);
            }
        });

        Ok(())
    }
}

async fn metrics_handler(registry: Arc<prometheus::Registry>) -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buffer = vec![];
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    String::from_utf8(buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}
