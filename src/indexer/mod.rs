pub mod report;
pub mod retry_queue;
pub mod rpc;
pub mod transformations;

use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::auth::WalletAuthenticator;
use crate::indexer::report::ReportClient;
use crate::indexer::retry_queue::RetryQueue;
use crate::indexer::rpc::logs::{LogSource, LogStream, PollSettings, RpcLogSource};
use crate::indexer::transformations::events::EventNormalizer;
use crate::metrics::Metrics;
use crate::models::common::DomainConfig;
use crate::models::errors::{ConfigError, IndexerError};
use crate::models::event::{DecodedLog, EventRecord};
use crate::storage::cursor::{Cursor, CursorStore};
use crate::storage::propagation::PropagationAdapter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexerState {
    Uninitialized,
    Authenticating,
    ConfigLoaded,
    Listening,
    Reporting,
    Stopped,
    Disabled,
}

impl fmt::Display for IndexerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexerStatus {
    pub state: IndexerState,
    pub reporting_enabled: bool,
    /// Why the service last left the happy path.
    pub reason: Option<String>,
    pub cursor: u64,
    /// Events waiting in the retry queue.
    pub pending: usize,
}

impl Default for IndexerStatus {
    fn default() -> Self {
        Self {
            state: IndexerState::Uninitialized,
            reporting_enabled: false,
            reason: None,
            cursor: 0,
            pending: 0,
        }
    }
}

/// Where domain configuration comes from.
#[async_trait]
pub trait DomainConfigSource: Send + Sync {
    async fn domain_config(&self, domain: &str) -> Result<DomainConfig, ConfigError>;
}

/// Domain table read from the config file.
pub struct StaticConfigSource {
    domains: BTreeMap<String, DomainConfig>,
}

impl StaticConfigSource {
    pub fn new(domains: BTreeMap<String, DomainConfig>) -> Self {
        Self { domains }
    }
}

#[async_trait]
impl DomainConfigSource for StaticConfigSource {
    async fn domain_config(&self, domain: &str) -> Result<DomainConfig, ConfigError> {
        self.domains
            .get(domain)
            .cloned()
            .ok_or_else(|| ConfigError::ConfigurationMissing {
                domain: domain.to_string(),
            })
    }
}

/// Opens a log source for a domain once its configuration is known.
#[async_trait]
pub trait LogSourceConnector: Send + Sync {
    async fn connect(&self, domain: &str, config: &DomainConfig) -> Result<Arc<dyn LogSource>>;
}

/// Connects RPC log sources, refusing endpoints on another chain.
pub struct RpcConnector {
    chain_id: u64,
    settings: PollSettings,
    metrics: Option<Metrics>,
}

impl RpcConnector {
    pub fn new(chain_id: u64, settings: PollSettings, metrics: Option<Metrics>) -> Self {
        Self {
            chain_id,
            settings,
            metrics,
        }
    }
}

#[async_trait]
impl LogSourceConnector for RpcConnector {
    async fn connect(&self, domain: &str, config: &DomainConfig) -> Result<Arc<dyn LogSource>> {
        let source =
            RpcLogSource::connect(domain, config, self.settings.clone(), self.metrics.clone())
                .await?;
        source.ensure_chain(self.chain_id).await?;
        Ok(Arc::new(source))
    }
}

/// Collaborators of one indexer instance.
#[derive(Clone)]
pub struct IndexerDeps {
    pub authenticator: Arc<WalletAuthenticator>,
    pub config_source: Arc<dyn DomainConfigSource>,
    pub connector: Arc<dyn LogSourceConnector>,
    pub adapter: PropagationAdapter,
    pub cursor_store: Arc<dyn CursorStore>,
    pub reporter: Option<ReportClient>,
    pub metrics: Option<Metrics>,
}

#[derive(Debug, Clone)]
pub struct IndexerSettings {
    pub retry_queue_capacity: usize,
    pub max_publish_attempts: u32,
    pub retry_interval: Duration,
}

impl Default for IndexerSettings {
    fn default() -> Self {
        Self {
            retry_queue_capacity: 1_000,
            max_publish_attempts: 10,
            retry_interval: Duration::from_secs(5),
        }
    }
}

/// Watches one domain's contract and publishes its events.
pub struct IndexerService {
    domain: String,
    deps: IndexerDeps,
    settings: IndexerSettings,
    status: Arc<watch::Sender<IndexerStatus>>,
    stopped: Arc<AtomicBool>,
    source: Mutex<Option<Arc<dyn LogSource>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl IndexerService {
    pub fn new(domain: &str, deps: IndexerDeps, settings: IndexerSettings) -> Self {
        let (status, _) = watch::channel(IndexerStatus::default());
        Self {
            domain: domain.to_lowercase(),
            deps,
            settings,
            status: Arc::new(status),
            stopped: Arc::new(AtomicBool::new(false)),
            source: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn status(&self) -> IndexerStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<IndexerStatus> {
        self.status.subscribe()
    }

    pub async fn start(&self) -> Result<(), IndexerError> {
        let state = self.status.borrow().state;
        if state != IndexerState::Uninitialized {
            return Err(IndexerError::InvalidState {
                state: state.to_string(),
            });
        }

        info!("Starting indexer for domain {}", self.domain);
        self.status.send_modify(|s| s.state = IndexerState::Authenticating);

        let statement = format!("Sign in to index domain {}", self.domain);
        if let Err(e) = self.deps.authenticator.build_proof(&statement, None).await {
            error!("Authentication failed for domain {}: {}", self.domain, e);
            self.record_auth_failure();
            self.status.send_modify(|s| {
                s.state = IndexerState::Uninitialized;
                s.reporting_enabled = false;
                s.reason = Some(e.to_string());
            });
            return Err(e.into());
        }
        self.status.send_modify(|s| {
            s.reporting_enabled = true;
            s.reason = None;
        });

        let config = match self.deps.config_source.domain_config(&self.domain).await {
            Ok(config) => config,
            Err(e) => {
                // Needs an operator; never retried
                error!("Disabling indexer for domain {}: {}", self.domain, e);
                self.status.send_modify(|s| {
                    s.state = IndexerState::Disabled;
                    s.reporting_enabled = false;
                    s.reason = Some(e.to_string());
                });
                return Err(e.into());
            }
        };
        self.status.send_modify(|s| s.state = IndexerState::ConfigLoaded);

        match self.listen(&config).await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!("Indexer for domain {} could not start: {}", self.domain, e);
                self.status.send_modify(|s| {
                    s.state = IndexerState::Uninitialized;
                    s.reporting_enabled = false;
                    s.reason = Some(e.to_string());
                });
                Err(e)
            }
        }
    }

    async fn listen(&self, config: &DomainConfig) -> Result<(), IndexerError> {
        let cursor = Cursor::restore(&self.domain, self.deps.cursor_store.clone()).await?;
        let source = self
            .deps
            .connector
            .connect(&self.domain, config)
            .await
            .map_err(IndexerError::Source)?;

        // Other events of the cursor block may still be unpublished, so replay it
        let from_block = if cursor.value() > 0 {
            cursor.value()
        } else if let Some(start_block) = config.start_block {
            start_block
        } else {
            source.head().await.map_err(IndexerError::Source)?
        };

        let stream = source.watch(from_block).await.map_err(IndexerError::Source)?;
        info!(
            "Domain {} listening from block {} (cursor {})",
            self.domain,
            from_block,
            cursor.value()
        );

        let cursor_value = cursor.value();
        self.status.send_modify(|s| {
            s.state = IndexerState::Listening;
            s.cursor = cursor_value;
        });

        let pipeline = Pipeline {
            domain: self.domain.clone(),
            highest_published: cursor.value(),
            cursor,
            queue: RetryQueue::new(
                self.settings.retry_queue_capacity,
                self.settings.max_publish_attempts,
            ),
            source: source.clone(),
            deps: self.deps.clone(),
            status: self.status.clone(),
            stopped: self.stopped.clone(),
        };
        let handle = tokio::spawn(pipeline.run(stream, self.settings.retry_interval));

        if let Ok(mut slot) = self.source.lock() {
            *slot = Some(source);
        }
        if let Ok(mut slot) = self.task.lock() {
            if let Some(previous) = slot.replace(handle) {
                previous.abort();
            }
        }
        Ok(())
    }

    /// Sign in again after an authentication failure. Queued events go out
    /// on the next retry tick.
    pub async fn reauthenticate(&self) -> Result<(), IndexerError> {
        let statement = format!("Sign in to index domain {}", self.domain);
        match self.deps.authenticator.build_proof(&statement, None).await {
            Ok(_) => {
                info!("Reporting re-enabled for domain {}", self.domain);
                self.status.send_modify(|s| {
                    if s.state != IndexerState::Stopped && s.state != IndexerState::Disabled {
                        s.reporting_enabled = true;
                        s.reason = None;
                    }
                });
                Ok(())
            }
            Err(e) => {
                warn!("Re-authentication failed for domain {}: {}", self.domain, e);
                self.record_auth_failure();
                self.status.send_modify(|s| s.reason = Some(e.to_string()));
                Err(e.into())
            }
        }
    }

    /// Cancel listening. An in-flight publish may still land in the store
    /// but can no longer move the cursor.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);

        if let Ok(mut slot) = self.task.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
        if let Ok(mut slot) = self.source.lock() {
            if let Some(source) = slot.take() {
                source.stop();
            }
        }

        self.status.send_modify(|s| {
            s.state = IndexerState::Stopped;
            s.reporting_enabled = false;
        });
        info!("Indexer for domain {} stopped", self.domain);
    }

    fn record_auth_failure(&self) {
        if let Some(metrics) = &self.deps.metrics {
            metrics
                .auth_failures
                .add(1, &Metrics::domain_labels(&self.domain));
        }
    }
}

impl Drop for IndexerService {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.task.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}

/// Per-domain event loop. Exactly one runs per service, so events are
/// handled strictly one after another.
struct Pipeline {
    domain: String,
    cursor: Cursor,
    highest_published: u64,
    queue: RetryQueue,
    source: Arc<dyn LogSource>,
    deps: IndexerDeps,
    status: Arc<watch::Sender<IndexerStatus>>,
    stopped: Arc<AtomicBool>,
}

impl Pipeline {
    async fn run(mut self, mut stream: LogStream, retry_interval: Duration) {
        let mut retry_tick = tokio::time::interval(retry_interval);
        retry_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                next = stream.next() => match next {
                    Some(log) => self.handle(log).await,
                    None => {
                        warn!("Log stream for domain {} ended", self.domain);
                        self.status.send_modify(|s| s.reason = Some("log stream ended".to_string()));
                        break;
                    }
                },
                _ = retry_tick.tick() => self.drain().await,
            }
        }
    }

    fn reporting_enabled(&self) -> bool {
        self.status.borrow().reporting_enabled
    }

    async fn handle(&mut self, log: DecodedLog) {
        self.status.send_modify(|s| s.state = IndexerState::Reporting);

        let block_timestamp = match self.source.block_timestamp(log.block_number).await {
            Ok(ts) => ts,
            Err(e) => {
                warn!(
                    "No timestamp for block {} on domain {}: {}",
                    log.block_number, self.domain, e
                );
                None
            }
        };
        let record = log.normalize(block_timestamp);

        self.drain().await;
        self.report(record, 0).await;

        self.status.send_modify(|s| {
            if s.state == IndexerState::Reporting {
                s.state = IndexerState::Listening;
            }
        });
    }

    /// Retry queued events in block order.
    async fn drain(&mut self) {
        if self.queue.is_empty() || !self.reporting_enabled() {
            return;
        }

        let pending = self.queue.take_all();
        debug!(
            "Retrying {} queued events for domain {}",
            pending.len(),
            self.domain
        );
        for event in pending {
            self.report(event.record, event.attempts).await;
        }
        self.sync_queue_status();
        self.advance_cursor().await;
    }

    async fn report(&mut self, record: EventRecord, attempts: u32) {
        let labels = Metrics::domain_labels(&self.domain);

        if !self.reporting_enabled() {
            debug!("Reporting disabled, queueing {}", record.key());
            self.queue.push(record, attempts);
            self.sync_queue_status();
            return;
        }

        let proof = match self
            .deps
            .authenticator
            .build_event_proof(&self.domain, &record)
            .await
        {
            Ok(proof) => proof,
            Err(e) => {
                error!(
                    "Authentication failed for domain {}, reporting disabled: {}",
                    self.domain, e
                );
                if let Some(metrics) = &self.deps.metrics {
                    metrics.auth_failures.add(1, &labels);
                }
                self.status.send_modify(|s| {
                    s.reporting_enabled = false;
                    s.reason = Some(e.to_string());
                });
                self.queue.push(record, attempts);
                self.sync_queue_status();
                return;
            }
        };

        if let Err(e) = self.deps.adapter.publish(&self.domain, &record, &proof).await {
            warn!("{} (attempt {})", e, attempts + 1);
            if let Some(metrics) = &self.deps.metrics {
                metrics.publish_failures.add(1, &labels);
            }
            self.queue.push(record, attempts + 1);
            self.sync_queue_status();
            return;
        }

        if let Some(metrics) = &self.deps.metrics {
            metrics.events_published.add(1, &labels);
        }
        info!(
            "Published {} {} at block {} for domain {}",
            record.event_name,
            record.key(),
            record.block_number,
            self.domain
        );

        if let Some(reporter) = &self.deps.reporter {
            // Reporting is best effort and never holds back the cursor
            if let Err(e) = reporter.send(&self.domain, &record, &proof).await {
                warn!("Report for {} not delivered: {}", record.key(), e);
            }
        }

        self.highest_published = self.highest_published.max(record.block_number);
        self.advance_cursor().await;
    }

    async fn advance_cursor(&mut self) {
        let target = match self.queue.floor() {
            Some(floor) => self.highest_published.min(floor.saturating_sub(1)),
            None => self.highest_published,
        };

        if self.stopped.load(Ordering::SeqCst) {
            return;
        }

        match self.cursor.advance(target).await {
            Ok(true) => {
                if let Some(metrics) = &self.deps.metrics {
                    metrics
                        .cursor_block
                        .record(target, &Metrics::domain_labels(&self.domain));
                }
                self.status.send_modify(|s| s.cursor = target);
            }
            Ok(false) => {}
            Err(e) => error!("Failed to persist cursor for domain {}: {}", self.domain, e),
        }
    }

    fn sync_queue_status(&self) {
        let pending = self.queue.len();
        if let Some(metrics) = &self.deps.metrics {
            metrics
                .retry_queue_depth
                .record(pending as u64, &Metrics::domain_labels(&self.domain));
        }
        self.status.send_modify(|s| s.pending = pending);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::auth::tests::{authenticator, SwitchableWallet};
    use crate::auth::Wallet;
    use crate::indexer::rpc::logs::receiver_stream;
    use crate::models::errors::AuthError;
    use crate::storage::cursor::MemoryCursorStore;
    use crate::storage::mesh::{mesh, MeshPeer};
    use crate::storage::propagation::tests::CONTRACT;
    use alloy_dyn_abi::DynSolValue;
    use alloy_primitives::{Address, B256, U256};
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    /// Log source fed by the test through a channel.
    pub(crate) struct ScriptedSource {
        head: u64,
        tx: mpsc::Sender<DecodedLog>,
        rx: Mutex<Option<mpsc::Receiver<DecodedLog>>>,
        pub(crate) watched_from: Mutex<Option<u64>>,
        pub(crate) stopped: AtomicBool,
    }

    impl ScriptedSource {
        pub(crate) fn new(head: u64) -> Arc<Self> {
            let (tx, rx) = mpsc::channel(64);
            Arc::new(Self {
                head,
                tx,
                rx: Mutex::new(Some(rx)),
                watched_from: Mutex::new(None),
                stopped: AtomicBool::new(false),
            })
        }

        pub(crate) async fn emit(&self, log: DecodedLog) {
            self.tx.send(log).await.unwrap();
        }
    }

    #[async_trait]
    impl LogSource for ScriptedSource {
        async fn head(&self) -> Result<u64> {
            Ok(self.head)
        }

        async fn watch(&self, from_block: u64) -> Result<LogStream> {
            *self.watched_from.lock().unwrap() = Some(from_block);
            let rx = self.rx.lock().unwrap().take().expect("watched twice");
            Ok(receiver_stream(rx))
        }

        async fn block_timestamp(&self, block_number: u64) -> Result<Option<u64>> {
            Ok(Some(1_700_000_000 + block_number))
        }

        fn stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    pub(crate) struct ScriptedConnector {
        pub(crate) source: Arc<ScriptedSource>,
        pub(crate) connects: AtomicUsize,
    }

    #[async_trait]
    impl LogSourceConnector for ScriptedConnector {
        async fn connect(&self, _domain: &str, _config: &DomainConfig) -> Result<Arc<dyn LogSource>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(self.source.clone())
        }
    }

    pub(crate) fn domain_config() -> DomainConfig {
        DomainConfig {
            rpc_url: "http://localhost:8545".to_string(),
            contract_address: CONTRACT.to_string(),
            contract_abi: serde_json::json!([]),
            start_block: None,
        }
    }

    pub(crate) fn transfer(block: u64, log_index: u64) -> DecodedLog {
        DecodedLog {
            event_name: "Transfer".to_string(),
            args: vec![(
                "value".to_string(),
                DynSolValue::Uint(U256::from(block), 256),
            )],
            block_number: block,
            transaction_hash: B256::with_last_byte(block as u8),
            log_index,
            address: CONTRACT.parse::<Address>().unwrap(),
        }
    }

    struct Harness {
        service: IndexerService,
        source: Arc<ScriptedSource>,
        connector: Arc<ScriptedConnector>,
        peer: MeshPeer,
        adapter: PropagationAdapter,
        cursor_store: Arc<MemoryCursorStore>,
        deps: IndexerDeps,
        settings: IndexerSettings,
    }

    impl Harness {
        /// A second service over the same store and cursor, with a fresh source.
        fn restarted(&self) -> (IndexerService, Arc<ScriptedSource>) {
            let source = ScriptedSource::new(0);
            let deps = IndexerDeps {
                connector: Arc::new(ScriptedConnector {
                    source: source.clone(),
                    connects: AtomicUsize::new(0),
                }),
                ..self.deps.clone()
            };
            (IndexerService::new("acme", deps, self.settings.clone()), source)
        }
    }

    fn harness(wallet: Arc<dyn Wallet>, domains: BTreeMap<String, DomainConfig>) -> Harness {
        let source = ScriptedSource::new(0);
        let connector = Arc::new(ScriptedConnector {
            source: source.clone(),
            connects: AtomicUsize::new(0),
        });
        let peer = mesh(1).remove(0);
        let adapter = PropagationAdapter::new(Arc::new(peer.clone()));
        let cursor_store = Arc::new(MemoryCursorStore::new());

        let deps = IndexerDeps {
            authenticator: Arc::new(authenticator(wallet)),
            config_source: Arc::new(StaticConfigSource::new(domains)),
            connector: connector.clone(),
            adapter: adapter.clone(),
            cursor_store: cursor_store.clone(),
            reporter: None,
            metrics: None,
        };
        let settings = IndexerSettings {
            retry_queue_capacity: 16,
            max_publish_attempts: 100,
            retry_interval: Duration::from_millis(20),
        };

        Harness {
            service: IndexerService::new("acme", deps.clone(), settings.clone()),
            source,
            connector,
            peer,
            adapter,
            cursor_store,
            deps,
            settings,
        }
    }

    fn acme() -> BTreeMap<String, DomainConfig> {
        BTreeMap::from([("acme".to_string(), domain_config())])
    }

    async fn wait_status<F: Fn(&IndexerStatus) -> bool>(service: &IndexerService, check: F) -> IndexerStatus {
        let mut rx = service.subscribe_status();
        timeout(Duration::from_secs(5), rx.wait_for(|s| check(s)))
            .await
            .expect("status not reached")
            .expect("status channel closed")
            .clone()
    }

    #[tokio::test]
    async fn publish_failure_holds_cursor_until_retry_succeeds() {
        let h = harness(Arc::new(crate::auth::tests::test_signer()), acme());
        h.service.start().await.unwrap();

        h.source.emit(transfer(49, 0)).await;
        wait_status(&h.service, |s| s.cursor == 49).await;

        h.peer.set_online(false);
        h.source.emit(transfer(50, 0)).await;
        let status = wait_status(&h.service, |s| s.pending == 1).await;
        assert_eq!(status.cursor, 49);

        h.peer.set_online(true);
        let status = wait_status(&h.service, |s| s.cursor == 50).await;
        assert_eq!(status.pending, 0);

        let record = transfer(50, 0).normalize(Some(1_700_000_050));
        assert!(h.adapter.fetch("acme", &record).await.unwrap().is_some());
        assert_eq!(h.cursor_store.load("acme").await.unwrap(), Some(50));
    }

    #[tokio::test]
    async fn queued_event_is_retried_before_the_next_one() {
        let h = harness(Arc::new(crate::auth::tests::test_signer()), acme());
        h.service.start().await.unwrap();

        h.source.emit(transfer(49, 0)).await;
        wait_status(&h.service, |s| s.cursor == 49).await;

        h.peer.set_online(false);
        h.source.emit(transfer(50, 0)).await;
        wait_status(&h.service, |s| s.pending == 1).await;

        // Draining happens before block 51 is reported
        h.peer.set_online(true);
        h.source.emit(transfer(51, 0)).await;
        let status = wait_status(&h.service, |s| s.cursor == 51).await;
        assert_eq!(status.pending, 0);
    }

    #[tokio::test]
    async fn authentication_failure_disables_reporting_without_publishing() {
        let wallet = Arc::new(SwitchableWallet::new());
        let h = harness(wallet.clone(), acme());
        h.service.start().await.unwrap();
        assert!(h.service.status().reporting_enabled);

        wallet.set_refuse(true);
        h.source.emit(transfer(10, 0)).await;
        let status = wait_status(&h.service, |s| !s.reporting_enabled).await;
        assert!(status.reason.is_some());

        let status = wait_status(&h.service, |s| s.pending == 1).await;
        assert_eq!(status.cursor, 0);
        let record = transfer(10, 0).normalize(Some(1_700_000_010));
        assert!(h.adapter.fetch("acme", &record).await.unwrap().is_none());

        // Still disabled: the next event is queued, not published
        h.source.emit(transfer(11, 0)).await;
        wait_status(&h.service, |s| s.pending == 2).await;

        wallet.set_refuse(false);
        h.service.reauthenticate().await.unwrap();
        let status = wait_status(&h.service, |s| s.cursor == 11).await;
        assert!(status.reporting_enabled);
        assert!(h.adapter.fetch("acme", &record).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn failed_sign_in_returns_to_uninitialized() {
        let wallet = Arc::new(SwitchableWallet::new());
        wallet.set_refuse(true);
        let h = harness(wallet, acme());

        let result = h.service.start().await;
        assert!(matches!(
            result,
            Err(IndexerError::Auth(AuthError::AuthenticationFailed { .. }))
        ));

        let status = h.service.status();
        assert_eq!(status.state, IndexerState::Uninitialized);
        assert!(!status.reporting_enabled);
        assert!(status.reason.is_some());
        assert_eq!(h.connector.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_configuration_disables_the_service() {
        let h = harness(Arc::new(crate::auth::tests::test_signer()), BTreeMap::new());

        let result = h.service.start().await;
        assert!(matches!(
            result,
            Err(IndexerError::Config(ConfigError::ConfigurationMissing { .. }))
        ));
        assert_eq!(h.service.status().state, IndexerState::Disabled);
        assert_eq!(h.connector.connects.load(Ordering::SeqCst), 0);

        // Terminal: a second start is refused
        assert!(matches!(
            h.service.start().await,
            Err(IndexerError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn restart_replays_from_persisted_cursor_block() {
        let h = harness(Arc::new(crate::auth::tests::test_signer()), acme());
        h.cursor_store.save("acme", 41).await.unwrap();

        h.service.start().await.unwrap();
        assert_eq!(*h.source.watched_from.lock().unwrap(), Some(41));
        assert_eq!(h.service.status().cursor, 41);
        assert_eq!(h.service.status().state, IndexerState::Listening);
    }

    #[tokio::test]
    async fn unpublished_event_in_cursor_block_is_replayed_after_restart() {
        let h = harness(Arc::new(crate::auth::tests::test_signer()), acme());
        h.service.start().await.unwrap();

        h.source.emit(transfer(50, 0)).await;
        wait_status(&h.service, |s| s.cursor == 50).await;

        // Second event of the same block never makes it out
        h.peer.set_online(false);
        h.source.emit(transfer(50, 1)).await;
        wait_status(&h.service, |s| s.pending == 1).await;
        h.service.stop();
        assert_eq!(h.cursor_store.load("acme").await.unwrap(), Some(50));

        h.peer.set_online(true);
        let (service, source) = h.restarted();
        service.start().await.unwrap();
        assert_eq!(*source.watched_from.lock().unwrap(), Some(50));

        source.emit(transfer(50, 0)).await;
        source.emit(transfer(50, 1)).await;
        source.emit(transfer(51, 0)).await;
        let status = wait_status(&service, |s| s.cursor == 51).await;
        assert_eq!(status.pending, 0);

        let record = transfer(50, 1).normalize(Some(1_700_000_050));
        assert!(h.adapter.fetch("acme", &record).await.unwrap().is_some());
        service.stop();
    }

    #[tokio::test]
    async fn start_block_is_used_without_a_cursor() {
        let mut config = domain_config();
        config.start_block = Some(1_000);
        let h = harness(
            Arc::new(crate::auth::tests::test_signer()),
            BTreeMap::from([("acme".to_string(), config)]),
        );

        h.service.start().await.unwrap();
        assert_eq!(*h.source.watched_from.lock().unwrap(), Some(1_000));
    }

    #[tokio::test]
    async fn stop_releases_the_source_and_freezes_the_cursor() {
        let h = harness(Arc::new(crate::auth::tests::test_signer()), acme());
        h.service.start().await.unwrap();

        h.source.emit(transfer(5, 0)).await;
        wait_status(&h.service, |s| s.cursor == 5).await;

        h.service.stop();
        let status = h.service.status();
        assert_eq!(status.state, IndexerState::Stopped);
        assert!(!status.reporting_enabled);
        assert!(h.source.stopped.load(Ordering::SeqCst));

        // Nothing consumes the stream any more
        let _ = h.source.tx.try_send(transfer(6, 0));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.cursor_store.load("acme").await.unwrap(), Some(5));
    }
}
