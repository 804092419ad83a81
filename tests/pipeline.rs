use alloy_dyn_abi::DynSolValue;
use alloy_primitives::{Address, B256, U256};
use alloy_signer_local::PrivateKeySigner;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

use evm_event_mesh::auth::{RandomNonceProvider, WalletAuthenticator};
use evm_event_mesh::indexer::rpc::logs::{receiver_stream, LogSource, LogStream};
use evm_event_mesh::indexer::{
    IndexerDeps, IndexerService, IndexerSettings, IndexerStatus, LogSourceConnector,
    StaticConfigSource,
};
use evm_event_mesh::models::common::{DomainConfig, SiweConfig};
use evm_event_mesh::models::event::{DecodedLog, EventRecord};
use evm_event_mesh::reader::ReaderService;
use evm_event_mesh::storage::cursor::{CursorStore, FileCursorStore};
use evm_event_mesh::storage::mesh::{mesh, MeshPeer};
use evm_event_mesh::storage::propagation::PropagationAdapter;

const CONTRACT: &str = "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48";
const PRIVATE_KEY: &str = "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

//////// Scripted chain ////////
struct ScriptedChain {
    tx: mpsc::Sender<DecodedLog>,
    rx: Mutex<Option<mpsc::Receiver<DecodedLog>>>,
    watched_from: Mutex<Option<u64>>,
}

impl ScriptedChain {
    fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::channel(64);
        Arc::new(Self {
            tx,
            rx: Mutex::new(Some(rx)),
            watched_from: Mutex::new(None),
        })
    }
}

#[async_trait]
impl LogSource for ScriptedChain {
    async fn head(&self) -> Result<u64> {
        Ok(0)
    }

    async fn watch(&self, from_block: u64) -> Result<LogStream> {
        *self.watched_from.lock().unwrap() = Some(from_block);
        let rx = self.rx.lock().unwrap().take().expect("watched twice");
        Ok(receiver_stream(rx))
    }

    async fn block_timestamp(&self, block_number: u64) -> Result<Option<u64>> {
        Ok(Some(1_700_000_000 + block_number * 12))
    }

    fn stop(&self) {}
}

struct Connector(Arc<ScriptedChain>);

#[async_trait]
impl LogSourceConnector for Connector {
    async fn connect(&self, _domain: &str, _config: &DomainConfig) -> Result<Arc<dyn LogSource>> {
        Ok(self.0.clone())
    }
}

fn transfer(block: u64, log_index: u64) -> DecodedLog {
    DecodedLog {
        event_name: "Transfer".to_string(),
        args: vec![
            ("from".to_string(), DynSolValue::Address(Address::with_last_byte(1))),
            ("to".to_string(), DynSolValue::Address(Address::with_last_byte(2))),
            ("value".to_string(), DynSolValue::Uint(U256::from(block * 10), 256)),
        ],
        block_number: block,
        transaction_hash: B256::with_last_byte(block as u8),
        log_index,
        address: CONTRACT.parse().unwrap(),
    }
}

fn indexer(
    publisher: MeshPeer,
    chain: Arc<ScriptedChain>,
    cursor_store: Arc<dyn CursorStore>,
) -> IndexerService {
    let signer: PrivateKeySigner = PRIVATE_KEY.parse().unwrap();
    let authenticator = WalletAuthenticator::new(
        Arc::new(signer),
        Arc::new(RandomNonceProvider::new(Duration::from_secs(300))),
        SiweConfig {
            domain: "indexer.example.org".to_string(),
            uri: "https://indexer.example.org".to_string(),
        },
        1,
    );

    let domains = BTreeMap::from([(
        "usdc".to_string(),
        DomainConfig {
            rpc_url: "http://localhost:8545".to_string(),
            contract_address: CONTRACT.to_string(),
            contract_abi: serde_json::json!([]),
            start_block: None,
        },
    )]);

    let deps = IndexerDeps {
        authenticator: Arc::new(authenticator),
        config_source: Arc::new(StaticConfigSource::new(domains)),
        connector: Arc::new(Connector(chain)),
        adapter: PropagationAdapter::new(Arc::new(publisher)),
        cursor_store,
        reporter: None,
        metrics: None,
    };

    IndexerService::new(
        "usdc",
        deps,
        IndexerSettings {
            retry_interval: Duration::from_millis(20),
            ..IndexerSettings::default()
        },
    )
}

fn collector() -> (Arc<Mutex<Vec<EventRecord>>>, impl Fn(EventRecord) + Send + Sync + 'static) {
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    (received, move |event| sink.lock().unwrap().push(event))
}

async fn wait_len(received: &Arc<Mutex<Vec<EventRecord>>>, len: usize) {
    timeout(Duration::from_secs(5), async {
        while received.lock().unwrap().len() < len {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("events not delivered");
}

async fn wait_cursor(service: &IndexerService, block: u64) -> IndexerStatus {
    let mut rx = service.subscribe_status();
    timeout(Duration::from_secs(5), rx.wait_for(|s| s.cursor >= block))
        .await
        .expect("cursor not reached")
        .expect("status closed")
        .clone()
}

fn temp_dir(name: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("event-mesh-it-{name}-{}", uuid::Uuid::new_v4().simple()))
}

async fn remove_temp_dir(dir: &std::path::Path) -> Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

#[tokio::test]
async fn readers_on_other_peers_each_receive_every_event_once() -> Result<()> {
    let peers = mesh(3);
    let chain = ScriptedChain::new();
    let dir = temp_dir("readers");
    let cursor_store = Arc::new(FileCursorStore::new(&dir));
    let service = indexer(peers[0].clone(), chain.clone(), cursor_store);

    let reader_a = ReaderService::new("usdc", PropagationAdapter::new(Arc::new(peers[1].clone())), None, None);
    let reader_b = ReaderService::new("usdc", PropagationAdapter::new(Arc::new(peers[2].clone())), None, None);
    let (a, callback_a) = collector();
    let (b, callback_b) = collector();
    reader_a.subscribe_to_events(CONTRACT, Some("Transfer"), callback_a)?;
    reader_b.subscribe_to_events(CONTRACT, None, callback_b)?;

    service.start().await?;
    for block in [100, 101, 102] {
        chain.tx.send(transfer(block, 0)).await?;
    }
    wait_cursor(&service, 102).await;

    wait_len(&a, 3).await;
    wait_len(&b, 3).await;
    // Gossip keeps relaying for a moment; nothing else may come through
    tokio::time::sleep(Duration::from_millis(100)).await;

    for received in [&a, &b] {
        let mut blocks: Vec<u64> = received.lock().unwrap().iter().map(|e| e.block_number).collect();
        blocks.sort();
        assert_eq!(blocks, vec![100, 101, 102]);
    }

    let first = a.lock().unwrap().iter().find(|e| e.block_number == 100).cloned().unwrap();
    assert_eq!(first.contract_address, CONTRACT.to_lowercase());
    assert_eq!(first.block_timestamp, 1_700_001_200);
    assert!(!first.timestamp_approximate);
    assert_eq!(first.event_data["value"], "1000");
    assert_eq!(
        first.event_data.keys().collect::<Vec<_>>(),
        vec!["from", "to", "value"]
    );

    service.stop();
    remove_temp_dir(&dir).await?;
    assert!(!dir.exists());
    Ok(())
}

#[tokio::test]
async fn stored_proof_recovers_the_reporting_wallet() -> Result<()> {
    let peers = mesh(2);
    let chain = ScriptedChain::new();
    let dir = temp_dir("proof");
    let service = indexer(peers[0].clone(), chain.clone(), Arc::new(FileCursorStore::new(&dir)));
    let reader_side = PropagationAdapter::new(Arc::new(peers[1].clone()));
    let reader = ReaderService::new("usdc", reader_side.clone(), None, None);
    let (received, callback) = collector();
    reader.subscribe_to_events(CONTRACT, Some("Transfer"), callback)?;

    service.start().await?;
    chain.tx.send(transfer(7, 3)).await?;
    wait_len(&received, 1).await;

    let record = received.lock().unwrap()[0].clone();
    let stored = reader_side.fetch("usdc", &record).await?.expect("record replicated");
    let signer: PrivateKeySigner = PRIVATE_KEY.parse().unwrap();
    assert_eq!(stored.proof.verify()?, signer.address());
    assert_eq!(stored.proof.message.resources, vec![record.resource()]);
    assert!(stored.proof.message.statement.contains("Transfer"));

    wait_cursor(&service, 7).await;
    service.stop();
    remove_temp_dir(&dir).await?;
    assert!(!dir.exists());
    Ok(())
}

#[tokio::test]
async fn restarted_indexer_replays_from_its_cursor_block() -> Result<()> {
    let dir = temp_dir("restart");
    let peers = mesh(1);

    let chain = ScriptedChain::new();
    let first = indexer(peers[0].clone(), chain.clone(), Arc::new(FileCursorStore::new(&dir)));
    first.start().await?;
    chain.tx.send(transfer(300, 0)).await?;
    chain.tx.send(transfer(301, 0)).await?;
    wait_cursor(&first, 301).await;
    first.stop();

    let chain = ScriptedChain::new();
    let second = indexer(peers[0].clone(), chain.clone(), Arc::new(FileCursorStore::new(&dir)));
    second.start().await?;
    assert_eq!(*chain.watched_from.lock().unwrap(), Some(301));
    assert_eq!(second.status().cursor, 301);

    second.stop();
    remove_temp_dir(&dir).await?;
    Ok(())
}
