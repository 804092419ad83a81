//! Maps event records onto deterministic graph paths and back.
//!
//! ```text
//! events/domain/{domain}/contract/{contract}/event/{eventName}/tx/{txHash}/log/{logIndex}
//! ```
//!
//! The store only notifies one level of children, so a subscription walks
//! the tree: one listener on the event-name level (when no name is given),
//! one per transaction level and one per log level. Records are forwarded as
//! they arrive, duplicates and reordering included.

use futures::Stream;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::AuthProof;
use crate::models::errors::{PublishError, StoreError};
use crate::models::event::EventRecord;
use crate::storage::{ChildFeed, GraphPath, GraphStore, Record};

/// Flat leaf representation. Nested values are carried as JSON strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredEvent {
    domain: String,
    block_number: u64,
    block_timestamp: u64,
    #[serde(default)]
    timestamp_approximate: bool,
    transaction_hash: String,
    log_index: u64,
    contract_address: String,
    event_name: String,
    event_data: String,
    siwe_message: String,
    siwe_signature: String,
    siwe_proof: String,
}

impl StoredEvent {
    fn new(domain: &str, record: &EventRecord, proof: &AuthProof) -> Result<Self, serde_json::Error> {
        Ok(Self {
            domain: domain.to_string(),
            block_number: record.block_number,
            block_timestamp: record.block_timestamp,
            timestamp_approximate: record.timestamp_approximate,
            transaction_hash: record.transaction_hash.to_lowercase(),
            log_index: record.log_index,
            contract_address: record.contract_address.to_lowercase(),
            event_name: record.event_name.clone(),
            event_data: serde_json::to_string(&record.event_data)?,
            siwe_message: proof.rendered(),
            siwe_signature: proof.signature.clone(),
            siwe_proof: serde_json::to_string(proof)?,
        })
    }

    fn into_record(self) -> Result<EventRecord, serde_json::Error> {
        let event_data: IndexMap<String, Value> = serde_json::from_str(&self.event_data)?;
        Ok(EventRecord {
            block_number: self.block_number,
            block_timestamp: self.block_timestamp,
            timestamp_approximate: self.timestamp_approximate,
            transaction_hash: self.transaction_hash,
            log_index: self.log_index,
            contract_address: self.contract_address,
            event_name: self.event_name,
            event_data,
        })
    }
}

/// Leaf record as stored, including the reporter's proof.
#[derive(Debug, Clone)]
pub struct PublishedEvent {
    pub domain: String,
    pub record: EventRecord,
    pub proof: AuthProof,
}

fn parse_leaf(path: &GraphPath, leaf: Record) -> Result<PublishedEvent, StoreError> {
    let malformed = |e: serde_json::Error| StoreError::MalformedRecord {
        path: path.to_string(),
        reason: e.to_string(),
    };

    let stored: StoredEvent = serde_json::from_value(Value::Object(leaf)).map_err(malformed)?;
    let proof: AuthProof = serde_json::from_str(&stored.siwe_proof).map_err(malformed)?;
    let domain = stored.domain.clone();
    let record = stored.into_record().map_err(malformed)?;

    Ok(PublishedEvent {
        domain,
        record,
        proof,
    })
}

/// Path of the contract node for `(domain, contract)`.
pub fn contract_path(domain: &str, contract: &str) -> Result<GraphPath, StoreError> {
    GraphPath::root("events")?
        .child("domain")?
        .child(domain)?
        .child("contract")?
        .child(&contract.to_lowercase())
}

/// Leaf path of one event.
pub fn event_path(domain: &str, record: &EventRecord) -> Result<GraphPath, StoreError> {
    contract_path(domain, &record.contract_address)?
        .child("event")?
        .child(&record.event_name)?
        .child("tx")?
        .child(&record.transaction_hash.to_lowercase())?
        .child("log")?
        .child(&record.log_index.to_string())
}

/// Cancellation handle for one subscription. Cloning shares the handle.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    pub id: Uuid,
    abort: AbortHandle,
}

impl SubscriptionHandle {
    pub fn is_active(&self) -> bool {
        !self.abort.is_finished()
    }
}

/// Records delivered by a subscription. Dropping the stream detaches every
/// listener it registered.
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<EventRecord>,
    handle: SubscriptionHandle,
}

impl EventStream {
    pub fn handle(&self) -> SubscriptionHandle {
        self.handle.clone()
    }
}

impl Stream for EventStream {
    type Item = EventRecord;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.handle.abort.abort();
    }
}

/// Stateless bridge between event records and a [`GraphStore`].
#[derive(Clone)]
pub struct PropagationAdapter {
    store: Arc<dyn GraphStore>,
}

impl PropagationAdapter {
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self { store }
    }

    /// Write `record` and its proof at the record's leaf path. Writing the
    /// same record twice leaves the store unchanged apart from the proof.
    pub async fn publish(
        &self,
        domain: &str,
        record: &EventRecord,
        proof: &AuthProof,
    ) -> Result<(), PublishError> {
        let failed = |source: StoreError| PublishError::PublishFailed {
            tx_hash: record.transaction_hash.clone(),
            log_index: record.log_index,
            source,
        };

        let path = event_path(domain, record).map_err(failed)?;
        let malformed = |reason: String| {
            failed(StoreError::MalformedRecord {
                path: path.to_string(),
                reason,
            })
        };

        let stored = StoredEvent::new(domain, record, proof).map_err(|e| malformed(e.to_string()))?;
        let Value::Object(leaf) =
            serde_json::to_value(stored).map_err(|e| malformed(e.to_string()))?
        else {
            return Err(malformed("record is not an object".to_string()));
        };

        self.store.put(&path, leaf).await.map_err(failed)?;
        debug!("Published {} at {}", record.key(), path);
        Ok(())
    }

    /// Read back one published event.
    pub async fn fetch(
        &self,
        domain: &str,
        record: &EventRecord,
    ) -> Result<Option<PublishedEvent>, StoreError> {
        let path = event_path(domain, record)?;
        match self.store.get(&path).await? {
            Some(leaf) => parse_leaf(&path, leaf).map(Some),
            None => Ok(None),
        }
    }

    /// Stream every record under `(domain, contract)`, optionally restricted
    /// to one event name. Records already in the store are delivered first.
    ///
    /// The top-level listener is attached before returning, so a store that
    /// refuses it fails the call. Deeper listeners attach as nodes appear.
    pub fn subscribe(
        &self,
        domain: &str,
        contract: &str,
        event_name: Option<&str>,
    ) -> Result<EventStream, StoreError> {
        let events = contract_path(domain, contract)?.child("event")?;
        let (tx, rx) = mpsc::unbounded_channel();
        let store = self.store.clone();

        let task = match event_name {
            Some(name) => {
                let txs = events.child(name)?.child("tx")?;
                let feed = store.map_on(&txs)?;
                tokio::spawn(walk_txs(store, txs, feed, tx))
            }
            None => {
                let feed = store.map_on(&events)?;
                tokio::spawn(walk_events(store, events, feed, tx))
            }
        };

        let handle = SubscriptionHandle {
            id: Uuid::new_v4(),
            abort: task.abort_handle(),
        };
        info!(
            "Subscription {} attached to {}/{} (event {})",
            handle.id,
            domain,
            contract.to_lowercase(),
            event_name.unwrap_or("*")
        );

        Ok(EventStream { rx, handle })
    }

    /// Detach every listener of `handle`. Safe to call more than once.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) {
        if handle.is_active() {
            debug!("Detaching subscription {}", handle.id);
        }
        handle.abort.abort();
    }
}

type RecordSender = mpsc::UnboundedSender<EventRecord>;

/// Listen on `path`, logging a refusal.
fn attach(store: &Arc<dyn GraphStore>, path: &GraphPath) -> Option<ChildFeed> {
    match store.map_on(path) {
        Ok(feed) => Some(feed),
        Err(e) => {
            warn!("Cannot listen on {}: {}", path, e);
            None
        }
    }
}

/// Event-name level: one transaction walker per event name.
async fn walk_events(
    store: Arc<dyn GraphStore>,
    events: GraphPath,
    mut feed: ChildFeed,
    tx: RecordSender,
) {
    let mut walkers = JoinSet::new();
    let mut known = HashSet::new();

    while let Some(child) = feed.recv().await {
        if tx.is_closed() {
            return;
        }
        while walkers.try_join_next().is_some() {}
        if !known.insert(child.key.clone()) {
            continue;
        }
        match events.child(&child.key).and_then(|name| name.child("tx")) {
            Ok(txs) => {
                if let Some(feed) = attach(&store, &txs) {
                    walkers.spawn(walk_txs(store.clone(), txs, feed, tx.clone()));
                }
            }
            Err(e) => warn!("Skipping event node under {}: {}", events, e),
        }
    }
}

/// Transaction level: one log walker per transaction hash.
async fn walk_txs(store: Arc<dyn GraphStore>, txs: GraphPath, mut feed: ChildFeed, tx: RecordSender) {
    let mut walkers = JoinSet::new();
    let mut known = HashSet::new();

    while let Some(child) = feed.recv().await {
        if tx.is_closed() {
            return;
        }
        while walkers.try_join_next().is_some() {}
        if !known.insert(child.key.clone()) {
            continue;
        }
        match txs.child(&child.key).and_then(|hash| hash.child("log")) {
            Ok(logs) => {
                if let Some(feed) = attach(&store, &logs) {
                    walkers.spawn(walk_logs(logs, feed, tx.clone()));
                }
            }
            Err(e) => warn!("Skipping transaction node under {}: {}", txs, e),
        }
    }
}

/// Log level: every leaf notification becomes one delivered record.
async fn walk_logs(logs: GraphPath, mut feed: ChildFeed, tx: RecordSender) {
    while let Some(child) = feed.recv().await {
        let Some(leaf) = child.leaf else { continue };
        let path = match logs.child(&child.key) {
            Ok(path) => path,
            Err(e) => {
                warn!("Skipping log node under {}: {}", logs, e);
                continue;
            }
        };
        match parse_leaf(&path, leaf) {
            Ok(event) => {
                if tx.send(event.record).is_err() {
                    return;
                }
            }
            Err(e) => warn!("Ignoring unreadable record: {}", e),
        }
    }
}
