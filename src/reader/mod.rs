//! Deduplicated delivery of propagated events to consumer callbacks.

pub mod dedup;

use alloy_primitives::Address;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::metrics::Metrics;
use crate::models::errors::{ConfigError, ReaderError};
use crate::models::event::EventRecord;
use crate::reader::dedup::SeenSet;
use crate::storage::propagation::{PropagationAdapter, SubscriptionHandle};

pub type SubscriptionId = Uuid;

type Callback = Arc<dyn Fn(EventRecord) + Send + Sync>;

struct ActiveSubscription {
    handle: SubscriptionHandle,
    /// Held for the duration of every callback; false once unsubscribed.
    gate: Arc<Mutex<bool>>,
    task: JoinHandle<()>,
}

/// Reader for one domain. Deduplication is per subscription: two
/// subscriptions that match the same event each deliver it once.
pub struct ReaderService {
    domain: String,
    adapter: PropagationAdapter,
    dedup_capacity: Option<usize>,
    metrics: Option<Metrics>,
    subscriptions: Mutex<HashMap<SubscriptionId, ActiveSubscription>>,
}

impl ReaderService {
    pub fn new(
        domain: &str,
        adapter: PropagationAdapter,
        dedup_capacity: Option<usize>,
        metrics: Option<Metrics>,
    ) -> Self {
        Self {
            domain: domain.to_lowercase(),
            adapter,
            dedup_capacity,
            metrics,
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Invoke `callback` once per distinct event under `contract`, optionally
    /// restricted to `event_name`. The callback must not unsubscribe its own
    /// subscription.
    pub fn subscribe_to_events<F>(
        &self,
        contract: &str,
        event_name: Option<&str>,
        callback: F,
    ) -> Result<SubscriptionId, ReaderError>
    where
        F: Fn(EventRecord) + Send + Sync + 'static,
    {
        let address: Address =
            contract
                .parse()
                .map_err(|_| ConfigError::InvalidContractAddress {
                    address: contract.to_string(),
                })?;
        let contract = format!("{address:#x}");

        let stream = self.adapter.subscribe(&self.domain, &contract, event_name)?;
        let handle = stream.handle();
        let gate = Arc::new(Mutex::new(true));
        let callback: Callback = Arc::new(callback);

        let task = tokio::spawn(deliver_all(
            stream,
            gate.clone(),
            callback,
            SeenSet::new(self.dedup_capacity),
            self.metrics.clone(),
            self.domain.clone(),
        ));

        let id = handle.id;
        info!(
            "Reader subscription {} on {}/{} (event {})",
            id,
            self.domain,
            contract,
            event_name.unwrap_or("*")
        );

        let mut subscriptions = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
        subscriptions.insert(id, ActiveSubscription { handle, gate, task });
        Ok(id)
    }

    /// Stop a subscription. Waits for a running callback to return; none
    /// starts afterwards. Returns false for unknown or already removed ids.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);

        let Some(subscription) = removed else {
            return false;
        };

        {
            let mut open = subscription.gate.lock().unwrap_or_else(|e| e.into_inner());
            *open = false;
        }
        subscription.task.abort();
        self.adapter.unsubscribe(&subscription.handle);
        debug!("Reader subscription {} removed", id);
        true
    }

    pub fn disconnect_all(&self) {
        let ids: Vec<SubscriptionId> = self
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect();

        for id in ids {
            self.unsubscribe(id);
        }
        info!("Reader for domain {} disconnected", self.domain);
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

impl Drop for ReaderService {
    fn drop(&mut self) {
        self.disconnect_all();
    }
}

async fn deliver_all(
    mut stream: crate::storage::propagation::EventStream,
    gate: Arc<Mutex<bool>>,
    callback: Callback,
    mut seen: SeenSet,
    metrics: Option<Metrics>,
    domain: String,
) {
    while let Some(record) = stream.next().await {
        if !deliver(&gate, &mut seen, record, &callback, metrics.as_ref(), &domain) {
            break;
        }
    }
}

/// Returns false once the subscription is closed.
fn deliver(
    gate: &Mutex<bool>,
    seen: &mut SeenSet,
    record: EventRecord,
    callback: &Callback,
    metrics: Option<&Metrics>,
    domain: &str,
) -> bool {
    let open = match gate.lock() {
        Ok(open) => open,
        Err(_) => {
            warn!("Reader callback panicked earlier, closing subscription");
            return false;
        }
    };
    if !*open {
        return false;
    }

    let labels = Metrics::domain_labels(domain);
    if seen.insert(&record) {
        if let Some(metrics) = metrics {
            metrics.reader_deliveries.add(1, &labels);
        }
        callback(record);
    } else {
        debug!("Duplicate delivery of {}", record.key());
        if let Some(metrics) = metrics {
            metrics.reader_duplicates.add(1, &labels);
        }
    }
    true
}
