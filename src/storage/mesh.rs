//! In-process gossip mesh implementing [`GraphStore`].
//!
//! Every peer keeps a full copy of the graph. A local write is applied and
//! then pushed to each linked peer; a peer relays a message it has not seen
//! before to all of its links except the sender. With more than two peers the
//! same write reaches a peer over several paths, and each arrival fires the
//! peer's listeners again. Conflicting writes to one path resolve by
//! last-write-wins on the write's state stamp, ties broken by comparing the
//! serialized values.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::models::errors::StoreError;
use crate::storage::{ChildEvent, ChildFeed, GraphPath, GraphStore, Record};

const SEEN_CAPACITY: usize = 16_384;

#[derive(Debug, Clone)]
struct Stamped {
    state: u64,
    record: Record,
}

#[derive(Debug, Clone)]
struct Gossip {
    id: u64,
    from: usize,
    path: GraphPath,
    stamped: Stamped,
}

struct Listener {
    path: GraphPath,
    tx: mpsc::UnboundedSender<ChildEvent>,
}

#[derive(Default)]
struct PeerGraph {
    nodes: BTreeMap<GraphPath, Stamped>,
    listeners: Vec<Listener>,
    seen: HashSet<u64>,
    seen_order: VecDeque<u64>,
}

impl PeerGraph {
    /// First sighting of a gossip id.
    fn mark_seen(&mut self, id: u64) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.seen_order.push_back(id);
        if self.seen_order.len() > SEEN_CAPACITY {
            if let Some(old) = self.seen_order.pop_front() {
                self.seen.remove(&old);
            }
        }
        true
    }

    /// Merge an update. Returns false for updates older than what is held.
    fn merge(&mut self, path: &GraphPath, incoming: &Stamped) -> bool {
        match self.nodes.get(path) {
            Some(current) if current.state > incoming.state => false,
            Some(current) if current.state == incoming.state => {
                let current_value = serde_json::to_string(&current.record).unwrap_or_default();
                let incoming_value = serde_json::to_string(&incoming.record).unwrap_or_default();
                if incoming_value > current_value {
                    self.nodes.insert(path.clone(), incoming.clone());
                }
                // Re-delivery of the held value still notifies
                incoming_value >= current_value
            }
            _ => {
                self.nodes.insert(path.clone(), incoming.clone());
                true
            }
        }
    }

    fn notify(&mut self, path: &GraphPath, record: &Record) {
        self.listeners.retain(|listener| {
            if !path.is_below(&listener.path) {
                return !listener.tx.is_closed();
            }
            let depth = listener.path.len();
            let event = ChildEvent {
                key: path.segments()[depth].clone(),
                leaf: (path.len() == depth + 1).then(|| record.clone()),
            };
            listener.tx.send(event).is_ok()
        });
    }

    fn snapshot_children(&self, path: &GraphPath) -> Vec<ChildEvent> {
        let depth = path.len();
        let mut seen_keys = HashSet::new();
        let mut events = Vec::new();

        for (node_path, stamped) in self.nodes.range(path.clone()..) {
            if !node_path.segments().starts_with(path.segments()) {
                break;
            }
            if node_path.len() <= depth {
                continue;
            }
            let key = node_path.segments()[depth].clone();
            if node_path.len() == depth + 1 {
                events.push(ChildEvent {
                    key: key.clone(),
                    leaf: Some(stamped.record.clone()),
                });
                seen_keys.insert(key);
            } else if seen_keys.insert(key.clone()) {
                events.push(ChildEvent { key, leaf: None });
            }
        }
        events
    }
}

struct PeerInner {
    id: usize,
    graph: Mutex<PeerGraph>,
    links: Mutex<Vec<(usize, mpsc::UnboundedSender<Gossip>)>>,
    online: AtomicBool,
    clock: AtomicU64,
}

impl PeerInner {
    fn graph(&self) -> MutexGuard<'_, PeerGraph> {
        self.graph.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Monotonic per-peer state stamp seeded from wall-clock milliseconds.
    fn next_state(&self) -> u64 {
        let now = Utc::now().timestamp_millis().max(0) as u64;
        let mut current = self.clock.load(Ordering::SeqCst);
        loop {
            let next = now.max(current + 1);
            match self
                .clock
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    fn apply(&self, gossip: &Gossip) -> bool {
        let mut graph = self.graph();
        let first_sighting = graph.mark_seen(gossip.id);
        if graph.merge(&gossip.path, &gossip.stamped) {
            graph.notify(&gossip.path, &gossip.stamped.record);
        }
        first_sighting
    }

    fn relay(&self, gossip: &Gossip) {
        let forwarded = Gossip {
            from: self.id,
            ..gossip.clone()
        };
        let links = self.links.lock().unwrap_or_else(|e| e.into_inner());
        for (peer_id, link) in links.iter() {
            if *peer_id == gossip.from {
                continue;
            }
            if link.send(forwarded.clone()).is_err() {
                trace!("Peer {} link to {} closed", self.id, peer_id);
            }
        }
    }
}

async fn gossip_loop(peer: Weak<PeerInner>, mut inbox: mpsc::UnboundedReceiver<Gossip>) {
    while let Some(gossip) = inbox.recv().await {
        let Some(peer) = peer.upgrade() else { break };
        if !peer.online.load(Ordering::SeqCst) {
            // Partitioned peers miss traffic; no anti-entropy round here
            continue;
        }
        if peer.apply(&gossip) {
            peer.relay(&gossip);
        }
    }
}

/// Handle to one peer of the mesh.
#[derive(Clone)]
pub struct MeshPeer {
    inner: Arc<PeerInner>,
}

impl MeshPeer {
    /// Take the peer off the network. Writes against it fail until it is
    /// brought back.
    pub fn set_online(&self, online: bool) {
        debug!("Peer {} online={}", self.inner.id, online);
        self.inner.online.store(online, Ordering::SeqCst);
    }
}

/// Build a fully connected mesh of `size` peers. Must run inside a Tokio
/// runtime.
pub fn mesh(size: usize) -> Vec<MeshPeer> {
    let size = size.max(1);
    let mut peers = Vec::with_capacity(size);
    let mut inboxes = Vec::with_capacity(size);

    for id in 0..size {
        let (tx, rx) = mpsc::unbounded_channel();
        peers.push(MeshPeer {
            inner: Arc::new(PeerInner {
                id,
                graph: Mutex::new(PeerGraph::default()),
                links: Mutex::new(Vec::new()),
                online: AtomicBool::new(true),
                clock: AtomicU64::new(0),
            }),
        });
        inboxes.push((tx, rx));
    }

    let senders: Vec<_> = inboxes.iter().map(|(tx, _)| tx.clone()).collect();
    for peer in &peers {
        let mut links = peer.inner.links.lock().unwrap_or_else(|e| e.into_inner());
        for (other, sender) in senders.iter().enumerate() {
            if other != peer.inner.id {
                links.push((other, sender.clone()));
            }
        }
    }

    for (peer, (_, rx)) in peers.iter().zip(inboxes) {
        tokio::spawn(gossip_loop(Arc::downgrade(&peer.inner), rx));
    }

    peers
}

#[async_trait]
impl GraphStore for MeshPeer {
    async fn put(&self, path: &GraphPath, record: Record) -> Result<(), StoreError> {
        if !self.inner.online.load(Ordering::SeqCst) {
            return Err(StoreError::Unreachable {
                reason: format!("peer {} is offline", self.inner.id),
            });
        }

        let gossip = Gossip {
            id: fastrand::u64(..),
            from: self.inner.id,
            path: path.clone(),
            stamped: Stamped {
                state: self.inner.next_state(),
                record,
            },
        };

        self.inner.apply(&gossip);
        self.inner.relay(&gossip);
        Ok(())
    }

    async fn get(&self, path: &GraphPath) -> Result<Option<Record>, StoreError> {
        Ok(self
            .inner
            .graph()
            .nodes
            .get(path)
            .map(|stamped| stamped.record.clone()))
    }

    fn map_on(&self, path: &GraphPath) -> Result<ChildFeed, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut graph = self.inner.graph();

        // Snapshot and registration under one lock so no update slips between
        for event in graph.snapshot_children(path) {
            let _ = tx.send(event);
        }
        graph.listeners.push(Listener {
            path: path.clone(),
            tx,
        });

        Ok(ChildFeed::new(rx))
    }
}
