pub mod cursor;
pub mod mesh;
pub mod propagation;

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use tokio::sync::mpsc;

use crate::models::errors::StoreError;

/// Flat record stored at a leaf node.
pub type Record = serde_json::Map<String, Value>;

/// Slash-free path segments from the graph root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GraphPath(Vec<String>);

impl GraphPath {
    pub fn root(segment: &str) -> Result<Self, StoreError> {
        Self(Vec::new()).child(segment)
    }

    pub fn child(&self, segment: &str) -> Result<Self, StoreError> {
        if segment.is_empty() || segment.contains('/') {
            return Err(StoreError::InvalidSegment {
                segment: segment.to_string(),
            });
        }
        let mut segments = self.0.clone();
        segments.push(segment.to_string());
        Ok(Self(segments))
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when `self` lies strictly below `ancestor`.
    pub fn is_below(&self, ancestor: &GraphPath) -> bool {
        self.0.len() > ancestor.0.len() && self.0.starts_with(&ancestor.0)
    }
}

impl fmt::Display for GraphPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

/// One notification from a child listener.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildEvent {
    pub key: String,
    /// Present when the child is itself a leaf record.
    pub leaf: Option<Record>,
}

/// Live feed of child notifications for one node. Dropping it detaches the
/// listener.
pub struct ChildFeed {
    rx: mpsc::UnboundedReceiver<ChildEvent>,
}

impl ChildFeed {
    pub fn new(rx: mpsc::UnboundedReceiver<ChildEvent>) -> Self {
        Self { rx }
    }

    pub async fn recv(&mut self) -> Option<ChildEvent> {
        self.rx.recv().await
    }
}

/// A peer's view of the replicated graph.
///
/// Delivery is at-least-once: listeners may see the same child update once
/// per replication path and in any order.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Write a leaf record. Returns once the local peer has accepted it.
    async fn put(&self, path: &GraphPath, record: Record) -> Result<(), StoreError>;

    async fn get(&self, path: &GraphPath) -> Result<Option<Record>, StoreError>;

    /// Listen to the direct children of `path`: every known child first,
    /// then one notification per update applied anywhere beneath it.
    /// There is no deeper subscription primitive.
    fn map_on(&self, path: &GraphPath) -> Result<ChildFeed, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_slashes_and_empty_segments() {
        let root = GraphPath::root("events").unwrap();
        assert!(root.child("a/b").is_err());
        assert!(root.child("").is_err());
    }

    #[test]
    fn below_is_strict() {
        let root = GraphPath::root("events").unwrap();
        let child = root.child("domain").unwrap();
        assert!(child.is_below(&root));
        assert!(!root.is_below(&root));
        assert_eq!(child.to_string(), "events/domain");
    }
}
