//! In-memory storage backend.
//!
//! Nodes live in a flat registry keyed by `db_name` (`parent:name`). Each
//! node records how often its lifecycle calls were made so that tests and
//! tooling can check the engine's finalization guarantees.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use daq_core::{
    ChannelValue, DaqError, DaqResult, DataNode, DataStore, NodeEvent, NodeKind, ScanInfo,
};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

/// Default time-to-live applied by `set_ttl`.
const DEFAULT_TTL: Duration = Duration::from_secs(24 * 3600);

/// Storage node kept in process memory.
#[derive(Debug)]
pub struct MemoryNode {
    db_name: String,
    kind: NodeKind,
    ttl: Duration,
    data: Mutex<Vec<ChannelValue>>,
    events: AtomicUsize,
    info: Mutex<ScanInfo>,
    expires_at: Mutex<Option<Instant>>,
    ended: AtomicBool,
    closed: AtomicBool,
    ttl_calls: AtomicUsize,
    close_calls: AtomicUsize,
}

impl MemoryNode {
    fn new(db_name: String, kind: NodeKind, ttl: Duration) -> Self {
        Self {
            db_name,
            kind,
            ttl,
            data: Mutex::new(Vec::new()),
            events: AtomicUsize::new(0),
            info: Mutex::new(ScanInfo::new()),
            expires_at: Mutex::new(None),
            ended: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            ttl_calls: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
        }
    }

    /// Copy of the stored samples.
    pub fn data(&self) -> Vec<ChannelValue> {
        self.data.lock().clone()
    }

    /// Number of `store` calls accepted.
    pub fn event_count(&self) -> usize {
        self.events.load(Ordering::Acquire)
    }

    /// How many times `set_ttl` was called.
    pub fn ttl_calls(&self) -> usize {
        self.ttl_calls.load(Ordering::Acquire)
    }

    /// How many times `close` was called.
    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::Acquire)
    }

    /// Whether `end` was called.
    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    /// Whether the node expired at `now`.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.lock().is_some_and(|at| at <= now)
    }
}

#[async_trait]
impl DataNode for MemoryNode {
    fn db_name(&self) -> &str {
        &self.db_name
    }

    fn kind(&self) -> NodeKind {
        self.kind
    }

    async fn store(&self, event: NodeEvent) -> DaqResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DaqError::Storage(format!(
                "node '{}' is closed",
                self.db_name
            )));
        }
        trace!(node = %self.db_name, samples = event.data.len(), "store");
        self.data.lock().extend(event.data);
        self.events.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    async fn fetch(&self) -> DaqResult<Vec<ChannelValue>> {
        Ok(self.data())
    }

    async fn set_info(&self, info: &ScanInfo) -> DaqResult<()> {
        *self.info.lock() = info.clone();
        Ok(())
    }

    async fn info(&self) -> DaqResult<ScanInfo> {
        Ok(self.info.lock().clone())
    }

    async fn end(&self) -> DaqResult<()> {
        self.ended.store(true, Ordering::Release);
        Ok(())
    }

    async fn set_ttl(&self) -> DaqResult<()> {
        self.ttl_calls.fetch_add(1, Ordering::AcqRel);
        *self.expires_at.lock() = Some(Instant::now() + self.ttl);
        Ok(())
    }

    async fn close(&self) -> DaqResult<()> {
        self.close_calls.fetch_add(1, Ordering::AcqRel);
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// Registry of [`MemoryNode`]s.
#[derive(Debug)]
pub struct MemoryStore {
    ttl: Duration,
    nodes: RwLock<HashMap<String, Arc<MemoryNode>>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Store with the default one-day time-to-live.
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_TTL)
    }

    /// Store with a custom time-to-live.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            nodes: RwLock::new(HashMap::new()),
        }
    }

    /// Concrete node lookup, for inspection.
    pub fn node(&self, db_name: &str) -> Option<Arc<MemoryNode>> {
        self.nodes.read().get(db_name).cloned()
    }

    /// Every node whose name starts with `prefix`.
    pub fn nodes_under(&self, prefix: &str) -> Vec<Arc<MemoryNode>> {
        let mut nodes: Vec<_> = self
            .nodes
            .read()
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .map(|(_, node)| node.clone())
            .collect();
        nodes.sort_by(|a, b| a.db_name.cmp(&b.db_name));
        nodes
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    /// True when no node exists.
    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    /// Drop every expired node and return how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut nodes = self.nodes.write();
        let before = nodes.len();
        nodes.retain(|_, node| !node.is_expired(now));
        let removed = before - nodes.len();
        if removed > 0 {
            debug!(removed, "purged expired nodes");
        }
        removed
    }
}

#[async_trait]
impl DataStore for MemoryStore {
    async fn create_node(
        &self,
        name: &str,
        kind: NodeKind,
        parent: Option<&str>,
    ) -> DaqResult<Arc<dyn DataNode>> {
        let db_name = match parent {
            Some(parent) => format!("{}:{}", parent, name),
            None => name.to_string(),
        };
        let mut nodes = self.nodes.write();
        if nodes.contains_key(&db_name) {
            return Err(DaqError::Storage(format!(
                "node '{}' already exists",
                db_name
            )));
        }
        let node = Arc::new(MemoryNode::new(db_name.clone(), kind, self.ttl));
        nodes.insert(db_name, node.clone());
        Ok(node)
    }

    async fn get_node(&self, db_name: &str) -> DaqResult<Option<Arc<dyn DataNode>>> {
        Ok(self
            .node(db_name)
            .map(|node| node as Arc<dyn DataNode>))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_and_store() {
        let store = MemoryStore::new();
        let scan = store
            .create_node("1_ascan", NodeKind::Scan, None)
            .await
            .unwrap();
        let channel = store
            .create_node("diode:counts", NodeKind::Channel, Some(scan.db_name()))
            .await
            .unwrap();
        assert_eq!(channel.db_name(), "1_ascan:diode:counts");

        channel
            .store(NodeEvent {
                channel: "diode:counts".into(),
                data: vec![ChannelValue::Float(1.0), ChannelValue::Float(2.0)],
                reference: false,
            })
            .await
            .unwrap();
        assert_eq!(channel.fetch().await.unwrap().len(), 2);
        assert_eq!(store.nodes_under("1_ascan").len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_node_rejected() {
        let store = MemoryStore::new();
        store.create_node("a", NodeKind::Scan, None).await.unwrap();
        let err = store
            .create_node("a", NodeKind::Scan, None)
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::Storage(_)));
    }

    #[tokio::test]
    async fn test_closed_node_rejects_store_and_ttl_expires() {
        let store = MemoryStore::with_ttl(Duration::ZERO);
        store.create_node("a", NodeKind::Scan, None).await.unwrap();
        let node = store.node("a").unwrap();

        node.set_ttl().await.unwrap();
        node.close().await.unwrap();
        assert_eq!(node.ttl_calls(), 1);
        assert_eq!(node.close_calls(), 1);

        let err = node
            .store(NodeEvent {
                channel: "x:y".into(),
                data: vec![ChannelValue::Int(1)],
                reference: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::Storage(_)));

        assert_eq!(store.purge_expired(), 1);
        assert!(store.is_empty());
    }
}
