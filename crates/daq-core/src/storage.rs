//! Storage and writer interfaces consumed by the scan engine.
//!
//! The engine creates one [`DataNode`] for the scan record, one per
//! acquisition object and one per channel during the PREPARE phase, streams
//! channel data into them while running, and on finalization sets their
//! time-to-live and closes each of them exactly once.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::channel::ChannelValue;
use crate::error::DaqResult;
use crate::scan_info::ScanInfo;

/// What a storage node represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Top-level record of an ordinary scan
    Scan,
    /// Top-level record of a sequence or group
    ScanGroup,
    /// Node of an acquisition object
    Container,
    /// Node of a channel
    Channel,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Scan => write!(f, "scan"),
            NodeKind::ScanGroup => write!(f, "scan_group"),
            NodeKind::Container => write!(f, "container"),
            NodeKind::Channel => write!(f, "channel"),
        }
    }
}

/// One batch of samples appended to a channel node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeEvent {
    /// Full name of the emitting channel
    pub channel: String,
    /// Samples, in emission order
    pub data: Vec<ChannelValue>,
    /// True when `data` holds node references
    pub reference: bool,
}

/// Backing storage node.
#[async_trait]
pub trait DataNode: Send + Sync {
    /// Unique node name in the store (parent path + name).
    fn db_name(&self) -> &str;

    /// Node kind.
    fn kind(&self) -> NodeKind;

    /// Append an event.
    async fn store(&self, event: NodeEvent) -> DaqResult<()>;

    /// Every sample stored so far.
    async fn fetch(&self) -> DaqResult<Vec<ChannelValue>>;

    /// Publish (or republish) metadata for this node.
    async fn set_info(&self, info: &ScanInfo) -> DaqResult<()>;

    /// Metadata last published with [`set_info`](Self::set_info).
    async fn info(&self) -> DaqResult<ScanInfo>;

    /// Mark the record ended.
    async fn end(&self) -> DaqResult<()>;

    /// Apply the store's time-to-live to this node.
    async fn set_ttl(&self) -> DaqResult<()>;

    /// Release the node.
    async fn close(&self) -> DaqResult<()>;
}

impl fmt::Debug for dyn DataNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataNode")
            .field("db_name", &self.db_name())
            .field("kind", &self.kind())
            .finish()
    }
}

/// Factory and registry of storage nodes.
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Create a node under `parent` (or at the root).
    async fn create_node(
        &self,
        name: &str,
        kind: NodeKind,
        parent: Option<&str>,
    ) -> DaqResult<Arc<dyn DataNode>>;

    /// Look up a node by its `db_name`.
    async fn get_node(&self, db_name: &str) -> DaqResult<Option<Arc<dyn DataNode>>>;
}

/// File writer collaborator. Only its lifecycle is driven by the engine.
#[async_trait]
pub trait ScanWriter: Send + Sync {
    /// Target filename, used as the scan counter key.
    fn filename(&self) -> Option<String>;

    /// Scan numbers already present in the target file.
    async fn scan_entries(&self) -> DaqResult<Vec<u64>> {
        Ok(Vec::new())
    }

    /// Called during PREPARE with the initial `scan_info`.
    async fn prepare(&self, _info: &ScanInfo) -> DaqResult<()> {
        Ok(())
    }

    /// Called during finalization with the terminal `scan_info`.
    async fn finalize(&self, _info: &ScanInfo) -> DaqResult<()> {
        Ok(())
    }

    /// Close the writer. Called exactly once per scan.
    async fn close(&self) -> DaqResult<()>;
}
