//! Event routing from channels to storage and watchers.

use std::sync::Arc;

use async_trait::async_trait;
use daq_core::{
    AcquisitionChannel, ChannelValue, DaqError, DaqResult, EventSink, NodeEvent, ScanInfo, Signal,
};
use parking_lot::RwLock;
use tracing::trace;

use crate::data_watch::{DataWatch, EventQueue, NodeMap};

/// State a running scan shares with its event handlers.
#[derive(Default)]
pub(crate) struct ScanShared {
    pub(crate) info: RwLock<ScanInfo>,
    pub(crate) nodes: RwLock<NodeMap>,
}

impl ScanShared {
    pub(crate) fn info_snapshot(&self) -> ScanInfo {
        self.info.read().clone()
    }

    pub(crate) fn nodes_snapshot(&self) -> NodeMap {
        self.nodes.read().clone()
    }
}

/// Sink connected to every channel of a running scan.
///
/// Samples are stored in the channel's node first, then the channel is
/// marked dirty for the data watch and the watchdog.
pub(crate) struct ScanEventSink {
    shared: Arc<ScanShared>,
    data_watch: Option<Arc<DataWatch>>,
    watchdog: Option<Arc<EventQueue>>,
}

impl ScanEventSink {
    pub(crate) fn new(
        shared: Arc<ScanShared>,
        data_watch: Option<Arc<DataWatch>>,
        watchdog: Option<Arc<EventQueue>>,
    ) -> Self {
        Self {
            shared,
            data_watch,
            watchdog,
        }
    }
}

#[async_trait]
impl EventSink for ScanEventSink {
    async fn new_data(
        &self,
        channel: &AcquisitionChannel,
        data: Vec<ChannelValue>,
    ) -> DaqResult<()> {
        let fullname = channel.fullname();
        let node = self.shared.nodes.read().get(&fullname).cloned();
        let node = node.ok_or_else(|| {
            DaqError::Storage(format!("no storage node for channel '{}'", fullname))
        })?;
        trace!(channel = %fullname, samples = data.len(), "new data");
        node.store(NodeEvent {
            channel: fullname.clone(),
            data,
            reference: channel.is_reference(),
        })
        .await?;

        if let Some(watch) = &self.data_watch {
            watch.mark(&fullname, Signal::NewData);
        }
        if let Some(queue) = &self.watchdog {
            queue.push(&fullname, Signal::NewData);
        }
        Ok(())
    }

    async fn device_signal(&self, device: &str, signal: Signal) -> DaqResult<()> {
        if let Some(watch) = &self.data_watch {
            match signal {
                Signal::End => watch.sync(device, signal).await,
                _ => watch.mark(device, signal),
            }
        }
        if let Some(queue) = &self.watchdog {
            queue.push(device, signal);
        }
        Ok(())
    }
}
