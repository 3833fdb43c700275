//! Scan watchdog.
//!
//! An optional per-scan observer fed with the same data events as the data
//! watch. It runs alongside the chain iterators during START and can end the
//! phase early: gracefully with [`WatchdogVerdict::StopScan`], or by failing,
//! which kills the scan.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use daq_core::{DaqError, DaqResult, ScanInfo};
use tracing::{debug, info};

use crate::data_watch::{DataEvents, EventQueue, NodeMap};
use crate::events::ScanShared;

/// What the scan should do after a watchdog check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogVerdict {
    /// Keep running
    Continue,
    /// End the START phase now, with a `DONE` outcome
    StopScan,
}

/// User-supplied scan watchdog.
#[async_trait]
pub trait WatchdogCallback: Send + Sync {
    /// Maximum time without data before `on_timeout` is called.
    fn timeout(&self) -> Duration {
        Duration::from_secs(1)
    }

    /// No data arrived during `timeout()`.
    async fn on_timeout(&self) -> anyhow::Result<WatchdogVerdict> {
        Ok(WatchdogVerdict::Continue)
    }

    /// Data arrived.
    async fn on_scan_data(
        &self,
        _events: &DataEvents,
        _nodes: &NodeMap,
        _info: &ScanInfo,
    ) -> anyhow::Result<WatchdogVerdict> {
        Ok(WatchdogVerdict::Continue)
    }
}

/// Watch the queue until the callback asks to stop or fails.
///
/// Never returns while the verdict is `Continue`; the START phase drops
/// this future once the chain is done.
pub(crate) async fn run_watchdog(
    callback: Arc<dyn WatchdogCallback>,
    queue: Arc<EventQueue>,
    shared: Arc<ScanShared>,
) -> DaqResult<()> {
    loop {
        let verdict = match tokio::time::timeout(callback.timeout(), queue.notified()).await {
            Err(_) => {
                debug!("watchdog timeout");
                callback.on_timeout().await
            }
            Ok(()) => {
                let events = queue.drain();
                if events.is_empty() {
                    continue;
                }
                let nodes = shared.nodes_snapshot();
                let info = shared.info_snapshot();
                callback.on_scan_data(&events, &nodes, &info).await
            }
        }
        .map_err(DaqError::Watchdog)?;

        if verdict == WatchdogVerdict::StopScan {
            info!("watchdog requested the scan to stop");
            return Ok(());
        }
    }
}
