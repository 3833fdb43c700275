//! Shared fixtures for engine integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use daq_core::{DataNode, ScanInfo, ScanState, Settings, Signal};
use daq_driver_mock::{linspace, ErrorConfig, MockAxis, MockCounter, StepMaster, TimerMaster};
use daq_experiment::{AcquisitionChain, DataEvents, DataWatchCallback, EngineContext, NodeMap};
use daq_storage::MemoryStore;
use parking_lot::Mutex;

pub fn context() -> Arc<EngineContext> {
    EngineContext::new(Settings::default())
}

pub fn context_with(edit: impl FnOnce(&mut Settings)) -> Arc<EngineContext> {
    let mut settings = Settings::default();
    edit(&mut settings);
    EngineContext::new(settings)
}

/// `ascan` over axis `sy` with one counter `diode`.
pub struct StepScan {
    pub chain: Arc<AcquisitionChain>,
    pub axis: Arc<MockAxis>,
    pub master: Arc<StepMaster>,
    pub diode: Arc<MockCounter>,
}

pub fn step_scan(points: usize, diode_errors: ErrorConfig) -> StepScan {
    let axis = Arc::new(MockAxis::new("sy"));
    let master = Arc::new(StepMaster::new(
        "ascan",
        axis.clone(),
        linspace(0.0, 1.0, points - 1),
    ));
    let diode = Arc::new(MockCounter::new("diode").with_errors(diode_errors));
    let chain = Arc::new(AcquisitionChain::new());
    chain.add(master.clone(), diode.clone()).unwrap();
    StepScan {
        chain,
        axis,
        master,
        diode,
    }
}

/// `timer` master with the given counters as slaves.
pub fn timer_chain(
    count_time: Duration,
    npoints: usize,
    counters: &[Arc<MockCounter>],
) -> (Arc<AcquisitionChain>, Arc<TimerMaster>) {
    let timer = Arc::new(TimerMaster::new("timer", count_time, npoints));
    let chain = Arc::new(AcquisitionChain::new());
    chain.add_master(timer.clone()).unwrap();
    for counter in counters {
        chain.add(timer.clone(), counter.clone()).unwrap();
    }
    (chain, timer)
}

/// Every node of scan `prefix` got exactly one `set_ttl` and one `close`.
pub fn assert_finalized_once(store: &MemoryStore, prefix: &str) {
    let nodes = store.nodes_under(prefix);
    assert!(!nodes.is_empty(), "no nodes under {}", prefix);
    for node in nodes {
        assert_eq!(node.ttl_calls(), 1, "set_ttl calls on {}", node.db_name());
        assert_eq!(node.close_calls(), 1, "close calls on {}", node.db_name());
    }
}

/// Data-watch callback recording what it sees.
#[derive(Default)]
pub struct Recorder {
    /// Per-invocation sleep, to widen race windows
    pub delay: Duration,
    /// Fail on this invocation number (1-based)
    pub fail_on: Option<usize>,
    /// Ask for periodic polling during START
    pub poll_starting: bool,
    pub calls: AtomicUsize,
    pub empty_calls: AtomicUsize,
    pub in_flight: AtomicBool,
    pub overlapped: AtomicBool,
    pub events: Mutex<Vec<(String, Signal)>>,
    pub new_calls: AtomicUsize,
    pub end_info: Mutex<Option<ScanInfo>>,
}

impl Recorder {
    pub fn saw(&self, device: &str, signal: Signal) -> bool {
        self.events
            .lock()
            .iter()
            .any(|(d, s)| d == device && *s == signal)
    }
}

#[async_trait]
impl DataWatchCallback for Recorder {
    async fn on_scan_new(&self, _info: &ScanInfo) -> anyhow::Result<()> {
        self.new_calls.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    async fn on_scan_data(
        &self,
        events: &DataEvents,
        _nodes: &NodeMap,
        _info: &ScanInfo,
    ) -> anyhow::Result<()> {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            self.overlapped.store(true, Ordering::Release);
        }
        let call = self.calls.fetch_add(1, Ordering::AcqRel) + 1;
        if events.is_empty() {
            self.empty_calls.fetch_add(1, Ordering::AcqRel);
        }
        {
            let mut seen = self.events.lock();
            for (device, signals) in events {
                seen.extend(signals.iter().map(|s| (device.clone(), *s)));
            }
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.store(false, Ordering::Release);
        if self.fail_on == Some(call) {
            anyhow::bail!("display closed");
        }
        Ok(())
    }

    async fn on_scan_end(&self, info: &ScanInfo) -> anyhow::Result<()> {
        *self.end_info.lock() = Some(info.clone());
        Ok(())
    }

    fn on_state(&self, state: ScanState) -> bool {
        self.poll_starting && state == ScanState::Starting
    }
}
