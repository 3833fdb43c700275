//! Data-watch dispatch seen from a running scan.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use common::{assert_finalized_once, context, context_with, step_scan, timer_chain, Recorder};
use daq_core::{
    AcqContext, AcqOptions, AcquisitionChannel, AcquisitionObject, ChannelValue, ScanInfo,
    ScanOutcome, Signal, Step,
};
use daq_driver_mock::{ErrorConfig, MockCounter};
use daq_experiment::{AcquisitionChain, DataEvents, DataWatchCallback, NodeMap, Scan};
use daq_storage::MemoryStore;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_callback_never_overlaps_itself() {
    let ctx = context();
    let s = step_scan(40, ErrorConfig::none());
    let recorder = Arc::new(Recorder {
        delay: Duration::from_millis(3),
        ..Default::default()
    });
    let scan = Scan::builder(s.chain.clone(), ctx)
        .name("ascan")
        .data_watch(recorder.clone())
        .build();

    scan.run().await.unwrap();

    assert_eq!(scan.outcome(), Some(ScanOutcome::Done));
    assert!(!recorder.overlapped.load(Ordering::Acquire));
    assert!(recorder.saw("diode:diode", Signal::NewData));
    assert!(recorder.saw("diode", Signal::End));
    assert_eq!(s.diode.reads(), 40);
}

/// One-point master that checks, when stopped, that the end signals of
/// its branch were already handed to the callback.
struct EndCheckingMaster {
    channel: Arc<AcquisitionChannel>,
    recorder: Arc<Recorder>,
    ends_seen_at_stop: AtomicBool,
}

#[async_trait]
impl AcquisitionObject for EndCheckingMaster {
    fn name(&self) -> &str {
        "checker"
    }

    fn channels(&self) -> Vec<Arc<AcquisitionChannel>> {
        vec![self.channel.clone()]
    }

    fn options(&self) -> AcqOptions {
        AcqOptions::default()
    }

    async fn prepare(&self, _ctx: &AcqContext) -> Result<()> {
        Ok(())
    }

    async fn start(&self, ctx: &AcqContext) -> Result<()> {
        self.channel.emit_one(ChannelValue::Float(1.0)).await?;
        ctx.trigger_slaves().await
    }

    async fn stop(&self) -> Result<()> {
        let seen =
            self.recorder.saw("checker", Signal::End) && self.recorder.saw("diode", Signal::End);
        self.ends_seen_at_stop.store(seen, Ordering::Release);
        Ok(())
    }

    async fn next_step(&self) -> Result<Step> {
        Ok(Step::Done)
    }
}

#[tokio::test(start_paused = true)]
async fn test_end_signal_is_delivered_before_returning() {
    let ctx = context();
    let recorder = Arc::new(Recorder {
        delay: Duration::from_millis(200),
        ..Default::default()
    });
    let master = Arc::new(EndCheckingMaster {
        channel: Arc::new(AcquisitionChannel::scalar("checker", "value")),
        recorder: recorder.clone(),
        ends_seen_at_stop: AtomicBool::new(false),
    });
    let chain = Arc::new(AcquisitionChain::new());
    chain
        .add(master.clone(), Arc::new(MockCounter::new("diode")))
        .unwrap();
    let scan = Scan::builder(chain, ctx)
        .name("ct")
        .data_watch(recorder.clone())
        .build();

    scan.run().await.unwrap();

    assert!(master.ends_seen_at_stop.load(Ordering::Acquire));
    assert!(!recorder.overlapped.load(Ordering::Acquire));
}

#[tokio::test]
async fn test_failing_callback_does_not_fail_scan() {
    let ctx = context();
    let s = step_scan(10, ErrorConfig::none());
    let recorder = Arc::new(Recorder {
        fail_on: Some(1),
        ..Default::default()
    });
    let scan = Scan::builder(s.chain.clone(), ctx)
        .name("ascan")
        .data_watch(recorder.clone())
        .build();

    scan.run().await.unwrap();

    assert_eq!(scan.outcome(), Some(ScanOutcome::Done));
    assert_eq!(s.diode.reads(), 10);
    assert_eq!(recorder.calls.load(Ordering::Acquire), 1);
    assert!(scan
        .data_watch_failure()
        .is_some_and(|reason| reason.contains("display closed")));
    assert!(recorder.end_info.lock().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_polling_requested_for_start_phase() {
    let ctx = context_with(|settings| settings.scan.data_watch_period_ms = 10);
    let (chain, _timer) = timer_chain(Duration::from_millis(500), 1, &[]);
    let recorder = Arc::new(Recorder {
        poll_starting: true,
        ..Default::default()
    });
    let scan = Scan::builder(chain, ctx)
        .name("timescan")
        .data_watch(recorder.clone())
        .build();

    scan.run().await.unwrap();

    assert!(recorder.empty_calls.load(Ordering::Acquire) >= 5);
    assert!(!recorder.overlapped.load(Ordering::Acquire));
}

#[tokio::test]
async fn test_scan_new_and_end_called_once() {
    let ctx = context();
    let s = step_scan(3, ErrorConfig::none());
    let recorder = Arc::new(Recorder::default());
    let scan = Scan::builder(s.chain.clone(), ctx)
        .name("ascan")
        .data_watch(recorder.clone())
        .build();

    scan.run().await.unwrap();

    assert_eq!(recorder.new_calls.load(Ordering::Acquire), 1);
    assert_eq!(recorder.empty_calls.load(Ordering::Acquire), 0);
    let end = recorder.end_info.lock().clone().unwrap();
    assert_eq!(end.state(), Some("DONE"));
    assert_eq!(end.scan_nb(), Some(1));
    assert!(recorder.saw("ascan:sy", Signal::NewData));
    assert!(recorder.saw("diode", Signal::Start));
}

/// Display whose callbacks panic instead of returning an error.
struct PanickingDisplay {
    on_data: bool,
}

#[async_trait]
impl DataWatchCallback for PanickingDisplay {
    async fn on_scan_data(
        &self,
        _events: &DataEvents,
        _nodes: &NodeMap,
        _info: &ScanInfo,
    ) -> Result<()> {
        if self.on_data {
            panic!("gui gone");
        }
        Ok(())
    }

    async fn on_scan_end(&self, _info: &ScanInfo) -> Result<()> {
        panic!("gui gone");
    }
}

async fn run_with_panicking_display(on_data: bool) {
    let ctx = context();
    let diode = Arc::new(MockCounter::new("diode"));
    let (chain, _timer) = timer_chain(Duration::from_millis(1), 1, &[diode]);
    let store = Arc::new(MemoryStore::new());
    let scan = Scan::builder(chain, ctx.clone())
        .name("timescan")
        .store(store.clone())
        .data_watch(Arc::new(PanickingDisplay { on_data }))
        .build();

    scan.run().await.unwrap();

    assert_eq!(scan.outcome(), Some(ScanOutcome::Done));
    assert!(scan.status().finished);
    assert!(scan
        .data_watch_failure()
        .is_some_and(|reason| reason.contains("gui gone")));
    assert_finalized_once(&store, "1_timescan");
    assert_eq!(ctx.history().len(), 1);
}

#[tokio::test]
async fn test_panic_in_scan_end_still_finalizes() {
    run_with_panicking_display(false).await;
}

#[tokio::test]
async fn test_panic_in_scan_data_still_finalizes() {
    run_with_panicking_display(true).await;
}
