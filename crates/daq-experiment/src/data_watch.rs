//! Data-watch dispatch.
//!
//! Channel emissions mark `(object, signal)` pairs in a dirty set and wake a
//! background task. When woken the task swaps the set out and hands it to the
//! user callback, so a burst of emissions coalesces into a single call while
//! new emissions accumulate into a fresh set.
//!
//! The callback is never invoked concurrently with itself: both the task and
//! the synchronous path ([`DataWatch::sync`]) hold the same async gate for the
//! whole invocation. A failing or panicking callback stops further
//! notifications for the scan but never the hardware.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use daq_core::{DataNode, ScanInfo, ScanState, Signal};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::events::ScanShared;
use crate::scan::panic_message;

/// Drained dirty set: object or channel name to the signals seen.
pub type DataEvents = BTreeMap<String, BTreeSet<Signal>>;

/// Storage nodes of a running scan, keyed by channel full name or object name.
pub type NodeMap = HashMap<String, Arc<dyn DataNode>>;

/// Consumer of incremental scan progress (live display, file writer).
#[async_trait]
pub trait DataWatchCallback: Send + Sync {
    /// A scan was prepared and is about to run.
    async fn on_scan_new(&self, _info: &ScanInfo) -> anyhow::Result<()> {
        Ok(())
    }

    /// New data or device signals since the previous call.
    async fn on_scan_data(
        &self,
        events: &DataEvents,
        nodes: &NodeMap,
        info: &ScanInfo,
    ) -> anyhow::Result<()>;

    /// The scan finalized; `info` is terminal.
    async fn on_scan_end(&self, _info: &ScanInfo) -> anyhow::Result<()> {
        Ok(())
    }

    /// Queried once per phase transition. Returning `true` makes the
    /// dispatcher also call `on_scan_data` periodically during that phase.
    fn on_state(&self, _state: ScanState) -> bool {
        false
    }
}

/// Dirty set plus wake-up, shared by emitters and one consumer.
///
/// Wake-ups are coalesced: marking many times before the consumer runs
/// wakes it once.
#[derive(Default)]
pub struct EventQueue {
    pending: Mutex<DataEvents>,
    notify: Notify,
}

impl EventQueue {
    /// Empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `signal` for `name` and wake the consumer.
    pub fn push(&self, name: &str, signal: Signal) {
        self.pending
            .lock()
            .entry(name.to_string())
            .or_default()
            .insert(signal);
        self.notify.notify_one();
    }

    /// Wake the consumer without adding events.
    pub fn kick(&self) {
        self.notify.notify_one();
    }

    /// Take everything accumulated so far.
    pub fn drain(&self) -> DataEvents {
        std::mem::take(&mut *self.pending.lock())
    }

    /// Wait for the next wake-up.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

/// Background dispatcher for one scan's data-watch callback.
pub(crate) struct DataWatch {
    callback: Arc<dyn DataWatchCallback>,
    shared: Arc<ScanShared>,
    queue: EventQueue,
    gate: tokio::sync::Mutex<()>,
    period: Duration,
    poll_requested: AtomicBool,
    failure: Mutex<Option<String>>,
    closed: AtomicBool,
    invocations: AtomicUsize,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl DataWatch {
    /// Create the dispatcher and spawn its task.
    pub(crate) fn spawn(
        callback: Arc<dyn DataWatchCallback>,
        shared: Arc<ScanShared>,
        period: Duration,
    ) -> Arc<Self> {
        let watch = Arc::new(Self {
            callback,
            shared,
            queue: EventQueue::new(),
            gate: tokio::sync::Mutex::new(()),
            period,
            poll_requested: AtomicBool::new(false),
            failure: Mutex::new(None),
            closed: AtomicBool::new(false),
            invocations: AtomicUsize::new(0),
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
            poller: Mutex::new(None),
        });
        let handle = tokio::spawn(watch.clone().dispatch());
        *watch.task.lock() = Some(handle);
        watch
    }

    fn is_active(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && self.failure.lock().is_none()
    }

    /// Mark an event and let the background task deliver it.
    pub(crate) fn mark(&self, name: &str, signal: Signal) {
        if self.is_active() {
            self.queue.push(name, signal);
        }
    }

    /// Mark an event and deliver everything pending before returning.
    ///
    /// Waits for an in-flight background invocation first.
    pub(crate) async fn sync(&self, name: &str, signal: Signal) {
        if !self.is_active() {
            return;
        }
        let _gate = self.gate.lock().await;
        self.queue.push(name, signal);
        let events = self.queue.drain();
        if events.is_empty() {
            return;
        }
        if let Err(e) = self.invoke(&events).await {
            self.fail(e);
        }
    }

    async fn invoke(&self, events: &DataEvents) -> anyhow::Result<()> {
        let info = self.shared.info_snapshot();
        let nodes = self.shared.nodes_snapshot();
        self.invocations.fetch_add(1, Ordering::AcqRel);
        trace!(objects = events.len(), "data watch callback");
        shielded(self.callback.on_scan_data(events, &nodes, &info)).await
    }

    fn fail(&self, error: anyhow::Error) {
        warn!(error = %error, "data watch callback failed, progress notifications stopped");
        self.failure.lock().get_or_insert_with(|| error.to_string());
        self.shutdown.cancel();
    }

    async fn dispatch(self: Arc<Self>) {
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = self.queue.notified() => {}
            }
            let _gate = self.gate.lock().await;
            let events = self.queue.drain();
            let polled = self.poll_requested.swap(false, Ordering::AcqRel);
            if events.is_empty() && !polled {
                continue;
            }
            if let Err(e) = self.invoke(&events).await {
                self.fail(e);
                break;
            }
        }
        debug!("data watch task exited");
    }

    /// Tell the callback about a phase transition and adjust polling.
    pub(crate) fn set_state(self: &Arc<Self>, state: ScanState) {
        if !self.is_active() {
            return;
        }
        let wants_polling = self.callback.on_state(state);
        let mut poller = self.poller.lock();
        match (wants_polling, poller.is_some()) {
            (true, false) => {
                let watch = self.clone();
                *poller = Some(tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(watch.period);
                    loop {
                        tokio::select! {
                            _ = watch.shutdown.cancelled() => break,
                            _ = ticker.tick() => {
                                watch.poll_requested.store(true, Ordering::Release);
                                watch.queue.kick();
                            }
                        }
                    }
                }));
            }
            (false, true) => {
                if let Some(handle) = poller.take() {
                    handle.abort();
                }
            }
            _ => {}
        }
    }

    /// Stop the task, waiting at most `timeout` for an in-flight callback,
    /// then deliver whatever is still pending. No callback runs afterwards.
    pub(crate) async fn close(&self, timeout: Duration) {
        if let Some(handle) = self.poller.lock().take() {
            handle.abort();
        }
        self.shutdown.cancel();

        let task = self.task.lock().take();
        if let Some(mut handle) = task {
            match tokio::time::timeout(timeout, &mut handle).await {
                Err(_) => {
                    warn!(timeout_ms = timeout.as_millis() as u64, "data watch callback still running, aborting it");
                    handle.abort();
                }
                Ok(Err(e)) if e.is_panic() => {
                    self.fail(anyhow::anyhow!("data watch task {}", e));
                }
                Ok(_) => {}
            }
        }

        if self.failure.lock().is_none() {
            let flush = async {
                let _gate = self.gate.lock().await;
                let events = self.queue.drain();
                if !events.is_empty() {
                    if let Err(e) = self.invoke(&events).await {
                        self.fail(e);
                    }
                }
            };
            if tokio::time::timeout(timeout, flush).await.is_err() {
                warn!("final data watch flush timed out");
            }
        }
        self.closed.store(true, Ordering::Release);
    }

    /// Forward `on_scan_new`, serialized with data notifications.
    pub(crate) async fn scan_new(&self, info: &ScanInfo) {
        if !self.is_active() {
            return;
        }
        let _gate = self.gate.lock().await;
        if let Err(e) = shielded(self.callback.on_scan_new(info)).await {
            self.fail(e);
        }
    }

    /// Forward `on_scan_end`. Called once, after [`close`](Self::close).
    pub(crate) async fn scan_end(&self, info: &ScanInfo) {
        if self.failure.lock().is_some() {
            return;
        }
        if let Err(e) = shielded(self.callback.on_scan_end(info)).await {
            warn!(error = %e, "data watch end-of-scan callback failed");
            self.failure.lock().get_or_insert_with(|| e.to_string());
        }
    }

    /// Error that stopped the dispatcher, if any.
    pub(crate) fn failure(&self) -> Option<String> {
        self.failure.lock().clone()
    }

    /// Number of callback invocations so far.
    #[cfg(test)]
    pub(crate) fn invocations(&self) -> usize {
        self.invocations.load(Ordering::Acquire)
    }
}

/// Await a callback, turning a panic into an error.
async fn shielded(call: impl Future<Output = anyhow::Result<()>>) -> anyhow::Result<()> {
    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(anyhow::anyhow!("callback {}", panic_message(panic.as_ref()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use tracing_test::traced_test;

    #[derive(Default)]
    struct Recorder {
        active: AtomicUsize,
        max_active: AtomicUsize,
        calls: Mutex<Vec<DataEvents>>,
        delay: Duration,
        fail_on_call: Option<usize>,
        panic_on_call: Option<usize>,
    }

    #[async_trait]
    impl DataWatchCallback for Recorder {
        async fn on_scan_data(
            &self,
            events: &DataEvents,
            _nodes: &NodeMap,
            _info: &ScanInfo,
        ) -> anyhow::Result<()> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            let count = {
                let mut calls = self.calls.lock();
                calls.push(events.clone());
                calls.len()
            };
            if self.fail_on_call == Some(count) {
                return Err(anyhow!("display crashed"));
            }
            if self.panic_on_call == Some(count) {
                panic!("display thread died");
            }
            Ok(())
        }
    }

    fn watch(recorder: &Arc<Recorder>) -> Arc<DataWatch> {
        DataWatch::spawn(
            recorder.clone(),
            Arc::new(ScanShared::default()),
            Duration::from_millis(10),
        )
    }

    #[tokio::test]
    async fn test_burst_coalesces_without_overlap() {
        let recorder = Arc::new(Recorder {
            delay: Duration::from_millis(20),
            ..Default::default()
        });
        let dw = watch(&recorder);

        for i in 0..200 {
            dw.mark(&format!("dev{}", i % 5), Signal::NewData);
            if i % 50 == 0 {
                dw.sync("timer", Signal::End).await;
            }
            tokio::task::yield_now().await;
        }
        dw.close(Duration::from_secs(1)).await;

        assert_eq!(recorder.max_active.load(Ordering::SeqCst), 1);
        let calls = recorder.calls.lock();
        assert!(calls.len() < 200);
        let seen: BTreeSet<_> = calls.iter().flat_map(|e| e.keys().cloned()).collect();
        assert_eq!(seen.len(), 6);
    }

    #[tokio::test]
    async fn test_sync_is_delivered_before_return() {
        let recorder = Arc::new(Recorder::default());
        let dw = watch(&recorder);

        dw.sync("diode", Signal::End).await;
        {
            let calls = recorder.calls.lock();
            assert!(calls
                .iter()
                .any(|e| e.get("diode").is_some_and(|s| s.contains(&Signal::End))));
        }
        dw.close(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    #[traced_test]
    async fn test_callback_failure_stops_notifications() {
        let recorder = Arc::new(Recorder {
            fail_on_call: Some(1),
            ..Default::default()
        });
        let dw = watch(&recorder);

        dw.sync("a", Signal::NewData).await;
        assert!(dw.failure().unwrap().contains("display crashed"));

        dw.mark("b", Signal::NewData);
        dw.sync("c", Signal::End).await;
        dw.close(Duration::from_secs(1)).await;
        assert_eq!(dw.invocations(), 1);
        assert!(logs_contain("progress notifications stopped"));
    }

    #[tokio::test]
    async fn test_panicking_callback_is_recorded_as_failure() {
        let recorder = Arc::new(Recorder {
            panic_on_call: Some(1),
            ..Default::default()
        });
        let dw = watch(&recorder);

        dw.sync("a", Signal::End).await;
        let failure = dw.failure().unwrap();
        assert!(failure.contains("display thread died"), "{failure}");

        dw.mark("b", Signal::NewData);
        dw.close(Duration::from_secs(1)).await;
        assert_eq!(dw.invocations(), 1);
    }

    #[tokio::test]
    async fn test_nothing_delivered_after_close() {
        let recorder = Arc::new(Recorder::default());
        let dw = watch(&recorder);
        dw.mark("a", Signal::NewData);
        dw.close(Duration::from_secs(1)).await;
        let before = dw.invocations();
        assert!(before >= 1);

        dw.mark("a", Signal::NewData);
        dw.sync("a", Signal::End).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(dw.invocations(), before);
    }
}
