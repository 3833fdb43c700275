//! Scan engine.
//!
//! A [`Scan`] executes an [`AcquisitionChain`] once:
//!
//! ```text
//! IDLE ──run()──▶ PREPARING ──▶ STARTING ──▶ STOPPING ──▶ IDLE (finished)
//!                     │             │                         ▲
//!                     └── error / kill / abort ───────────────┘
//! ```
//!
//! - PREPARE runs one task per top-level master and fails on the first error,
//!   cancelling the others.
//! - START runs one task per top-level master and ends as soon as a
//!   terminator master is exhausted (or every master is); the rest are
//!   cancelled.
//! - STOP always runs, calls `stop` on every object and collects failures.
//!   A kill landing during STOP grants in-flight stop calls a grace period.
//! - Finalization always runs, including when the future returned by
//!   [`Scan::run`] is dropped: execution lives in its own task and dropping
//!   the caller's future only kills the scan.
//!
//! The terminal outcome (`DONE`, `USER_ABORTED`, `KILLED`) is published in
//! `scan_info["state"]`, on [`ScanStatus`] and in the engine history.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use daq_core::{
    keys, AcqCall, AcquisitionChannel, ChannelValue, DaqError, DaqResult, DataNode, DataStore,
    NodeKind, ScanInfo, ScanOutcome, ScanState, ScanStatistics, ScanWriter,
};
use daq_storage::{MemoryStore, NullWriter};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{watch, Notify};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::chain::AcquisitionChain;
use crate::context::{EngineContext, ScanRecord};
use crate::data_watch::{DataWatch, DataWatchCallback, EventQueue};
use crate::events::{ScanEventSink, ScanShared};
use crate::iterator::ChainIterator;
use crate::preset::ScanPreset;
use crate::watchdog::{run_watchdog, WatchdogCallback};

/// Observable lifecycle of a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanStatus {
    /// Current phase; `Idle` both before and after the run
    pub state: ScanState,
    /// Set once finalization completed
    pub finished: bool,
    /// Terminal outcome, once finished
    pub outcome: Option<ScanOutcome>,
}

impl Default for ScanStatus {
    fn default() -> Self {
        Self {
            state: ScanState::Idle,
            finished: false,
            outcome: None,
        }
    }
}

struct ScanInner {
    name: String,
    uid: Uuid,
    chain: Arc<AcquisitionChain>,
    context: Arc<EngineContext>,
    initial_info: ScanInfo,
    scan_type: Option<String>,
    node_kind: NodeKind,
    store: Arc<dyn DataStore>,
    writer: Arc<dyn ScanWriter>,
    data_watch: Option<Arc<dyn DataWatchCallback>>,
    watchdog: Option<Arc<dyn WatchdogCallback>>,
    presets: Mutex<Vec<Arc<dyn ScanPreset>>>,
    shared: Arc<ScanShared>,
    stats: Arc<ScanStatistics>,
    status: watch::Sender<ScanStatus>,
    started: AtomicBool,
    abort_requested: AtomicBool,
    cancel: CancellationToken,
    kills: AtomicUsize,
    kill_notify: Notify,
    escalated: Mutex<ScanOutcome>,
    scan_nb: Mutex<Option<u64>>,
    scan_node: RwLock<Option<Arc<dyn DataNode>>>,
    data_watch_failure: Mutex<Option<String>>,
    record: Mutex<Option<ScanRecord>>,
}

/// Resources acquired while running, released by STOP and finalization.
#[derive(Default)]
struct Execution {
    iterators: Vec<Arc<ChainIterator>>,
    channels: Vec<Arc<AcquisitionChannel>>,
    nodes: Vec<Arc<dyn DataNode>>,
    data_watch: Option<Arc<DataWatch>>,
    watchdog_queue: Option<Arc<EventQueue>>,
}

/// Builder for [`Scan`].
pub struct ScanBuilder {
    chain: Arc<AcquisitionChain>,
    context: Arc<EngineContext>,
    name: String,
    info: ScanInfo,
    scan_type: Option<String>,
    node_kind: NodeKind,
    store: Option<Arc<dyn DataStore>>,
    writer: Option<Arc<dyn ScanWriter>>,
    data_watch: Option<Arc<dyn DataWatchCallback>>,
    watchdog: Option<Arc<dyn WatchdogCallback>>,
    presets: Vec<Arc<dyn ScanPreset>>,
}

impl ScanBuilder {
    /// Scan name, also the default title.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Caller-provided `scan_info` entries, merged under the engine's keys.
    pub fn scan_info(mut self, info: ScanInfo) -> Self {
        self.info = info;
        self
    }

    /// Value of `scan_info["type"]` (defaults to the name).
    pub fn scan_type(mut self, scan_type: impl Into<String>) -> Self {
        self.scan_type = Some(scan_type.into());
        self
    }

    /// Storage backend (defaults to a private in-memory store).
    pub fn store(mut self, store: Arc<dyn DataStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// File writer (defaults to the null writer).
    pub fn writer(mut self, writer: Arc<dyn ScanWriter>) -> Self {
        self.writer = Some(writer);
        self
    }

    /// Data-watch callback.
    pub fn data_watch(mut self, callback: Arc<dyn DataWatchCallback>) -> Self {
        self.data_watch = Some(callback);
        self
    }

    /// Watchdog callback.
    pub fn watchdog(mut self, callback: Arc<dyn WatchdogCallback>) -> Self {
        self.watchdog = Some(callback);
        self
    }

    /// Add a preset.
    pub fn preset(mut self, preset: Arc<dyn ScanPreset>) -> Self {
        self.presets.push(preset);
        self
    }

    pub(crate) fn node_kind(mut self, kind: NodeKind) -> Self {
        self.node_kind = kind;
        self
    }

    /// Build the scan. Nothing runs until [`Scan::run`].
    pub fn build(self) -> Scan {
        let (status, _) = watch::channel(ScanStatus::default());
        Scan {
            inner: Arc::new(ScanInner {
                name: self.name,
                uid: Uuid::new_v4(),
                chain: self.chain,
                context: self.context,
                initial_info: self.info,
                scan_type: self.scan_type,
                node_kind: self.node_kind,
                store: self.store.unwrap_or_else(|| Arc::new(MemoryStore::new())),
                writer: self.writer.unwrap_or_else(|| Arc::new(NullWriter)),
                data_watch: self.data_watch,
                watchdog: self.watchdog,
                presets: Mutex::new(self.presets),
                shared: Arc::new(ScanShared::default()),
                stats: Arc::new(ScanStatistics::new()),
                status,
                started: AtomicBool::new(false),
                abort_requested: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                kills: AtomicUsize::new(0),
                kill_notify: Notify::new(),
                escalated: Mutex::new(ScanOutcome::Done),
                scan_nb: Mutex::new(None),
                scan_node: RwLock::new(None),
                data_watch_failure: Mutex::new(None),
                record: Mutex::new(None),
            }),
        }
    }
}

/// Handle on one execution of an acquisition chain. Cheap to clone.
#[derive(Clone)]
pub struct Scan {
    inner: Arc<ScanInner>,
}

impl Scan {
    /// Start building a scan over `chain`.
    pub fn builder(chain: Arc<AcquisitionChain>, context: Arc<EngineContext>) -> ScanBuilder {
        ScanBuilder {
            chain,
            context,
            name: "scan".to_string(),
            info: ScanInfo::new(),
            scan_type: None,
            node_kind: NodeKind::Scan,
            store: None,
            writer: None,
            data_watch: None,
            watchdog: None,
            presets: Vec::new(),
        }
    }

    /// Scan with default store and writer.
    pub fn new(
        chain: Arc<AcquisitionChain>,
        name: impl Into<String>,
        context: Arc<EngineContext>,
    ) -> Self {
        Self::builder(chain, context).name(name).build()
    }

    /// Scan name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Unique id; also the owner tag on connected channels.
    pub fn uid(&self) -> Uuid {
        self.inner.uid
    }

    /// The chain being executed.
    pub fn chain(&self) -> &Arc<AcquisitionChain> {
        &self.inner.chain
    }

    /// Scan number, allocated when the run begins.
    pub fn scan_number(&self) -> Option<u64> {
        *self.inner.scan_nb.lock()
    }

    /// Snapshot of `scan_info`.
    pub fn scan_info(&self) -> ScanInfo {
        self.inner.shared.info_snapshot()
    }

    /// Current status.
    pub fn status(&self) -> ScanStatus {
        *self.inner.status.borrow()
    }

    /// Current phase.
    pub fn state(&self) -> ScanState {
        self.status().state
    }

    /// Whether finalization completed.
    pub fn is_finished(&self) -> bool {
        self.status().finished
    }

    /// Terminal outcome, once finished.
    pub fn outcome(&self) -> Option<ScanOutcome> {
        self.status().outcome
    }

    /// Whether `run()` was ever called.
    pub fn has_started(&self) -> bool {
        self.inner.started.load(Ordering::Acquire)
    }

    /// Per-call timing table.
    pub fn statistics(&self) -> &ScanStatistics {
        &self.inner.stats
    }

    /// Top-level storage node, once created.
    pub fn node(&self) -> Option<Arc<dyn DataNode>> {
        self.inner.scan_node.read().clone()
    }

    /// Storage node of a channel (by full name) or object (by name).
    pub fn channel_node(&self, name: &str) -> Option<Arc<dyn DataNode>> {
        self.inner.shared.nodes.read().get(name).cloned()
    }

    /// Everything stored for a channel so far.
    pub async fn channel_data(&self, fullname: &str) -> DaqResult<Vec<ChannelValue>> {
        match self.channel_node(fullname) {
            Some(node) => node.fetch().await,
            None => Err(DaqError::Storage(format!(
                "scan '{}' has no node for '{}'",
                self.name(),
                fullname
            ))),
        }
    }

    /// Why the data watch stopped notifying, if it failed.
    pub fn data_watch_failure(&self) -> Option<String> {
        self.inner.data_watch_failure.lock().clone()
    }

    /// History entry, once finished.
    pub fn record(&self) -> Option<ScanRecord> {
        self.inner.record.lock().clone()
    }

    /// Register a preset before running.
    pub fn add_preset(&self, preset: Arc<dyn ScanPreset>) {
        self.inner.presets.lock().push(preset);
    }

    /// Raise the terminal outcome to at least `outcome`.
    pub fn escalate_outcome(&self, outcome: ScanOutcome) {
        let mut escalated = self.inner.escalated.lock();
        *escalated = (*escalated).max(outcome);
    }

    /// Kill the scan; it finalizes as `KILLED`.
    pub fn kill(&self) {
        info!(scan = %self.name(), "kill requested");
        self.request_cancel();
    }

    /// Interrupt the scan on user request; it finalizes as `USER_ABORTED`.
    pub fn abort(&self) {
        info!(scan = %self.name(), "abort requested");
        self.inner.abort_requested.store(true, Ordering::Release);
        self.request_cancel();
    }

    fn request_cancel(&self) {
        self.inner.kills.fetch_add(1, Ordering::AcqRel);
        self.inner.cancel.cancel();
        self.inner.kill_notify.notify_waiters();
    }

    /// Resolves on the first kill or abort requested after `kills_seen`
    /// requests, or on cancellation when the scan was not cancelled yet.
    async fn next_kill(&self, kills_seen: Option<usize>) {
        let Some(kills_seen) = kills_seen else {
            self.inner.cancel.cancelled().await;
            return;
        };
        loop {
            let notified = self.inner.kill_notify.notified();
            if self.inner.kills.load(Ordering::Acquire) > kills_seen {
                return;
            }
            notified.await;
        }
    }

    /// Wait until the scan reached `target` (or a later phase) or finished.
    pub async fn wait_state(&self, target: ScanState) -> ScanStatus {
        let mut rx = self.inner.status.subscribe();
        let reached = rx
            .wait_for(|s| s.finished || s.state >= target)
            .await
            .map(|s| *s);
        reached.unwrap_or_else(|_| self.status())
    }

    /// Wait until finalization completed.
    pub async fn wait_finished(&self) -> ScanStatus {
        let mut rx = self.inner.status.subscribe();
        let finished = rx.wait_for(|s| s.finished).await.map(|s| *s);
        finished.unwrap_or_else(|_| self.status())
    }

    /// Execute the chain once.
    ///
    /// A second call fails with [`DaqError::AlreadyRun`]. Dropping the
    /// returned future kills the scan; finalization still runs.
    #[instrument(skip(self), fields(scan = %self.name()))]
    pub async fn run(&self) -> DaqResult<()> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Err(DaqError::AlreadyRun(self.name().to_string()));
        }

        let guard = self.inner.cancel.clone().drop_guard();
        let scan = self.clone();
        let handle = tokio::spawn(async move { scan.execute().await });
        let result = match handle.await {
            Ok(result) => result,
            Err(e) => Err(DaqError::Task(format!("scan task failed: {}", e))),
        };
        guard.disarm();
        result
    }

    fn cancel_error(&self) -> DaqError {
        if self.inner.abort_requested.load(Ordering::Acquire) {
            DaqError::UserAborted(self.name().to_string())
        } else {
            DaqError::Killed(self.name().to_string())
        }
    }

    async fn execute(&self) -> DaqResult<()> {
        let mut exec = Execution::default();

        let phases = AssertUnwindSafe(self.run_phases(&mut exec))
            .catch_unwind()
            .await;
        let mut phase_result = match phases {
            Ok(result) => result,
            Err(panic) => Err(DaqError::Task(panic_message(panic.as_ref()))),
        };
        if let Err(e) = &phase_result {
            if e.is_cancellation() {
                warn!(scan = %self.name(), reason = %e, "scan interrupted");
            } else {
                error!(scan = %self.name(), error = %e, "scan failed");
            }
        }

        let stop_result = self.stop_phase(&exec).await;
        if phase_result.is_ok() && self.inner.cancel.is_cancelled() {
            phase_result = Err(self.cancel_error());
        }

        let finalize_result = self.finalize(&mut exec, &phase_result, &stop_result).await;
        phase_result.and(stop_result).and(finalize_result)
    }

    fn set_state(&self, state: ScanState, exec: &Execution) {
        self.inner.shared.info.write().set_state(state);
        self.inner.status.send_modify(|s| s.state = state);
        if let Some(watch) = &exec.data_watch {
            watch.set_state(state);
        }
        debug!(scan = %self.name(), %state, "scan state");
    }

    async fn run_phases(&self, exec: &mut Execution) -> DaqResult<()> {
        self.prepare_record(exec).await?;
        self.setup(exec).await?;
        self.prepare_phase(exec).await?;
        self.start_phase(exec).await
    }

    /// Scan number, top-level node and initial `scan_info`.
    async fn prepare_record(&self, exec: &mut Execution) -> DaqResult<()> {
        let inner = &self.inner;
        let scan_nb = inner
            .context
            .next_scan_number(inner.writer.as_ref())
            .await?;
        *inner.scan_nb.lock() = Some(scan_nb);

        let node_name = format!("{}_{}", scan_nb, inner.name);
        let node = inner
            .store
            .create_node(&node_name, inner.node_kind, None)
            .await?;
        exec.nodes.push(node.clone());
        *inner.scan_node.write() = Some(node.clone());

        inner.chain.freeze();

        let (positions, dial_positions) = inner.context.snapshot_positions().await;
        let now = chrono::Local::now();
        let npoints = inner
            .chain
            .top_masters()
            .iter()
            .map(|m| m.options().npoints)
            .max()
            .unwrap_or(0);
        let filename = inner
            .writer
            .filename()
            .unwrap_or_else(|| inner.context.settings().scan.default_filename.clone());

        let mut info = ScanInfo::new()
            .with(keys::TITLE, inner.name.clone())
            .with(
                keys::TYPE,
                inner.scan_type.clone().unwrap_or_else(|| inner.name.clone()),
            )
            .with(keys::NPOINTS, npoints);
        info.merge(&inner.initial_info);
        info.insert(keys::SCAN_NB, scan_nb);
        info.insert(keys::NODE_NAME, node.db_name());
        info.insert(keys::FILENAME, filename);
        info.insert(keys::SESSION_NAME, inner.context.session_name());
        info.insert(keys::USER_NAME, inner.context.user_name());
        info.insert(keys::ACQUISITION_CHAIN, inner.chain.describe());
        info.insert(keys::START_TIME, now.to_rfc3339());
        info.insert(
            keys::START_TIMESTAMP,
            now.timestamp_millis() as f64 / 1000.0,
        );
        info.insert(keys::POSITIONERS, Value::Object(positions));
        info.insert(keys::POSITIONERS_DIAL, Value::Object(dial_positions));
        info.set_state(ScanState::Idle);
        *inner.shared.info.write() = info;

        info!(scan = %inner.name, scan_nb, node = %node.db_name(), "scan created");
        Ok(())
    }

    /// Data watch, event routing, iterators and storage nodes.
    async fn setup(&self, exec: &mut Execution) -> DaqResult<()> {
        let inner = &self.inner;
        let settings = inner.context.settings();

        if let Some(callback) = &inner.data_watch {
            let watch = DataWatch::spawn(
                callback.clone(),
                inner.shared.clone(),
                settings.scan.data_watch_period(),
            );
            watch.scan_new(&inner.shared.info_snapshot()).await;
            exec.data_watch = Some(watch);
        }

        exec.watchdog_queue = inner.watchdog.as_ref().map(|_| Arc::new(EventQueue::new()));

        let sink = Arc::new(ScanEventSink::new(
            inner.shared.clone(),
            exec.data_watch.clone(),
            exec.watchdog_queue.clone(),
        ));

        exec.iterators = inner
            .chain
            .iterators()
            .into_iter()
            .map(|it| Arc::new(it.with_events(sink.clone(), inner.stats.clone())))
            .collect();

        let scan_db = match &*inner.scan_node.read() {
            Some(node) => node.db_name().to_string(),
            None => return Err(DaqError::Storage("scan node missing".into())),
        };
        let owner = inner.uid.to_string();
        for object in inner.chain.objects() {
            let container = inner
                .store
                .create_node(object.name(), NodeKind::Container, Some(scan_db.as_str()))
                .await?;
            exec.nodes.push(container.clone());
            inner
                .shared
                .nodes
                .write()
                .insert(object.name().to_string(), container.clone());

            for channel in object.channels() {
                let node = inner
                    .store
                    .create_node(&channel.fullname(), NodeKind::Channel, Some(container.db_name()))
                    .await?;
                exec.nodes.push(node.clone());
                inner.shared.nodes.write().insert(channel.fullname(), node);
                channel.connect(&owner, sink.clone())?;
                exec.channels.push(channel);
            }
        }
        Ok(())
    }

    async fn prepare_phase(&self, exec: &Execution) -> DaqResult<()> {
        self.set_state(ScanState::Preparing, exec);
        self.run_presets(PresetHook::Prepare).await?;
        let info = self.scan_info();
        self.inner.writer.prepare(&info).await?;

        let mut tasks = JoinSet::new();
        for it in &exec.iterators {
            let it = it.clone();
            tasks.spawn(async move { it.prepare().await });
        }

        let result = loop {
            tokio::select! {
                biased;
                _ = self.inner.cancel.cancelled() => break Err(self.cancel_error()),
                joined = tasks.join_next() => match joined {
                    None => break Ok(()),
                    Some(Ok(Ok(()))) => {}
                    Some(Ok(Err(e))) => break Err(e),
                    Some(Err(e)) => break Err(DaqError::Task(e.to_string())),
                },
            }
        };
        tasks.shutdown().await;
        result
    }

    async fn start_phase(&self, exec: &Execution) -> DaqResult<()> {
        self.set_state(ScanState::Starting, exec);
        self.run_presets(PresetHook::Start).await?;

        let mut tasks = JoinSet::new();
        for it in &exec.iterators {
            let it = it.clone();
            tasks.spawn(async move {
                let result = it.run().await;
                (it.name().to_string(), it.is_terminator(), result)
            });
        }

        let watchdog = {
            let callback = self.inner.watchdog.clone();
            let queue = exec.watchdog_queue.clone();
            let shared = self.inner.shared.clone();
            async move {
                match (callback, queue) {
                    (Some(callback), Some(queue)) => run_watchdog(callback, queue, shared).await,
                    _ => std::future::pending().await,
                }
            }
        };
        tokio::pin!(watchdog);

        let result = loop {
            tokio::select! {
                biased;
                _ = self.inner.cancel.cancelled() => break Err(self.cancel_error()),
                stopped = &mut watchdog => break stopped,
                joined = tasks.join_next() => match joined {
                    None => break Ok(()),
                    Some(Ok((master, terminator, Ok(())))) => {
                        debug!(scan = %self.name(), %master, terminator, "master finished");
                        if terminator {
                            break Ok(());
                        }
                    }
                    Some(Ok((_, _, Err(e)))) => break Err(e),
                    Some(Err(e)) => break Err(DaqError::Task(e.to_string())),
                },
            }
        };
        tasks.shutdown().await;
        result
    }

    /// Stop every branch, best effort.
    ///
    /// Stop calls are joined to completion. Only a kill requested while
    /// they are in flight bounds them to the grace period; a kill that
    /// ended START does not.
    async fn stop_phase(&self, exec: &Execution) -> DaqResult<()> {
        let kills_seen = self
            .inner
            .cancel
            .is_cancelled()
            .then(|| self.inner.kills.load(Ordering::Acquire));
        self.set_state(ScanState::Stopping, exec);

        let collected: Arc<Mutex<Vec<DaqError>>> = Arc::default();
        let mut tasks = JoinSet::new();
        for it in &exec.iterators {
            let it = it.clone();
            tasks.spawn(async move { it.stop().await });
        }
        let collect = {
            let collected = collected.clone();
            async move {
                while let Some(joined) = tasks.join_next().await {
                    match joined {
                        Ok(errors) => collected.lock().extend(errors),
                        Err(e) => collected.lock().push(DaqError::Task(e.to_string())),
                    }
                }
            }
        };
        let mut collect = Box::pin(collect);

        tokio::select! {
            biased;
            _ = &mut collect => {}
            _ = self.next_kill(kills_seen) => {
                let grace = self.inner.context.settings().scan.stop_grace();
                if tokio::time::timeout(grace, &mut collect).await.is_err() {
                    warn!(
                        scan = %self.name(),
                        grace_ms = grace.as_millis() as u64,
                        "stop calls still running after kill grace period, aborting them"
                    );
                    collected.lock().push(DaqError::Task(
                        "stop calls aborted after kill grace period".into(),
                    ));
                }
            }
        }
        drop(collect);

        if let Err(e) = self.run_presets(PresetHook::Stop).await {
            collected.lock().push(e);
        }

        let errors = std::mem::take(&mut *collected.lock());
        if errors.is_empty() {
            Ok(())
        } else {
            for e in &errors {
                warn!(scan = %self.name(), error = %e, "stop failure");
            }
            Err(DaqError::StopFailed(errors))
        }
    }

    async fn run_presets(&self, hook: PresetHook) -> DaqResult<()> {
        let presets = self.inner.presets.lock().clone();
        let mut errors = Vec::new();
        for preset in presets {
            let call = async {
                let result = match hook {
                    PresetHook::Prepare => preset.prepare(self).await,
                    PresetHook::Start => preset.start(self).await,
                    PresetHook::Stop => preset.stop(self).await,
                };
                result.map_err(|e| DaqError::hardware("preset", AcqCall::Preset, e))
            };
            if let Err(e) = guarded(call).await {
                if hook != PresetHook::Stop {
                    return Err(e);
                }
                errors.push(e);
            }
        }
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(DaqError::StopFailed(errors)),
        }
    }

    #[instrument(skip_all, fields(scan = %self.name()))]
    async fn finalize(
        &self,
        exec: &mut Execution,
        phase: &DaqResult<()>,
        stop: &DaqResult<()>,
    ) -> DaqResult<()> {
        let inner = &self.inner;
        for channel in exec.channels.drain(..) {
            channel.disconnect();
        }

        let mut outcome = match phase {
            Ok(()) => ScanOutcome::Done,
            Err(DaqError::UserAborted(_)) => ScanOutcome::UserAborted,
            Err(_) => ScanOutcome::Killed,
        };
        if stop.is_err() {
            outcome = outcome.max(ScanOutcome::Killed);
        }
        outcome = outcome.max(*inner.escalated.lock());

        let now = chrono::Local::now();
        let info = {
            let mut info = inner.shared.info.write();
            info.set_state(outcome);
            info.insert(keys::END_TIME, now.to_rfc3339());
            info.insert(keys::END_TIMESTAMP, now.timestamp_millis() as f64 / 1000.0);
            info.clone()
        };

        if let Some(watch) = exec.data_watch.take() {
            watch
                .close(inner.context.settings().scan.data_watch_shutdown())
                .await;
            watch.scan_end(&info).await;
            *inner.data_watch_failure.lock() = watch.failure();
        }

        let mut errors = Vec::new();
        if let Some(scan_node) = exec.nodes.first() {
            if let Err(e) = guarded(scan_node.set_info(&info)).await {
                errors.push(e);
            }
        }
        for node in &exec.nodes {
            if let Err(e) = guarded(node.set_ttl()).await {
                errors.push(e);
            }
        }
        if let Some(scan_node) = exec.nodes.first() {
            if let Err(e) = guarded(scan_node.end()).await {
                errors.push(e);
            }
        }
        for node in exec.nodes.drain(..) {
            if let Err(e) = guarded(node.close()).await {
                errors.push(e);
            }
        }

        if let Err(e) = guarded(inner.writer.finalize(&info)).await {
            errors.push(e);
        }
        if let Err(e) = guarded(inner.writer.close()).await {
            errors.push(e);
        }

        let record = ScanRecord {
            name: inner.name.clone(),
            scan_nb: self.scan_number(),
            node: self.node().map(|n| n.db_name().to_string()),
            outcome,
            info,
        };
        *inner.record.lock() = Some(record.clone());
        inner.context.push_history(record);

        inner.status.send_modify(|s| {
            s.state = ScanState::Idle;
            s.finished = true;
            s.outcome = Some(outcome);
        });

        info!(scan = %inner.name, scan_nb = ?self.scan_number(), %outcome, "scan finished");
        for (call, stats) in inner.stats.snapshot() {
            debug!(
                %call,
                count = stats.count,
                mean_ms = stats.mean().as_secs_f64() * 1e3,
                max_ms = stats.max.as_secs_f64() * 1e3,
                "call statistics"
            );
        }

        match errors.len() {
            0 => Ok(()),
            _ => Err(errors.remove(0)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PresetHook {
    Prepare,
    Start,
    Stop,
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}

/// Await `call`, turning a panic into [`DaqError::Task`].
async fn guarded<T>(call: impl Future<Output = DaqResult<T>>) -> DaqResult<T> {
    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(DaqError::Task(panic_message(panic.as_ref()))),
    }
}

impl std::fmt::Debug for Scan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scan")
            .field("name", &self.name())
            .field("scan_nb", &self.scan_number())
            .field("status", &self.status())
            .finish()
    }
}
