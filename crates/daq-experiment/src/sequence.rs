//! Sequences: several scans grouped under one record.
//!
//! A sequence runs its own grouping scan (a [`GroupingMaster`] with an
//! optional slave holding custom channels) in the background. Member scans
//! are queued with [`SequenceContext::add`] and published by the grouping
//! master as they reach START.
//!
//! Leaving the context ([`SequenceContext::close`]) is ordered:
//!
//! 1. close the member queue
//! 2. wait (bounded) for deferred member adds
//! 3. wait (bounded) until every queued member was published
//! 4. join (bounded) the grouping scan
//!
//! Any timeout, or any queued member left unpublished, makes the exit fail
//! with a [`SequenceError`].

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use daq_core::config::SequenceSettings;
use daq_core::{
    keys, AcquisitionChannel, ChannelShape, ChannelValue, DaqError, DaqResult, DataStore,
    DataType, NodeKind, ScanInfo, ScanOutcome, ScanState, ScanWriter, SequenceError,
};
use parking_lot::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, instrument, warn};

use crate::chain::AcquisitionChain;
use crate::context::{EngineContext, ScanRecord};
use crate::data_watch::DataWatchCallback;
use crate::grouping::{
    GroupQueue, GroupingMaster, GroupingSlave, MemberRef, CUSTOM_CHANNELS, GROUPING_MASTER,
};
use crate::preset::ScanPreset;
use crate::scan::Scan;

/// A member whose terminal outcome feeds the sequence outcome.
#[derive(Clone)]
enum Member {
    Live(Scan),
    Known(ScanOutcome),
}

impl Member {
    fn outcome(&self) -> Option<ScanOutcome> {
        match self {
            Member::Live(scan) => scan.outcome(),
            Member::Known(outcome) => Some(*outcome),
        }
    }
}

/// Escalates the worst finished member outcome to the sequence record.
struct MemberStatePreset {
    members: Arc<Mutex<Vec<Member>>>,
}

#[async_trait]
impl ScanPreset for MemberStatePreset {
    async fn stop(&self, scan: &Scan) -> anyhow::Result<()> {
        let worst = self
            .members
            .lock()
            .iter()
            .filter_map(Member::outcome)
            .max();
        if let Some(worst) = worst {
            if worst > ScanOutcome::Done {
                warn!(sequence = %scan.name(), %worst, "member scan did not complete");
            }
            scan.escalate_outcome(worst);
        }
        Ok(())
    }
}

fn member_ref(scan: &Scan) -> MemberRef {
    MemberRef {
        name: scan.name().to_string(),
        scan_nb: scan.scan_number(),
        node: scan.node().map(|n| n.db_name().to_string()),
    }
}

/// Sequence definition; [`open`](Self::open) starts it.
pub struct Sequence {
    title: String,
    context: Arc<EngineContext>,
    info: ScanInfo,
    store: Option<Arc<dyn DataStore>>,
    writer: Option<Arc<dyn ScanWriter>>,
    data_watch: Option<Arc<dyn DataWatchCallback>>,
    custom: Vec<Arc<AcquisitionChannel>>,
    scan_type: String,
}

impl Sequence {
    /// New sequence titled `title`.
    pub fn new(title: impl Into<String>, context: Arc<EngineContext>) -> Self {
        Self {
            title: title.into(),
            context,
            info: ScanInfo::new(),
            store: None,
            writer: None,
            data_watch: None,
            custom: Vec::new(),
            scan_type: "sequence".to_string(),
        }
    }

    /// Extra `scan_info` for the sequence record.
    pub fn scan_info(mut self, info: ScanInfo) -> Self {
        self.info = info;
        self
    }

    /// Storage backend of the sequence record.
    pub fn store(mut self, store: Arc<dyn DataStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Writer of the sequence record.
    pub fn writer(mut self, writer: Arc<dyn ScanWriter>) -> Self {
        self.writer = Some(writer);
        self
    }

    /// Data-watch callback of the sequence record.
    pub fn data_watch(mut self, callback: Arc<dyn DataWatchCallback>) -> Self {
        self.data_watch = Some(callback);
        self
    }

    pub(crate) fn scan_type(mut self, scan_type: impl Into<String>) -> Self {
        self.scan_type = scan_type.into();
        self
    }

    /// Declare a channel published alongside the members.
    ///
    /// Emit on the returned channel while the sequence is open.
    pub fn add_custom_channel(
        &mut self,
        name: impl Into<String>,
        shape: ChannelShape,
        dtype: DataType,
    ) -> Arc<AcquisitionChannel> {
        let channel = Arc::new(AcquisitionChannel::new(CUSTOM_CHANNELS, name, shape, dtype));
        self.custom.push(channel.clone());
        channel
    }

    /// Start the grouping scan and wait until it is ready for members.
    #[instrument(skip(self), fields(sequence = %self.title))]
    pub async fn open(self) -> DaqResult<SequenceContext> {
        let settings = self.context.settings().sequence.clone();
        let queue = GroupQueue::new();
        let master = Arc::new(GroupingMaster::new(queue.clone()));
        let (slave, mut slave_started) = GroupingSlave::new(self.custom.clone());

        let chain = AcquisitionChain::new();
        chain.add(master, Arc::new(slave))?;

        let members: Arc<Mutex<Vec<Member>>> = Arc::default();
        let mut builder = Scan::builder(Arc::new(chain), self.context.clone())
            .name(self.title.clone())
            .scan_type(self.scan_type.clone())
            .scan_info(self.info.with(keys::IS_SCAN_SEQUENCE, true))
            .node_kind(NodeKind::ScanGroup)
            .preset(Arc::new(MemberStatePreset {
                members: members.clone(),
            }));
        if let Some(store) = self.store {
            builder = builder.store(store);
        }
        if let Some(writer) = self.writer {
            builder = builder.writer(writer);
        }
        if let Some(callback) = self.data_watch {
            builder = builder.data_watch(callback);
        }
        let scan = builder.build();

        let run_task = tokio::spawn({
            let scan = scan.clone();
            async move { scan.run().await }
        });

        let ready = tokio::time::timeout(settings.start_timeout(), async {
            let status = scan.wait_state(ScanState::Starting).await;
            if status.finished {
                return false;
            }
            slave_started.wait_for(|started| *started).await.is_ok()
        })
        .await;

        match ready {
            Ok(true) => {}
            Ok(false) => {
                let reason = match run_task.await {
                    Ok(Err(e)) => e.to_string(),
                    Ok(Ok(())) => "grouping scan ended before START".to_string(),
                    Err(e) => e.to_string(),
                };
                return Err(SequenceError::GroupScanFailed {
                    title: self.title,
                    reason,
                }
                .into());
            }
            Err(_) => {
                scan.kill();
                let _ = tokio::time::timeout(settings.join_timeout(), run_task).await;
                return Err(SequenceError::StartTimeout {
                    title: self.title,
                    timeout_ms: settings.start_timeout_ms,
                }
                .into());
            }
        }

        info!(sequence = %self.title, scan_nb = ?scan.scan_number(), "sequence started");
        Ok(SequenceContext {
            inner: Arc::new(SequenceInner {
                title: self.title,
                settings,
                scan,
                queue,
                members,
                custom: self.custom,
                adds: tokio::sync::Mutex::new(JoinSet::new()),
                run_task: Mutex::new(Some(run_task)),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Run `body` inside an open sequence, then close it.
    ///
    /// The exit sequence always runs. An error from `body` takes precedence
    /// over an exit error.
    pub async fn sequence_context<F, Fut, T>(self, body: F) -> DaqResult<T>
    where
        F: FnOnce(SequenceContext) -> Fut,
        Fut: Future<Output = DaqResult<T>>,
    {
        let ctx = self.open().await?;
        let result = body(ctx.clone()).await;
        let exit = ctx.close().await;
        match (result, exit) {
            (Err(e), exit) => {
                if let Err(exit_error) = exit {
                    warn!(error = %exit_error, "sequence exit failed after body error");
                }
                Err(e)
            }
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
        }
    }
}

struct SequenceInner {
    title: String,
    settings: SequenceSettings,
    scan: Scan,
    queue: Arc<GroupQueue>,
    members: Arc<Mutex<Vec<Member>>>,
    custom: Vec<Arc<AcquisitionChannel>>,
    adds: tokio::sync::Mutex<JoinSet<(String, DaqResult<()>)>>,
    run_task: Mutex<Option<JoinHandle<DaqResult<()>>>>,
    closed: AtomicBool,
}

impl Drop for SequenceInner {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            warn!(sequence = %self.title, "sequence dropped without close, killing grouping scan");
            self.queue.close();
            self.scan.kill();
        }
    }
}

/// Handle on an open sequence. Cheap to clone.
#[derive(Clone)]
pub struct SequenceContext {
    inner: Arc<SequenceInner>,
}

impl SequenceContext {
    /// The sequence's own scan.
    pub fn scan(&self) -> &Scan {
        &self.inner.scan
    }

    /// Custom channels declared before opening.
    pub fn custom_channels(&self) -> &[Arc<AcquisitionChannel>] {
        &self.inner.custom
    }

    /// Queue `scan` for publication.
    ///
    /// A scan that has not reached START yet is published once it does; a
    /// background task waits for it.
    pub async fn add(&self, scan: &Scan) -> DaqResult<()> {
        let inner = &self.inner;
        inner.members.lock().push(Member::Live(scan.clone()));

        let status = scan.status();
        if scan.has_started() && (status.finished || status.state >= ScanState::Starting) {
            debug!(sequence = %inner.title, member = %scan.name(), "member queued");
            return inner.queue.push(member_ref(scan));
        }

        let guard = inner.queue.begin_add();
        let queue = inner.queue.clone();
        let member = scan.clone();
        inner.adds.lock().await.spawn(async move {
            let _guard = guard;
            member.wait_state(ScanState::Starting).await;
            let result = queue.push(member_ref(&member));
            (member.name().to_string(), result)
        });
        debug!(sequence = %inner.title, member = %scan.name(), "member add deferred");
        Ok(())
    }

    /// Add a scan that has not run yet, then run it to completion.
    pub async fn add_and_run(&self, scan: &Scan) -> DaqResult<()> {
        if scan.has_started() {
            return Err(SequenceError::AlreadyStarted(scan.name().to_string()).into());
        }
        self.add(scan).await?;
        scan.run().await
    }

    pub(crate) fn add_record(&self, record: &ScanRecord) -> DaqResult<()> {
        self.inner
            .members
            .lock()
            .push(Member::Known(record.outcome));
        self.inner.queue.push(MemberRef {
            name: record.name.clone(),
            scan_nb: record.scan_nb,
            node: record.node.clone(),
        })
    }

    /// Wait for every deferred member add.
    ///
    /// On timeout the remaining adds are abandoned.
    pub async fn wait_all_subscans(&self, timeout: Duration) -> DaqResult<()> {
        let inner = &self.inner;
        let mut adds = inner.adds.lock().await;
        let joined = tokio::time::timeout(timeout, async {
            let mut failures = Vec::new();
            while let Some(joined) = adds.join_next().await {
                match joined {
                    Ok((_, Ok(()))) => {}
                    Ok((scan, Err(e))) => failures.push((scan, e.to_string())),
                    Err(e) => failures.push(("<unknown>".to_string(), e.to_string())),
                }
            }
            failures
        })
        .await;

        match joined {
            Err(_) => {
                let pending = adds.len();
                adds.abort_all();
                Err(SequenceError::SubscanTimeout {
                    title: inner.title.clone(),
                    pending,
                }
                .into())
            }
            Ok(failures) => match failures.into_iter().next() {
                None => Ok(()),
                Some((scan, reason)) => Err(SequenceError::SubscanFailed {
                    title: inner.title.clone(),
                    scan,
                    reason,
                }
                .into()),
            },
        }
    }

    /// Members queued so far.
    pub fn queued(&self) -> usize {
        self.inner.queue.queued()
    }

    /// Members published so far.
    pub fn published(&self) -> usize {
        self.inner.queue.published()
    }

    /// Node references published on the `scans` channel.
    pub async fn published_scans(&self) -> DaqResult<Vec<String>> {
        let data = self
            .inner
            .scan
            .channel_data(&format!("{}:scans", GROUPING_MASTER))
            .await?;
        Ok(data
            .iter()
            .filter_map(|v| v.as_text().map(str::to_string))
            .collect())
    }

    /// Scan numbers published on the `scan_numbers` channel.
    pub async fn published_scan_numbers(&self) -> DaqResult<Vec<i64>> {
        let data = self
            .inner
            .scan
            .channel_data(&format!("{}:scan_numbers", GROUPING_MASTER))
            .await?;
        Ok(data
            .iter()
            .filter_map(|v| match v {
                ChannelValue::Int(n) => Some(*n),
                _ => None,
            })
            .collect())
    }

    /// Leave the sequence, guaranteeing every queued member was published.
    ///
    /// Idempotent: later calls return `Ok(())`.
    #[instrument(skip(self), fields(sequence = %self.inner.title))]
    pub async fn close(&self) -> DaqResult<()> {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut first_error: Option<DaqError> = None;

        inner.queue.close();

        if let Err(e) = self.wait_all_subscans(inner.settings.subscan_timeout()).await {
            warn!(error = %e, pending = inner.queue.pending_adds(), "member adds incomplete");
            first_error.get_or_insert(e);
        }

        let queued = inner.queue.queued();
        if !inner
            .queue
            .wait_published(queued, inner.settings.publish_timeout())
            .await
        {
            let published = inner.queue.published();
            warn!(queued, published, "members not published in time");
            first_error.get_or_insert(
                SequenceError::Unpublished {
                    title: inner.title.clone(),
                    queued,
                    published,
                }
                .into(),
            );
        }

        let run_task = inner.run_task.lock().take();
        if let Some(mut handle) = run_task {
            let join_timeout = inner.settings.join_timeout();
            let reason = match tokio::time::timeout(join_timeout, &mut handle).await {
                Ok(Ok(Ok(()))) => None,
                Ok(Ok(Err(e))) => Some(e.to_string()),
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => {
                    inner.scan.kill();
                    let _ = tokio::time::timeout(join_timeout, handle).await;
                    Some(format!(
                        "did not terminate within {} ms",
                        join_timeout.as_millis()
                    ))
                }
            };
            if let Some(reason) = reason {
                first_error.get_or_insert(
                    SequenceError::GroupScanFailed {
                        title: inner.title.clone(),
                        reason,
                    }
                    .into(),
                );
            }
        }

        let queued = inner.queue.queued();
        let published = inner.queue.published();
        if queued != published {
            first_error.get_or_insert(
                SequenceError::Unpublished {
                    title: inner.title.clone(),
                    queued,
                    published,
                }
                .into(),
            );
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                info!(sequence = %inner.title, members = published, "sequence closed");
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for SequenceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequenceContext")
            .field("title", &self.inner.title)
            .field("queued", &self.queued())
            .field("published", &self.published())
            .finish()
    }
}
