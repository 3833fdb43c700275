//! Grouping master and slave used by sequences.
//!
//! The grouping master iterates over a queue of member scans and publishes
//! each one on two channels: `scans` (reference to the member's storage
//! node) and `scan_numbers`. It is an ordinary acquisition object, so the
//! sequence record is produced by the same scan engine as its members.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use daq_core::{
    AcqContext, AcqOptions, AcquisitionChannel, AcquisitionObject, ChannelShape, ChannelValue,
    DaqError, DaqResult, DataType, Step, TriggerType,
};
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tracing::debug;

/// Name of the grouping master object.
pub const GROUPING_MASTER: &str = "GroupingMaster";
/// Device name of sequence custom channels.
pub const CUSTOM_CHANNELS: &str = "custom_channels";

/// Identity of a member scan as published by the grouping master.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberRef {
    /// Member scan name
    pub name: String,
    /// Member scan number
    pub scan_nb: Option<u64>,
    /// `db_name` of the member's storage node
    pub node: Option<String>,
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<MemberRef>,
    pending_adds: usize,
    closed: bool,
    drained: bool,
}

/// Member queue between a sequence and its grouping master.
pub(crate) struct GroupQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    queued: AtomicUsize,
    published: watch::Sender<usize>,
}

impl GroupQueue {
    pub(crate) fn new() -> Arc<Self> {
        let (published, _) = watch::channel(0);
        Arc::new(Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            queued: AtomicUsize::new(0),
            published,
        })
    }

    /// Queue a member for publication.
    pub(crate) fn push(&self, member: MemberRef) -> DaqResult<()> {
        {
            let mut state = self.state.lock();
            if state.drained {
                return Err(DaqError::Task(format!(
                    "grouping master already finished, '{}' cannot be published",
                    member.name
                )));
            }
            state.items.push_back(member);
        }
        self.queued.fetch_add(1, Ordering::AcqRel);
        self.notify.notify_one();
        Ok(())
    }

    /// Announce a member that will be pushed later.
    pub(crate) fn begin_add(self: &Arc<Self>) -> PendingGuard {
        self.state.lock().pending_adds += 1;
        PendingGuard {
            queue: self.clone(),
        }
    }

    /// No more direct pushes; the master ends once pending adds are done
    /// and the queue is empty.
    pub(crate) fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_one();
    }

    /// Next member to publish, or `None` once closed and drained.
    async fn next(&self) -> Option<MemberRef> {
        loop {
            {
                let mut state = self.state.lock();
                if let Some(member) = state.items.pop_front() {
                    return Some(member);
                }
                if state.closed && state.pending_adds == 0 {
                    state.drained = true;
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    fn mark_published(&self) {
        self.published.send_modify(|n| *n += 1);
    }

    pub(crate) fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    pub(crate) fn published(&self) -> usize {
        *self.published.borrow()
    }

    pub(crate) fn pending_adds(&self) -> usize {
        self.state.lock().pending_adds
    }

    /// Wait until at least `count` members were published.
    pub(crate) async fn wait_published(&self, count: usize, timeout: Duration) -> bool {
        let mut rx = self.published.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|n| *n >= count))
            .await
            .is_ok_and(|r| r.is_ok())
    }
}

/// Keeps the grouping master alive until a deferred add completes.
pub(crate) struct PendingGuard {
    queue: Arc<GroupQueue>,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        {
            let mut state = self.queue.state.lock();
            state.pending_adds = state.pending_adds.saturating_sub(1);
        }
        self.queue.notify.notify_one();
    }
}

/// Acquisition object publishing member scans.
pub(crate) struct GroupingMaster {
    queue: Arc<GroupQueue>,
    scans: Arc<AcquisitionChannel>,
    scan_numbers: Arc<AcquisitionChannel>,
}

impl GroupingMaster {
    pub(crate) fn new(queue: Arc<GroupQueue>) -> Self {
        Self {
            queue,
            scans: Arc::new(AcquisitionChannel::reference(GROUPING_MASTER, "scans")),
            scan_numbers: Arc::new(AcquisitionChannel::new(
                GROUPING_MASTER,
                "scan_numbers",
                ChannelShape::Scalar,
                DataType::Int64,
            )),
        }
    }

    async fn publish(&self, member: MemberRef) -> Result<()> {
        let number = member
            .scan_nb
            .and_then(|nb| i64::try_from(nb).ok())
            .unwrap_or(-1);
        let reference = member.node.clone().unwrap_or_else(|| member.name.clone());
        self.scan_numbers.emit_one(ChannelValue::Int(number)).await?;
        self.scans.emit_one(ChannelValue::Text(reference)).await?;
        self.queue.mark_published();
        debug!(member = %member.name, scan_nb = number, "member published");
        Ok(())
    }
}

#[async_trait]
impl AcquisitionObject for GroupingMaster {
    fn name(&self) -> &str {
        GROUPING_MASTER
    }

    fn channels(&self) -> Vec<Arc<AcquisitionChannel>> {
        vec![self.scans.clone(), self.scan_numbers.clone()]
    }

    fn options(&self) -> AcqOptions {
        AcqOptions {
            prepare_once: true,
            start_once: true,
            npoints: 0,
            ..Default::default()
        }
    }

    async fn prepare(&self, _ctx: &AcqContext) -> Result<()> {
        Ok(())
    }

    async fn start(&self, _ctx: &AcqContext) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    async fn next_step(&self) -> Result<Step> {
        match self.queue.next().await {
            Some(member) => {
                self.publish(member).await?;
                Ok(Step::Next)
            }
            None => Ok(Step::Done),
        }
    }
}

/// Holder of the sequence's custom channels.
pub(crate) struct GroupingSlave {
    channels: Vec<Arc<AcquisitionChannel>>,
    started: watch::Sender<bool>,
}

impl GroupingSlave {
    pub(crate) fn new(channels: Vec<Arc<AcquisitionChannel>>) -> (Self, watch::Receiver<bool>) {
        let (started, rx) = watch::channel(false);
        (Self { channels, started }, rx)
    }
}

#[async_trait]
impl AcquisitionObject for GroupingSlave {
    fn name(&self) -> &str {
        CUSTOM_CHANNELS
    }

    fn channels(&self) -> Vec<Arc<AcquisitionChannel>> {
        self.channels.clone()
    }

    fn options(&self) -> AcqOptions {
        AcqOptions {
            prepare_once: true,
            start_once: true,
            npoints: 0,
            trigger_type: TriggerType::Hardware,
            ..Default::default()
        }
    }

    async fn prepare(&self, _ctx: &AcqContext) -> Result<()> {
        Ok(())
    }

    async fn start(&self, _ctx: &AcqContext) -> Result<()> {
        self.started.send_replace(true);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use daq_core::{EventSink, Signal};

    #[derive(Default)]
    struct Collect(Mutex<Vec<ChannelValue>>);

    #[async_trait]
    impl EventSink for Collect {
        async fn new_data(
            &self,
            _channel: &AcquisitionChannel,
            data: Vec<ChannelValue>,
        ) -> DaqResult<()> {
            self.0.lock().extend(data);
            Ok(())
        }

        async fn device_signal(&self, _device: &str, _signal: Signal) -> DaqResult<()> {
            Ok(())
        }
    }

    fn member(nb: u64) -> MemberRef {
        MemberRef {
            name: format!("loopscan{}", nb),
            scan_nb: Some(nb),
            node: Some(format!("{}_loopscan", nb)),
        }
    }

    #[tokio::test]
    async fn test_queue_ends_after_close_and_pending_adds() {
        let queue = GroupQueue::new();
        queue.push(member(1)).unwrap();
        let guard = queue.begin_add();
        queue.close();

        assert_eq!(queue.next().await, Some(member(1)));

        let q = queue.clone();
        let waiter = tokio::spawn(async move { q.next().await });
        tokio::task::yield_now().await;
        queue.push(member(2)).unwrap();
        drop(guard);
        assert_eq!(waiter.await.unwrap(), Some(member(2)));
        assert_eq!(queue.next().await, None);

        assert!(queue.push(member(3)).is_err());
        assert_eq!(queue.queued(), 2);
    }

    #[tokio::test]
    async fn test_master_publishes_until_drained() {
        let queue = GroupQueue::new();
        let master = GroupingMaster::new(queue.clone());
        queue.push(member(4)).unwrap();
        queue.close();

        assert_eq!(master.next_step().await.unwrap(), Step::Next);
        assert_eq!(queue.published(), 1);
        assert!(queue.wait_published(1, Duration::from_millis(10)).await);
        assert!(!queue.wait_published(2, Duration::from_millis(10)).await);
        assert_eq!(master.next_step().await.unwrap(), Step::Done);
    }

    #[tokio::test]
    async fn test_unrepresentable_scan_number_published_as_unknown() {
        let queue = GroupQueue::new();
        let master = GroupingMaster::new(queue.clone());
        let numbers = Arc::new(Collect::default());
        master
            .scan_numbers
            .connect("group", numbers.clone())
            .unwrap();
        queue.push(member(u64::MAX)).unwrap();
        queue.push(member(5)).unwrap();
        queue.close();

        while master.next_step().await.unwrap() == Step::Next {}

        assert_eq!(
            *numbers.0.lock(),
            vec![ChannelValue::Int(-1), ChannelValue::Int(5)]
        );
    }
}
