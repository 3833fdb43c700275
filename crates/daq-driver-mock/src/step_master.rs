//! Step-scan master: moves an axis through a list of positions and
//! triggers its slaves at each one.

use anyhow::Result;
use async_trait::async_trait;
use daq_core::{AcqContext, AcqOptions, AcquisitionChannel, AcquisitionObject, ChannelValue, Step};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::axis::MockAxis;
use crate::common::{CallCounts, CallSnapshot, ErrorConfig};

/// Evenly spaced positions from `start` to `stop` inclusive.
pub fn linspace(start: f64, stop: f64, intervals: usize) -> Vec<f64> {
    if intervals == 0 {
        return vec![start];
    }
    let step = (stop - start) / intervals as f64;
    (0..=intervals).map(|i| start + step * i as f64).collect()
}

/// Master that steps a [`MockAxis`].
///
/// Each start moves to the current position, emits it on the
/// `<master>:<axis>` channel and triggers the software slaves. The sequence
/// restarts from the first position on a fresh scan or on rewind, so the
/// master also works as a nested (non-top) master.
pub struct StepMaster {
    name: String,
    axis: Arc<MockAxis>,
    positions: Vec<f64>,
    index: AtomicUsize,
    channel: Arc<AcquisitionChannel>,
    terminator: bool,
    errors: ErrorConfig,
    calls: CallCounts,
}

impl StepMaster {
    /// Master named `name` stepping `axis` through `positions`.
    pub fn new(name: impl Into<String>, axis: Arc<MockAxis>, positions: Vec<f64>) -> Self {
        let name = name.into();
        let channel = Arc::new(AcquisitionChannel::scalar(
            name.clone(),
            daq_core::Positioner::name(axis.as_ref()),
        ));
        Self {
            name,
            axis,
            positions,
            index: AtomicUsize::new(0),
            channel,
            terminator: true,
            errors: ErrorConfig::none(),
            calls: CallCounts::default(),
        }
    }

    /// Whether finishing this master ends the scan's START phase.
    pub fn with_terminator(mut self, terminator: bool) -> Self {
        self.terminator = terminator;
        self
    }

    /// Error injection on prepare/start/stop.
    pub fn with_errors(mut self, errors: ErrorConfig) -> Self {
        self.errors = errors;
        self
    }

    /// The stepped axis.
    pub fn axis(&self) -> &Arc<MockAxis> {
        &self.axis
    }

    /// Capability calls received so far.
    pub fn calls(&self) -> CallSnapshot {
        self.calls.snapshot()
    }

    fn current(&self) -> Option<f64> {
        self.positions.get(self.index.load(Ordering::Acquire)).copied()
    }
}

#[async_trait]
impl AcquisitionObject for StepMaster {
    fn name(&self) -> &str {
        &self.name
    }

    fn channels(&self) -> Vec<Arc<AcquisitionChannel>> {
        vec![self.channel.clone()]
    }

    fn options(&self) -> AcqOptions {
        AcqOptions {
            npoints: self.positions.len(),
            terminator: self.terminator,
            ..Default::default()
        }
    }

    async fn prepare(&self, ctx: &AcqContext) -> Result<()> {
        self.calls.prepared();
        if ctx.iteration() == 0 {
            self.index.store(0, Ordering::Release);
        }
        self.errors.apply(&self.name, "prepare").await
    }

    async fn start(&self, ctx: &AcqContext) -> Result<()> {
        self.calls.started();
        self.errors.apply(&self.name, "start").await?;
        let Some(target) = self.current() else {
            return Ok(());
        };
        self.axis.move_to(target).await?;
        let position = daq_core::Positioner::position(self.axis.as_ref()).await?;
        self.channel.emit_one(ChannelValue::Float(position)).await?;
        tracing::trace!(master = %self.name, position, "step");
        ctx.trigger_slaves().await
    }

    async fn stop(&self) -> Result<()> {
        self.calls.stopped();
        self.errors.apply(&self.name, "stop").await
    }

    async fn next_step(&self) -> Result<Step> {
        let next = self.index.fetch_add(1, Ordering::AcqRel) + 1;
        Ok(if next < self.positions.len() {
            Step::Next
        } else {
            Step::Done
        })
    }

    async fn rewind(&self) -> Result<()> {
        self.index.store(0, Ordering::Release);
        Ok(())
    }
}
