//! Software timer master.

use anyhow::Result;
use async_trait::async_trait;
use daq_core::{AcqContext, AcqOptions, AcquisitionChannel, AcquisitionObject, ChannelValue, Step};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::common::{CallCounts, CallSnapshot, ErrorConfig};

/// Master that triggers its slaves then counts for `count_time` per point.
///
/// Publishes `elapsed_time` (seconds since the first start of the scan) on
/// every point. `npoints == 0` runs until stopped.
pub struct TimerMaster {
    name: String,
    count_time: Duration,
    npoints: usize,
    point: AtomicUsize,
    origin: Mutex<Option<Instant>>,
    elapsed: Arc<AcquisitionChannel>,
    terminator: bool,
    errors: ErrorConfig,
    calls: CallCounts,
}

impl TimerMaster {
    pub fn new(name: impl Into<String>, count_time: Duration, npoints: usize) -> Self {
        let name = name.into();
        let elapsed = Arc::new(
            AcquisitionChannel::scalar(name.clone(), "elapsed_time").with_unit("s"),
        );
        Self {
            name,
            count_time,
            npoints,
            point: AtomicUsize::new(0),
            origin: Mutex::new(None),
            elapsed,
            terminator: true,
            errors: ErrorConfig::none(),
            calls: CallCounts::default(),
        }
    }

    /// Whether finishing this timer ends the scan's START phase.
    pub fn with_terminator(mut self, terminator: bool) -> Self {
        self.terminator = terminator;
        self
    }

    pub fn with_errors(mut self, errors: ErrorConfig) -> Self {
        self.errors = errors;
        self
    }

    pub fn count_time(&self) -> Duration {
        self.count_time
    }

    pub fn calls(&self) -> CallSnapshot {
        self.calls.snapshot()
    }
}

#[async_trait]
impl AcquisitionObject for TimerMaster {
    fn name(&self) -> &str {
        &self.name
    }

    fn channels(&self) -> Vec<Arc<AcquisitionChannel>> {
        vec![self.elapsed.clone()]
    }

    fn options(&self) -> AcqOptions {
        AcqOptions {
            npoints: self.npoints,
            terminator: self.terminator,
            ..Default::default()
        }
    }

    async fn prepare(&self, ctx: &AcqContext) -> Result<()> {
        self.calls.prepared();
        if ctx.iteration() == 0 {
            self.point.store(0, Ordering::Release);
            *self.origin.lock() = None;
        }
        self.errors.apply(&self.name, "prepare").await
    }

    async fn start(&self, ctx: &AcqContext) -> Result<()> {
        self.calls.started();
        self.errors.apply(&self.name, "start").await?;
        let elapsed = {
            let mut origin = self.origin.lock();
            origin.get_or_insert_with(Instant::now).elapsed()
        };
        self.elapsed
            .emit_one(ChannelValue::Float(elapsed.as_secs_f64()))
            .await?;
        ctx.trigger_slaves().await?;
        tokio::time::sleep(self.count_time).await;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.calls.stopped();
        self.errors.apply(&self.name, "stop").await
    }

    async fn next_step(&self) -> Result<Step> {
        let next = self.point.fetch_add(1, Ordering::AcqRel) + 1;
        Ok(if self.npoints == 0 || next < self.npoints {
            Step::Next
        } else {
            Step::Done
        })
    }

    async fn rewind(&self) -> Result<()> {
        self.point.store(0, Ordering::Release);
        Ok(())
    }
}
