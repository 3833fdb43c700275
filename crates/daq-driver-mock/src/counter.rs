//! Scalar counter.

use anyhow::Result;
use async_trait::async_trait;
use daq_core::{
    AcqContext, AcqOptions, AcquisitionChannel, AcquisitionObject, ChannelValue, TriggerType,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::common::{CallCounts, CallSnapshot, ErrorConfig, MockRng};

/// Software-triggered counter publishing one value per trigger on `<name>:<name>`.
///
/// Readings are `base + noise`, with noise drawn from a seeded RNG, or follow
/// counting statistics around `base` when enabled. Reads go
/// through the `"read"` error-injection label, so
/// `ErrorScenario::FailAfterN { operation: "read", count: 2 }` makes the
/// third point fail.
pub struct MockCounter {
    name: String,
    channel: Arc<AcquisitionChannel>,
    base: f64,
    noise: f64,
    counting: bool,
    rng: MockRng,
    count_time: Duration,
    reads: AtomicU64,
    trigger_type: TriggerType,
    errors: ErrorConfig,
    calls: CallCounts,
}

impl MockCounter {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let channel = Arc::new(AcquisitionChannel::scalar(name.clone(), name.clone()));
        Self {
            name,
            channel,
            base: 100.0,
            noise: 0.0,
            counting: false,
            rng: MockRng::new(Some(0)),
            count_time: Duration::ZERO,
            reads: AtomicU64::new(0),
            trigger_type: TriggerType::Software,
            errors: ErrorConfig::none(),
            calls: CallCounts::default(),
        }
    }

    /// Mean reading and uniform noise amplitude.
    pub fn with_signal(mut self, base: f64, noise: f64) -> Self {
        self.base = base;
        self.noise = noise;
        self
    }

    /// Spread readings like photon counts (sigma = sqrt(base)).
    pub fn with_counting_statistics(mut self) -> Self {
        self.counting = true;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = MockRng::new(Some(seed));
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.channel = Arc::new(
            AcquisitionChannel::scalar(self.name.clone(), self.name.clone()).with_unit(unit),
        );
        self
    }

    /// Integration time waited on every trigger before the read.
    pub fn with_count_time(mut self, count_time: Duration) -> Self {
        self.count_time = count_time;
        self
    }

    /// Hardware-triggered counters are never triggered by their master.
    pub fn with_trigger_type(mut self, trigger_type: TriggerType) -> Self {
        self.trigger_type = trigger_type;
        self
    }

    pub fn with_errors(mut self, errors: ErrorConfig) -> Self {
        self.errors = errors;
        self
    }

    pub fn channel(&self) -> &Arc<AcquisitionChannel> {
        &self.channel
    }

    /// Successful reads so far.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Acquire)
    }

    pub fn calls(&self) -> CallSnapshot {
        self.calls.snapshot()
    }
}

#[async_trait]
impl AcquisitionObject for MockCounter {
    fn name(&self) -> &str {
        &self.name
    }

    fn channels(&self) -> Vec<Arc<AcquisitionChannel>> {
        vec![self.channel.clone()]
    }

    fn options(&self) -> AcqOptions {
        AcqOptions {
            trigger_type: self.trigger_type,
            ..Default::default()
        }
    }

    async fn prepare(&self, _ctx: &AcqContext) -> Result<()> {
        self.calls.prepared();
        self.errors.apply(&self.name, "prepare").await
    }

    async fn start(&self, _ctx: &AcqContext) -> Result<()> {
        self.calls.started();
        self.errors.apply(&self.name, "start").await
    }

    async fn stop(&self) -> Result<()> {
        self.calls.stopped();
        self.errors.apply(&self.name, "stop").await
    }

    async fn trigger(&self, _ctx: &AcqContext) -> Result<()> {
        self.calls.triggered();
        if !self.count_time.is_zero() {
            tokio::time::sleep(self.count_time).await;
        }
        self.errors.apply(&self.name, "read").await?;
        let mean = if self.counting {
            self.rng.counts(self.base)
        } else {
            self.base
        };
        let value = mean + self.rng.jitter(self.noise);
        self.channel.emit_one(ChannelValue::Float(value)).await?;
        self.reads.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}
