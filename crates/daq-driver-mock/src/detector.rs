//! 1-D / 2-D detector.

use anyhow::Result;
use async_trait::async_trait;
use daq_core::{
    AcqContext, AcqOptions, AcquisitionChannel, AcquisitionObject, ChannelShape, ChannelValue,
    DataType,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::common::{CallCounts, CallSnapshot, ErrorConfig};
use crate::pattern;

/// Frame geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    /// MCA-like spectrum
    Spectrum { len: usize },
    /// Area detector image
    Image { width: usize, height: usize },
}

/// Detector publishing one synthetic frame per trigger on `<name>:<data>`.
///
/// The channel is named `spectrum` or `image` after the frame geometry.
/// Frames are read after `readout` and go through the `"read"`
/// error-injection label.
pub struct MockDetector {
    name: String,
    frame: Frame,
    readout: Duration,
    channel: Arc<AcquisitionChannel>,
    frames: AtomicU64,
    errors: ErrorConfig,
    calls: CallCounts,
}

impl MockDetector {
    pub fn new(name: impl Into<String>, frame: Frame) -> Self {
        let name = name.into();
        let (channel_name, shape) = match frame {
            Frame::Spectrum { .. } => ("spectrum", ChannelShape::Spectrum),
            Frame::Image { .. } => ("image", ChannelShape::Image),
        };
        let channel = Arc::new(AcquisitionChannel::new(
            name.clone(),
            channel_name,
            shape,
            DataType::Float64,
        ));
        Self {
            name,
            frame,
            readout: Duration::ZERO,
            channel,
            frames: AtomicU64::new(0),
            errors: ErrorConfig::none(),
            calls: CallCounts::default(),
        }
    }

    /// Spectrum detector with `len` channels.
    pub fn spectrum(name: impl Into<String>, len: usize) -> Self {
        Self::new(name, Frame::Spectrum { len })
    }

    /// Image detector.
    pub fn image(name: impl Into<String>, width: usize, height: usize) -> Self {
        Self::new(name, Frame::Image { width, height })
    }

    pub fn with_readout(mut self, readout: Duration) -> Self {
        self.readout = readout;
        self
    }

    pub fn with_errors(mut self, errors: ErrorConfig) -> Self {
        self.errors = errors;
        self
    }

    /// Frames published so far.
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Acquire)
    }

    pub fn calls(&self) -> CallSnapshot {
        self.calls.snapshot()
    }

    fn render(&self, frame_num: u64) -> ChannelValue {
        match self.frame {
            Frame::Spectrum { len } => ChannelValue::Spectrum(pattern::spectrum(len, frame_num)),
            Frame::Image { width, height } => ChannelValue::Image {
                width,
                height,
                data: pattern::image(width, height, frame_num),
            },
        }
    }
}

#[async_trait]
impl AcquisitionObject for MockDetector {
    fn name(&self) -> &str {
        &self.name
    }

    fn channels(&self) -> Vec<Arc<AcquisitionChannel>> {
        vec![self.channel.clone()]
    }

    fn options(&self) -> AcqOptions {
        AcqOptions::default()
    }

    async fn prepare(&self, ctx: &AcqContext) -> Result<()> {
        self.calls.prepared();
        if ctx.iteration() == 0 {
            self.frames.store(0, Ordering::Release);
        }
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
        if !self.readout.is_zero() {
            tokio::time::sleep(self.readout).await;
        }
        self.errors.apply(&self.name, "read").await?;
        let frame_num = self.frames.load(Ordering::Acquire);
        self.channel.emit_one(self.render(frame_num)).await?;
        self.frames.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}
