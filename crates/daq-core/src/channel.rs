//! Acquisition channels: named, typed data emission points.
//!
//! A channel belongs to one acquisition object and is identified by
//! `"{device}:{channel}"`. Emitting on a channel is the only way samples enter
//! the engine: the running scan connects an [`EventSink`] to every channel of
//! its chain during PREPARE and disconnects it during finalization.
//!
//! Data emitted on a channel is append-only. Reference channels carry the
//! name of another storage node instead of inline data.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{DaqError, DaqResult};

/// Semantic dimensionality of one channel sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelShape {
    /// One number (or text) per point
    Scalar,
    /// 1-D array per point
    Spectrum,
    /// 2-D array per point
    Image,
}

impl fmt::Display for ChannelShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelShape::Scalar => write!(f, "scalar"),
            ChannelShape::Spectrum => write!(f, "spectrum"),
            ChannelShape::Image => write!(f, "image"),
        }
    }
}

/// Element type of channel samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// 64-bit float
    Float64,
    /// 64-bit signed integer
    Int64,
    /// UTF-8 text (node references use this)
    Text,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Float64 => write!(f, "float64"),
            DataType::Int64 => write!(f, "int64"),
            DataType::Text => write!(f, "text"),
        }
    }
}

/// One sample emitted on a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChannelValue {
    /// Scalar float
    Float(f64),
    /// Scalar integer
    Int(i64),
    /// Scalar text or node reference
    Text(String),
    /// 1-D float array
    Spectrum(Vec<f64>),
    /// 2-D float array, row-major
    Image {
        /// Columns
        width: usize,
        /// Rows
        height: usize,
        /// `width * height` values
        data: Vec<f64>,
    },
}

impl ChannelValue {
    /// Dimensionality of this sample.
    pub fn shape(&self) -> ChannelShape {
        match self {
            ChannelValue::Float(_) | ChannelValue::Int(_) | ChannelValue::Text(_) => {
                ChannelShape::Scalar
            }
            ChannelValue::Spectrum(_) => ChannelShape::Spectrum,
            ChannelValue::Image { .. } => ChannelShape::Image,
        }
    }

    /// Element type of this sample.
    pub fn dtype(&self) -> DataType {
        match self {
            ChannelValue::Int(_) => DataType::Int64,
            ChannelValue::Text(_) => DataType::Text,
            _ => DataType::Float64,
        }
    }

    /// Scalar value as `f64`, if numeric.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ChannelValue::Float(v) => Some(*v),
            ChannelValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Text payload, if any.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ChannelValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// Signals the engine tracks per object in the data-watch dirty set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    /// New samples were stored for a channel
    NewData,
    /// A device was started or triggered
    Start,
    /// A device finished its acquisition (delivered synchronously)
    End,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::NewData => write!(f, "new_data"),
            Signal::Start => write!(f, "start"),
            Signal::End => write!(f, "end"),
        }
    }
}

/// Receiver of channel data and device signals for one running scan.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Store freshly emitted samples and mark the channel dirty.
    async fn new_data(&self, channel: &AcquisitionChannel, data: Vec<ChannelValue>)
        -> DaqResult<()>;

    /// Record a device-level signal. `Signal::End` is delivered to the
    /// data-watch callback before this returns.
    async fn device_signal(&self, device: &str, signal: Signal) -> DaqResult<()>;
}

struct Connection {
    owner: String,
    sink: Arc<dyn EventSink>,
}

/// Named, typed data emission point of an acquisition object.
pub struct AcquisitionChannel {
    device: String,
    name: String,
    shape: ChannelShape,
    dtype: DataType,
    unit: Option<String>,
    reference: bool,
    connection: RwLock<Option<Connection>>,
    emitted: AtomicU64,
}

impl AcquisitionChannel {
    /// Create a channel owned by `device`.
    pub fn new(
        device: impl Into<String>,
        name: impl Into<String>,
        shape: ChannelShape,
        dtype: DataType,
    ) -> Self {
        Self {
            device: device.into(),
            name: name.into(),
            shape,
            dtype,
            unit: None,
            reference: false,
            connection: RwLock::new(None),
            emitted: AtomicU64::new(0),
        }
    }

    /// Scalar float channel, the common case for counters and axes.
    pub fn scalar(device: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(device, name, ChannelShape::Scalar, DataType::Float64)
    }

    /// Reference channel: samples are storage node names.
    pub fn reference(device: impl Into<String>, name: impl Into<String>) -> Self {
        let mut channel = Self::new(device, name, ChannelShape::Scalar, DataType::Text);
        channel.reference = true;
        channel
    }

    /// Attach an engineering unit.
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// Owning object name.
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Short channel name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `"{device}:{channel}"`.
    pub fn fullname(&self) -> String {
        format!("{}:{}", self.device, self.name)
    }

    /// Sample dimensionality.
    pub fn shape(&self) -> ChannelShape {
        self.shape
    }

    /// Sample element type.
    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    /// Engineering unit, if any.
    pub fn unit(&self) -> Option<&str> {
        self.unit.as_deref()
    }

    /// True for channels that point at other nodes.
    pub fn is_reference(&self) -> bool {
        self.reference
    }

    /// Number of samples accepted by a connected sink since creation.
    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    /// Whether a scan is currently listening on this channel.
    pub fn is_connected(&self) -> bool {
        self.connection.read().is_some()
    }

    /// Route emissions to `sink` on behalf of the scan named `owner`.
    pub fn connect(&self, owner: &str, sink: Arc<dyn EventSink>) -> DaqResult<()> {
        let mut slot = self.connection.write();
        if let Some(existing) = slot.as_ref() {
            if existing.owner != owner {
                return Err(DaqError::ChannelBusy(self.fullname()));
            }
        }
        *slot = Some(Connection {
            owner: owner.to_string(),
            sink,
        });
        Ok(())
    }

    /// Stop routing emissions. Later emissions are dropped.
    pub fn disconnect(&self) {
        self.connection.write().take();
    }

    fn validate(&self, value: &ChannelValue) -> DaqResult<()> {
        if value.shape() != self.shape || value.dtype() != self.dtype {
            return Err(DaqError::ShapeMismatch {
                channel: self.fullname(),
                expected: format!("{} {}", self.shape, self.dtype),
                got: format!("{} {}", value.shape(), value.dtype()),
            });
        }
        if let ChannelValue::Image {
            width,
            height,
            data,
        } = value
        {
            if width.checked_mul(*height) != Some(data.len()) {
                return Err(DaqError::ShapeMismatch {
                    channel: self.fullname(),
                    expected: format!("{}x{} image", width, height),
                    got: format!("{} values", data.len()),
                });
            }
        }
        Ok(())
    }

    /// Emit a batch of samples.
    pub async fn emit(&self, data: Vec<ChannelValue>) -> DaqResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        for value in &data {
            self.validate(value)?;
        }
        let sink = self.connection.read().as_ref().map(|c| c.sink.clone());
        match sink {
            Some(sink) => {
                let count = data.len() as u64;
                sink.new_data(self, data).await?;
                self.emitted.fetch_add(count, Ordering::Relaxed);
                Ok(())
            }
            None => {
                trace!(channel = %self.fullname(), "emission on disconnected channel dropped");
                Ok(())
            }
        }
    }

    /// Emit a single sample.
    pub async fn emit_one(&self, value: ChannelValue) -> DaqResult<()> {
        self.emit(vec![value]).await
    }
}

impl fmt::Debug for AcquisitionChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcquisitionChannel")
            .field("fullname", &self.fullname())
            .field("shape", &self.shape)
            .field("dtype", &self.dtype)
            .field("reference", &self.reference)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        samples: Mutex<Vec<(String, ChannelValue)>>,
    }

    #[async_trait]
    impl EventSink for Recorder {
        async fn new_data(
            &self,
            channel: &AcquisitionChannel,
            data: Vec<ChannelValue>,
        ) -> DaqResult<()> {
            let mut samples = self.samples.lock();
            for value in data {
                samples.push((channel.fullname(), value));
            }
            Ok(())
        }

        async fn device_signal(&self, _device: &str, _signal: Signal) -> DaqResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_emit_routes_to_connected_sink() {
        let channel = AcquisitionChannel::scalar("diode", "counts");
        let recorder = Arc::new(Recorder::default());
        channel.connect("scan_1", recorder.clone()).unwrap();

        channel.emit_one(ChannelValue::Float(1.5)).await.unwrap();
        channel
            .emit(vec![ChannelValue::Float(2.0), ChannelValue::Float(3.0)])
            .await
            .unwrap();

        let samples = recorder.samples.lock();
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0].0, "diode:counts");
        assert_eq!(channel.emitted(), 3);
    }

    #[tokio::test]
    async fn test_emit_after_disconnect_is_dropped() {
        let channel = AcquisitionChannel::scalar("diode", "counts");
        let recorder = Arc::new(Recorder::default());
        channel.connect("scan_1", recorder.clone()).unwrap();
        channel.disconnect();

        channel.emit_one(ChannelValue::Float(1.0)).await.unwrap();
        assert!(recorder.samples.lock().is_empty());
        assert_eq!(channel.emitted(), 0);
    }

    #[tokio::test]
    async fn test_shape_mismatch_rejected() {
        let channel = AcquisitionChannel::scalar("diode", "counts");
        let err = channel
            .emit_one(ChannelValue::Spectrum(vec![1.0, 2.0]))
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::ShapeMismatch { .. }));

        let image = AcquisitionChannel::new("cam", "image", ChannelShape::Image, DataType::Float64);
        let err = image
            .emit_one(ChannelValue::Image {
                width: 2,
                height: 2,
                data: vec![0.0; 3],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::ShapeMismatch { .. }));

        let err = image
            .emit_one(ChannelValue::Image {
                width: usize::MAX,
                height: 2,
                data: vec![0.0; 2],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_channel_busy_for_other_scan() {
        let channel = AcquisitionChannel::reference("group", "scans");
        assert!(channel.is_reference());
        channel
            .connect("scan_1", Arc::new(Recorder::default()))
            .unwrap();
        let err = channel
            .connect("scan_2", Arc::new(Recorder::default()))
            .unwrap_err();
        assert!(matches!(err, DaqError::ChannelBusy(name) if name == "group:scans"));
    }
}
