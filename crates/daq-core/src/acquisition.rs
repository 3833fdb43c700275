//! Acquisition object capability
//!
//! Every node of an acquisition chain, master or leaf device, implements
//! [`AcquisitionObject`]. The engine only ever talks to hardware through this
//! trait, so drivers are free to wrap arbitrary protocols behind it.
//!
//! # Protocol
//!
//! For each top-level master the engine drives one iterator over the master's
//! subtree:
//!
//! 1. `prepare` on every node, leaves first
//! 2. `start` on every node, leaves first (masters trigger their slaves from
//!    inside `start` through [`AcqContext::trigger_slaves`])
//! 3. `wait_ready` + `next_step` on every node, master first. When the
//!    top-level master returns [`Step::Done`] the branch is exhausted;
//!    otherwise steps 1-3 repeat, skipping `prepare`/`start` for objects
//!    flagged `prepare_once`/`start_once`.
//! 4. `stop` on every node, master first
//!
//! A child returning `Step::Done` is rewound instead: children are driven by
//! their master's cadence and restart their own sequence when it runs out.
//!
//! # Design Philosophy
//!
//! Like the other capability traits in this crate the methods are async,
//! thread-safe and return `anyhow::Result`; the engine attaches the object
//! name and call when converting failures into `DaqError::Hardware`.
//!
//! # Example
//!
//! ```rust,ignore
//! struct Diode { counts: Arc<AcquisitionChannel> }
//!
//! #[async_trait]
//! impl AcquisitionObject for Diode {
//!     fn name(&self) -> &str { "diode" }
//!     fn channels(&self) -> Vec<Arc<AcquisitionChannel>> { vec![self.counts.clone()] }
//!     async fn prepare(&self, _ctx: &AcqContext) -> Result<()> { Ok(()) }
//!     async fn start(&self, _ctx: &AcqContext) -> Result<()> { Ok(()) }
//!     async fn stop(&self) -> Result<()> { Ok(()) }
//!     async fn trigger(&self, _ctx: &AcqContext) -> Result<()> {
//!         self.counts.emit_one(ChannelValue::Float(read_adc()?)).await?;
//!         Ok(())
//!     }
//! }
//! ```

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};

use crate::channel::{AcquisitionChannel, EventSink, Signal};
use crate::statistics::ScanStatistics;

/// Capability call identifiers, used in errors and statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcqCall {
    /// `AcquisitionObject::prepare`
    Prepare,
    /// `AcquisitionObject::start`
    Start,
    /// `AcquisitionObject::stop`
    Stop,
    /// `AcquisitionObject::trigger`
    Trigger,
    /// `AcquisitionObject::next_step`
    Step,
    /// `AcquisitionObject::rewind`
    Rewind,
    /// `AcquisitionObject::wait_ready`
    WaitReady,
    /// A scan preset hook
    Preset,
}

impl fmt::Display for AcqCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AcqCall::Prepare => "prepare",
            AcqCall::Start => "start",
            AcqCall::Stop => "stop",
            AcqCall::Trigger => "trigger",
            AcqCall::Step => "step",
            AcqCall::Rewind => "rewind",
            AcqCall::WaitReady => "wait_ready",
            AcqCall::Preset => "preset",
        };
        write!(f, "{}", label)
    }
}

/// How an object is triggered by its master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    /// The master calls `trigger()` through [`AcqContext::trigger_slaves`]
    #[default]
    Software,
    /// Triggered by external hardware lines; never software-triggered
    Hardware,
}

/// Per-object acquisition options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcqOptions {
    /// Only prepare on the first iteration
    pub prepare_once: bool,
    /// Only start on the first iteration
    pub start_once: bool,
    /// Expected number of points (0 when unknown)
    pub npoints: usize,
    /// Trigger mode
    pub trigger_type: TriggerType,
    /// For top-level masters: finishing this branch ends the START phase
    pub terminator: bool,
    /// Prepare all levels of this master's subtree concurrently
    pub parallel_prepare: bool,
}

impl Default for AcqOptions {
    fn default() -> Self {
        Self {
            prepare_once: false,
            start_once: false,
            npoints: 1,
            trigger_type: TriggerType::Software,
            terminator: true,
            parallel_prepare: false,
        }
    }
}

/// Result of advancing an object's own iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Another trigger step follows
    Next,
    /// The object's sequence is exhausted
    Done,
}

/// Coarse object state, queried before the first prepare.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ObjectState {
    /// Ready to acquire
    #[default]
    Ready,
    /// Busy with a previous operation
    Busy,
    /// Faulted; the chain cannot run
    Fault(String),
}

impl fmt::Display for ObjectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectState::Ready => write!(f, "READY"),
            ObjectState::Busy => write!(f, "BUSY"),
            ObjectState::Fault(reason) => write!(f, "FAULT ({})", reason),
        }
    }
}

/// Polymorphic hardware-facing unit driven by the scan engine.
#[async_trait]
pub trait AcquisitionObject: Send + Sync {
    /// Unique name inside a chain.
    fn name(&self) -> &str;

    /// Output channels. Must return the same channels for the object's life.
    fn channels(&self) -> Vec<Arc<AcquisitionChannel>>;

    /// Acquisition options.
    fn options(&self) -> AcqOptions {
        AcqOptions::default()
    }

    /// Current object state.
    fn state(&self) -> ObjectState {
        ObjectState::Ready
    }

    /// Arm the object for the next iteration step.
    async fn prepare(&self, ctx: &AcqContext) -> Result<()>;

    /// Start the iteration step. Masters trigger their slaves from here.
    async fn start(&self, ctx: &AcqContext) -> Result<()>;

    /// Stop acquiring. Called once at the end of every scan, even on failure.
    async fn stop(&self) -> Result<()>;

    /// Software trigger issued by the master.
    async fn trigger(&self, _ctx: &AcqContext) -> Result<()> {
        Ok(())
    }

    /// Advance to the next trigger step.
    async fn next_step(&self) -> Result<Step> {
        Ok(Step::Done)
    }

    /// Restart the object's own sequence (called on exhausted children).
    async fn rewind(&self) -> Result<()> {
        Ok(())
    }

    /// Wait until the previous step is complete.
    async fn wait_ready(&self) -> Result<()> {
        Ok(())
    }
}

impl fmt::Debug for dyn AcquisitionObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcquisitionObject")
            .field("name", &self.name())
            .finish()
    }
}

/// A software-triggerable child together with its own context.
#[derive(Clone)]
pub struct SlaveHandle {
    /// The child object
    pub object: Arc<dyn AcquisitionObject>,
    /// Context handed to the child's calls
    pub ctx: AcqContext,
}

/// Execution context passed to every capability call.
///
/// Gives masters access to their direct slaves and the current iteration
/// index of the branch.
#[derive(Clone, Default)]
pub struct AcqContext {
    iteration: Arc<AtomicUsize>,
    slaves: Vec<SlaveHandle>,
    sink: Option<Arc<dyn EventSink>>,
    stats: Option<Arc<ScanStatistics>>,
}

impl AcqContext {
    /// Context with no slaves, detached from any scan.
    pub fn detached() -> Self {
        Self::default()
    }

    /// Build a context sharing `iteration` with the rest of the branch.
    pub fn new(
        iteration: Arc<AtomicUsize>,
        slaves: Vec<SlaveHandle>,
        sink: Option<Arc<dyn EventSink>>,
        stats: Option<Arc<ScanStatistics>>,
    ) -> Self {
        Self {
            iteration,
            slaves,
            sink,
            stats,
        }
    }

    /// Zero-based index of the current iteration step.
    pub fn iteration(&self) -> usize {
        self.iteration.load(Ordering::Acquire)
    }

    /// Direct children of the object receiving this context.
    pub fn slaves(&self) -> &[SlaveHandle] {
        &self.slaves
    }

    /// Trigger every software-triggered slave concurrently and wait for all.
    ///
    /// Each triggered slave gets a `start` device signal. The first failing
    /// trigger fails the call; the others are dropped.
    pub async fn trigger_slaves(&self) -> Result<()> {
        let triggers = self
            .slaves
            .iter()
            .filter(|slave| slave.object.options().trigger_type == TriggerType::Software)
            .map(|slave| async move {
                let name = slave.object.name().to_string();
                if let Some(sink) = &self.sink {
                    sink.device_signal(&name, Signal::Start).await?;
                }
                let fut = slave.object.trigger(&slave.ctx);
                match &self.stats {
                    Some(stats) => stats.profile(&name, AcqCall::Trigger, fut).await,
                    None => fut.await,
                }
            });
        try_join_all(triggers).await?;
        Ok(())
    }
}

/// Axis whose position is snapshotted into `scan_info` at scan start.
#[async_trait]
pub trait Positioner: Send + Sync {
    /// Axis name.
    fn name(&self) -> &str;

    /// User position.
    async fn position(&self) -> Result<f64>;

    /// Dial (hardware) position.
    async fn dial_position(&self) -> Result<f64>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Leaf {
        name: String,
        trigger_type: TriggerType,
        hits: Mutex<usize>,
    }

    #[async_trait]
    impl AcquisitionObject for Leaf {
        fn name(&self) -> &str {
            &self.name
        }
        fn channels(&self) -> Vec<Arc<AcquisitionChannel>> {
            Vec::new()
        }
        fn options(&self) -> AcqOptions {
            AcqOptions {
                trigger_type: self.trigger_type,
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
        async fn trigger(&self, _ctx: &AcqContext) -> Result<()> {
            *self.hits.lock() += 1;
            Ok(())
        }
    }

    fn leaf(name: &str, trigger_type: TriggerType) -> Arc<Leaf> {
        Arc::new(Leaf {
            name: name.into(),
            trigger_type,
            hits: Mutex::new(0),
        })
    }

    #[tokio::test]
    async fn test_trigger_slaves_skips_hardware_triggered() {
        let soft = leaf("soft", TriggerType::Software);
        let hard = leaf("hard", TriggerType::Hardware);
        let stats = Arc::new(ScanStatistics::new());
        let ctx = AcqContext::new(
            Arc::new(AtomicUsize::new(0)),
            vec![
                SlaveHandle {
                    object: soft.clone(),
                    ctx: AcqContext::detached(),
                },
                SlaveHandle {
                    object: hard.clone(),
                    ctx: AcqContext::detached(),
                },
            ],
            None,
            Some(stats.clone()),
        );

        ctx.trigger_slaves().await.unwrap();
        ctx.trigger_slaves().await.unwrap();

        assert_eq!(*soft.hits.lock(), 2);
        assert_eq!(*hard.hits.lock(), 0);
        assert_eq!(stats.get("soft", AcqCall::Trigger).unwrap().count, 2);
    }

    #[test]
    fn test_default_options() {
        let options = AcqOptions::default();
        assert!(options.terminator);
        assert!(!options.prepare_once);
        assert_eq!(options.trigger_type, TriggerType::Software);
        assert_eq!(AcqCall::WaitReady.to_string(), "wait_ready");
    }
}
