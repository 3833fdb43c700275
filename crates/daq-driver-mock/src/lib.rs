//! Mock acquisition objects for rust-daq
//!
//! Simulated hardware for running the scan engine without a beamline.
//! All waits use `tokio::time::sleep`, so tests can run them on a paused
//! clock.
//!
//! # Available Mock Objects
//!
//! - [`MockAxis`] - motor axis implementing [`daq_core::Positioner`]
//! - [`StepMaster`] - master stepping an axis through a list of positions
//! - [`TimerMaster`] - master counting for a fixed time per point
//! - [`MockCounter`] - software-triggered scalar counter
//! - [`MockDetector`] - 1-D spectrum or 2-D image detector
//!
//! Every object accepts an [`ErrorConfig`] to inject failures or delays per
//! operation, and counts the capability calls it received.
//!
//! ```rust,ignore
//! let timer = Arc::new(TimerMaster::new("timer", Duration::from_millis(10), 5));
//! let diode = Arc::new(MockCounter::new("diode").with_errors(ErrorConfig::scenario(
//!     ErrorScenario::FailAfterN { operation: "read", count: 2 },
//! )));
//! chain.add(timer, diode)?;
//! ```

pub mod axis;
pub mod common;
pub mod config;
pub mod counter;
pub mod detector;
mod pattern;
pub mod step_master;
pub mod timer;

pub use axis::{AxisLimits, LimitBehavior, MockAxis};
pub use common::{CallSnapshot, ErrorConfig, ErrorScenario, MockFault, MockRng};
pub use config::{HardwareConfig, MockHardware};
pub use counter::MockCounter;
pub use detector::{Frame, MockDetector};
pub use step_master::{linspace, StepMaster};
pub use timer::TimerMaster;
