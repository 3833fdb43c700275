//! Scan execution engine.
//!
//! - [`AcquisitionChain`]: trigger tree of acquisition objects
//! - [`Scan`]: one execution of a chain (PREPARE, START, STOP, finalization)
//! - [`DataWatchCallback`] / [`WatchdogCallback`] / [`ScanPreset`]: hooks
//! - [`Sequence`] / [`Group`]: several scans published under one record
//! - [`EngineContext`]: session state (scan numbers, history, positioners)
//!
//! # Example
//!
//! ```rust,ignore
//! let context = EngineContext::new(Settings::load(None)?);
//! let chain = Arc::new(AcquisitionChain::new());
//! chain.add(timer.clone(), diode.clone())?;
//!
//! let scan = Scan::new(chain, "timescan", context.clone());
//! scan.run().await?;
//! assert_eq!(scan.outcome(), Some(ScanOutcome::Done));
//! ```

pub mod chain;
pub mod context;
pub mod data_watch;
mod events;
pub mod group;
pub mod grouping;
pub mod iterator;
pub mod preset;
pub mod scan;
pub mod sequence;
pub mod watchdog;

pub use chain::AcquisitionChain;
pub use context::{EngineContext, ScanRecord};
pub use data_watch::{DataEvents, DataWatchCallback, EventQueue, NodeMap};
pub use group::{Group, GroupMember};
pub use grouping::{MemberRef, CUSTOM_CHANNELS, GROUPING_MASTER};
pub use iterator::ChainIterator;
pub use preset::ScanPreset;
pub use scan::{Scan, ScanBuilder, ScanStatus};
pub use sequence::{Sequence, SequenceContext};
pub use watchdog::{WatchdogCallback, WatchdogVerdict};
