//! `daq-core`
//!
//! Core trait definitions and types for the rust-daq acquisition chain engine.
//!
//! This crate defines the boundary between the scan engine and everything it
//! drives or feeds: hardware objects, storage nodes, file writers and
//! configuration. It has no runtime of its own.
//!
//! ## Key Types
//!
//! - [`AcquisitionObject`]: capability every chain node implements
//! - [`AcquisitionChannel`]: named, typed data emission point
//! - [`DataNode`] / [`DataStore`] / [`ScanWriter`]: storage collaborators
//! - [`ScanInfo`], [`ScanState`], [`ScanOutcome`]: the metadata wire contract
//! - [`DaqError`]: engine error taxonomy
//! - [`Settings`]: layered figment configuration

pub mod acquisition;
pub mod channel;
pub mod config;
pub mod error;
pub mod scan_info;
pub mod statistics;
pub mod storage;

pub use acquisition::{
    AcqCall, AcqContext, AcqOptions, AcquisitionObject, ObjectState, Positioner, SlaveHandle,
    Step, TriggerType,
};
pub use channel::{AcquisitionChannel, ChannelShape, ChannelValue, DataType, EventSink, Signal};
pub use config::Settings;
pub use error::{DaqError, DaqResult, SequenceError};
pub use scan_info::{keys, ScanInfo, ScanOutcome, ScanState};
pub use statistics::{CallStats, ScanStatistics};
pub use storage::{DataNode, DataStore, NodeEvent, NodeKind, ScanWriter};
