//! Storage backends for the rust-daq scan engine.
//!
//! - [`MemoryStore`] / [`MemoryNode`]: process-local node store with
//!   time-to-live bookkeeping
//! - [`NullWriter`] / [`MemoryWriter`]: writer collaborators

pub mod memory;
pub mod writer;

pub use memory::{MemoryNode, MemoryStore};
pub use writer::{MemoryWriter, NullWriter};
