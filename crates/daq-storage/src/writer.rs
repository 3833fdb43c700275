//! Writer implementations.
//!
//! File formats are handled by external writers; the engine only drives a
//! writer's lifecycle. [`NullWriter`] is the default and [`MemoryWriter`]
//! keeps what it was given, which is handy for tooling and tests.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use daq_core::{DaqResult, ScanInfo, ScanWriter};
use parking_lot::Mutex;

/// Writer that writes nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullWriter;

#[async_trait]
impl ScanWriter for NullWriter {
    fn filename(&self) -> Option<String> {
        None
    }

    async fn close(&self) -> DaqResult<()> {
        Ok(())
    }
}

/// Writer that records every lifecycle call in memory.
#[derive(Debug, Default)]
pub struct MemoryWriter {
    filename: String,
    existing: Vec<u64>,
    prepared: Mutex<Vec<ScanInfo>>,
    finalized: Mutex<Vec<ScanInfo>>,
    closes: AtomicUsize,
}

impl MemoryWriter {
    /// Writer for `filename` with no previous entries.
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            ..Default::default()
        }
    }

    /// Pretend `entries` are already present in the file.
    pub fn with_entries(mut self, entries: Vec<u64>) -> Self {
        self.existing = entries;
        self
    }

    /// `scan_info` passed at prepare time, one per scan.
    pub fn prepared(&self) -> Vec<ScanInfo> {
        self.prepared.lock().clone()
    }

    /// Terminal `scan_info`, one per scan.
    pub fn finalized(&self) -> Vec<ScanInfo> {
        self.finalized.lock().clone()
    }

    /// Number of `close` calls.
    pub fn close_calls(&self) -> usize {
        self.closes.load(Ordering::Acquire)
    }
}

#[async_trait]
impl ScanWriter for MemoryWriter {
    fn filename(&self) -> Option<String> {
        Some(self.filename.clone())
    }

    async fn scan_entries(&self) -> DaqResult<Vec<u64>> {
        Ok(self.existing.clone())
    }

    async fn prepare(&self, info: &ScanInfo) -> DaqResult<()> {
        self.prepared.lock().push(info.clone());
        Ok(())
    }

    async fn finalize(&self, info: &ScanInfo) -> DaqResult<()> {
        self.finalized.lock().push(info.clone());
        Ok(())
    }

    async fn close(&self) -> DaqResult<()> {
        self.closes.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}
