//! Per-call timing statistics for a scan.
//!
//! Every capability call the engine issues (`prepare`, `start`, `stop`,
//! `trigger`, ...) is timed and folded into a [`CallStats`] entry keyed by
//! `"{device}.{call}"`. The table is dumped at debug level when a scan
//! finalizes and is available on the scan handle afterwards.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use crate::acquisition::AcqCall;

/// Aggregated timings for one `device.call` key.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CallStats {
    /// Number of calls
    pub count: u64,
    /// Sum of call durations
    pub total: Duration,
    /// Fastest call
    pub min: Duration,
    /// Slowest call
    pub max: Duration,
}

impl CallStats {
    fn first(elapsed: Duration) -> Self {
        Self {
            count: 1,
            total: elapsed,
            min: elapsed,
            max: elapsed,
        }
    }

    fn add(&mut self, elapsed: Duration) {
        self.count += 1;
        self.total += elapsed;
        self.min = self.min.min(elapsed);
        self.max = self.max.max(elapsed);
    }

    /// Mean call duration.
    pub fn mean(&self) -> Duration {
        if self.count == 0 {
            return Duration::ZERO;
        }
        self.total / self.count as u32
    }
}

/// Thread-safe table of call statistics.
#[derive(Debug, Default)]
pub struct ScanStatistics {
    calls: Mutex<BTreeMap<String, CallStats>>,
}

impl ScanStatistics {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one call duration.
    pub fn record(&self, device: &str, call: AcqCall, elapsed: Duration) {
        let key = format!("{}.{}", device, call);
        let mut calls = self.calls.lock();
        match calls.get_mut(&key) {
            Some(stats) => stats.add(elapsed),
            None => {
                calls.insert(key, CallStats::first(elapsed));
            }
        }
    }

    /// Await `fut` and record how long it took, whatever its result.
    pub async fn profile<F, T>(&self, device: &str, call: AcqCall, fut: F) -> T
    where
        F: Future<Output = T>,
    {
        let started = Instant::now();
        let out = fut.await;
        self.record(device, call, started.elapsed());
        out
    }

    /// Statistics for one key, if recorded.
    pub fn get(&self, device: &str, call: AcqCall) -> Option<CallStats> {
        self.calls.lock().get(&format!("{}.{}", device, call)).copied()
    }

    /// Copy of the whole table.
    pub fn snapshot(&self) -> BTreeMap<String, CallStats> {
        self.calls.lock().clone()
    }
}
