//! Capability call counters.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Counts the capability calls an object received.
#[derive(Debug, Default)]
pub struct CallCounts {
    prepare: AtomicUsize,
    start: AtomicUsize,
    stop: AtomicUsize,
    trigger: AtomicUsize,
}

/// Point-in-time copy of [`CallCounts`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CallSnapshot {
    pub prepare: usize,
    pub start: usize,
    pub stop: usize,
    pub trigger: usize,
}

impl CallCounts {
    pub(crate) fn prepared(&self) {
        self.prepare.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn started(&self) {
        self.start.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn stopped(&self) {
        self.stop.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn triggered(&self) {
        self.trigger.fetch_add(1, Ordering::AcqRel);
    }

    pub fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            prepare: self.prepare.load(Ordering::Acquire),
            start: self.start.load(Ordering::Acquire),
            stop: self.stop.load(Ordering::Acquire),
            trigger: self.trigger.load(Ordering::Acquire),
        }
    }
}
