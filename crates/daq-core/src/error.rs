//! Error types for the scan engine.
//!
//! `DaqError` is the single error type returned by every engine-level
//! operation (chain construction, `Scan::run`, sequence context exit).
//! Hardware-facing capability methods return `anyhow::Result` instead so
//! that drivers can wrap arbitrary protocol errors; the engine converts
//! those into [`DaqError::Hardware`] with the object name and call attached.
//!
//! ## Error Hierarchy
//!
//! - **Structural**: `InvalidChain`, `AlreadyRun`, `ScanNotStarted`,
//!   `ChannelBusy`, `ShapeMismatch`, `UnknownScan`. Programming errors,
//!   raised synchronously and never retried.
//! - **Hardware**: `Hardware`, `Killed`, `UserAborted`, `Watchdog`. Raised
//!   from inside a running scan; the scan outcome becomes KILLED or
//!   USER_ABORTED and finalization still runs.
//! - **Stop phase**: `StopFailed` aggregates every failed stop attempt.
//! - **Sequence publication**: `Sequence` wraps a [`SequenceError`].
//! - **Degraded observability**: `DataWatch`, `Storage`.

use thiserror::Error;

use crate::acquisition::AcqCall;

/// Convenience alias for results using the engine error type.
pub type DaqResult<T> = std::result::Result<T, DaqError>;

/// Primary error type for the acquisition engine.
#[derive(Error, Debug)]
pub enum DaqError {
    /// The acquisition chain is malformed.
    ///
    /// Raised by `AcquisitionChain::add` for cycles, duplicate names, a child
    /// that already has a different master, or any edit after the chain was
    /// frozen by a running scan.
    ///
    /// **Recovery Strategy**: None. Fix the code building the chain.
    #[error("Invalid acquisition chain: {0}")]
    InvalidChain(String),

    /// `run()` was called on a scan that already ran (or is running).
    ///
    /// Scan instances are single use; build a new one instead.
    #[error("Scan '{0}' state is not idle, scan objects can only be used once")]
    AlreadyRun(String),

    /// An operation required a scan that has been started.
    #[error("Scan '{0}' has not been started")]
    ScanNotStarted(String),

    /// A scan number could not be resolved through the engine history.
    #[error("No scan number {0} in the recent scan history")]
    UnknownScan(u64),

    /// A channel is already connected to another running scan.
    #[error("Channel '{0}' is already connected to a running scan")]
    ChannelBusy(String),

    /// Emitted data does not match the declared channel shape.
    #[error("Channel '{channel}' expects {expected} data, got {got}")]
    ShapeMismatch {
        /// Full channel name (`device:channel`)
        channel: String,
        /// Declared shape
        expected: String,
        /// Shape of the rejected sample
        got: String,
    },

    /// A hardware call failed inside a running scan.
    ///
    /// **Error Type**: Hardware dependent. The scan is marked KILLED,
    /// sibling tasks are cancelled and finalization runs.
    #[error("{object} failed during {call}: {source}")]
    Hardware {
        /// Acquisition object name
        object: String,
        /// Which capability call failed
        call: AcqCall,
        /// Underlying driver error
        #[source]
        source: anyhow::Error,
    },

    /// One or more stop calls (or preset stop hooks) failed.
    ///
    /// Every stop call is attempted before this is raised; the vector holds
    /// all collected failures in completion order.
    #[error("Stop failed with {} error(s): {}", .0.len(), summarize(.0))]
    StopFailed(Vec<DaqError>),

    /// The scan was killed by `Scan::kill`, by dropping the `run()` future,
    /// or by a failure elsewhere in the chain.
    #[error("Scan '{0}' was killed")]
    Killed(String),

    /// The scan was interrupted with `Scan::abort`.
    #[error("Scan '{0}' was aborted by the user")]
    UserAborted(String),

    /// The watchdog callback reported an error.
    #[error("Watchdog error: {0}")]
    Watchdog(#[source] anyhow::Error),

    /// Sequence or group publication failed.
    #[error(transparent)]
    Sequence(#[from] SequenceError),

    /// The data-watch callback failed. Degrades observability only.
    #[error("Data watch callback failed: {0}")]
    DataWatch(String),

    /// The storage backend rejected an operation.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration file parsing failed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration values parsed but failed validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// A background task panicked or was aborted unexpectedly.
    #[error("Task failure: {0}")]
    Task(String),
}

impl DaqError {
    /// Wrap a driver error with the object and call that produced it.
    pub fn hardware(object: impl Into<String>, call: AcqCall, source: anyhow::Error) -> Self {
        DaqError::Hardware {
            object: object.into(),
            call,
            source,
        }
    }

    /// True when this error reflects an external kill or user abort rather
    /// than a failure reported by hardware.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, DaqError::Killed(_) | DaqError::UserAborted(_))
    }
}

impl From<figment::Error> for DaqError {
    fn from(e: figment::Error) -> Self {
        DaqError::Config(Box::new(e))
    }
}

fn summarize(errors: &[DaqError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors raised when a sequence or group cannot guarantee that every
/// member scan was published.
#[derive(Error, Debug)]
pub enum SequenceError {
    /// The internal grouping scan did not reach START in time.
    #[error("Sequence '{title}' grouping scan did not start within {timeout_ms} ms")]
    StartTimeout {
        /// Sequence title
        title: String,
        /// Bounded wait that expired
        timeout_ms: u64,
    },

    /// Deferred member-add tasks did not complete in time.
    #[error("Some scans of sequence '{title}' have not been executed ({pending} pending)")]
    SubscanTimeout {
        /// Sequence title
        title: String,
        /// Number of member-add tasks still waiting
        pending: usize,
    },

    /// A member-add task failed.
    #[error("Member scan '{scan}' of sequence '{title}' could not be added: {reason}")]
    SubscanFailed {
        /// Sequence title
        title: String,
        /// Member scan name
        scan: String,
        /// Failure description
        reason: String,
    },

    /// Fewer members were published than were queued.
    #[error("Sequence '{title}' published {published} of {queued} member scans")]
    Unpublished {
        /// Sequence title
        title: String,
        /// Members pushed to the grouping queue
        queued: usize,
        /// Members emitted on the grouping channels
        published: usize,
    },

    /// The grouping scan itself failed or did not terminate in time.
    #[error("Grouping scan of sequence '{title}' failed: {reason}")]
    GroupScanFailed {
        /// Sequence title
        title: String,
        /// Failure description
        reason: String,
    },

    /// `add_and_run` was given a scan that was already started.
    #[error("Scan '{0}' was already started, add_and_run needs a fresh scan")]
    AlreadyStarted(String),

    /// A group member has never been run.
    #[error("Only scans that have been run before can be added to group ('{0}')")]
    NotStarted(String),
}
