//! Scan metadata record and lifecycle enums.
//!
//! `scan_info` is the wire contract between the engine and every downstream
//! consumer (data-watch callbacks, writers, sequence aggregation). It is a
//! plain nested JSON mapping; the key names in [`keys`] are stable.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Stable `scan_info` key names.
pub mod keys {
    /// Channel grouping per top-level master
    pub const ACQUISITION_CHAIN: &str = "acquisition_chain";
    /// Human-readable local start time
    pub const START_TIME: &str = "start_time";
    /// Start time as seconds since the Unix epoch
    pub const START_TIMESTAMP: &str = "start_timestamp";
    /// Human-readable local end time
    pub const END_TIME: &str = "end_time";
    /// End time as seconds since the Unix epoch
    pub const END_TIMESTAMP: &str = "end_timestamp";
    /// User positions snapshotted at scan start
    pub const POSITIONERS: &str = "positioners";
    /// Dial positions snapshotted at scan start
    pub const POSITIONERS_DIAL: &str = "positioners_dial";
    /// Scan number
    pub const SCAN_NB: &str = "scan_nb";
    /// Session name
    pub const SESSION_NAME: &str = "session_name";
    /// User name
    pub const USER_NAME: &str = "user_name";
    /// Current state or terminal outcome
    pub const STATE: &str = "state";
    /// Scan title
    pub const TITLE: &str = "title";
    /// Scan type (e.g. `loopscan`, `sequence`)
    pub const TYPE: &str = "type";
    /// Expected number of points
    pub const NPOINTS: &str = "npoints";
    /// Target filename of the writer
    pub const FILENAME: &str = "filename";
    /// Storage node name of the scan record
    pub const NODE_NAME: &str = "node_name";
    /// Whether this scan is a sequence / group
    pub const IS_SCAN_SEQUENCE: &str = "is_scan_sequence";
}

/// Position of a scan in its lifecycle.
///
/// Ordered: a waiter for `Starting` is released by any later state too.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScanState {
    /// Not started, or finished (see the finished flag)
    Idle = 0,
    /// PREPARE phase
    Preparing = 1,
    /// START phase
    Starting = 2,
    /// STOP phase
    Stopping = 3,
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanState::Idle => write!(f, "IDLE"),
            ScanState::Preparing => write!(f, "PREPARING"),
            ScanState::Starting => write!(f, "STARTING"),
            ScanState::Stopping => write!(f, "STOPPING"),
        }
    }
}

/// Terminal outcome of a scan, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScanOutcome {
    /// Ran to completion
    Done = 0,
    /// Interrupted by the user
    UserAborted = 1,
    /// Killed by an error or an external kill
    Killed = 2,
}

impl fmt::Display for ScanOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanOutcome::Done => write!(f, "DONE"),
            ScanOutcome::UserAborted => write!(f, "USER_ABORTED"),
            ScanOutcome::Killed => write!(f, "KILLED"),
        }
    }
}

impl FromStr for ScanOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DONE" => Ok(ScanOutcome::Done),
            "USER_ABORTED" => Ok(ScanOutcome::UserAborted),
            "KILLED" => Ok(ScanOutcome::Killed),
            other => Err(format!("'{}' is not a terminal scan state", other)),
        }
    }
}

/// Mutable scan metadata mapping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScanInfo(Map<String, Value>);

impl ScanInfo {
    /// Empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key` to `value`.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Value for `key`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Text value for `key`.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Copy every entry of `other` into this record, overwriting.
    pub fn merge(&mut self, other: &ScanInfo) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }

    /// Set the `state` entry.
    pub fn set_state(&mut self, state: impl fmt::Display) {
        self.insert(keys::STATE, state.to_string());
    }

    /// `state` entry.
    pub fn state(&self) -> Option<&str> {
        self.get_str(keys::STATE)
    }

    /// Terminal outcome, when `state` holds one.
    pub fn outcome(&self) -> Option<ScanOutcome> {
        self.state().and_then(|s| s.parse().ok())
    }

    /// `scan_nb` entry.
    pub fn scan_nb(&self) -> Option<u64> {
        self.get(keys::SCAN_NB).and_then(Value::as_u64)
    }

    /// Underlying map.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Owned JSON value.
    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }
}

impl From<Map<String, Value>> for ScanInfo {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_outcome_severity_order() {
        assert!(ScanOutcome::Killed > ScanOutcome::UserAborted);
        assert!(ScanOutcome::UserAborted > ScanOutcome::Done);
        let worst = [ScanOutcome::Done, ScanOutcome::Killed, ScanOutcome::Done]
            .into_iter()
            .max();
        assert_eq!(worst, Some(ScanOutcome::Killed));
    }

    #[test]
    fn test_state_roundtrip_through_info() {
        let mut info = ScanInfo::new().with(keys::SCAN_NB, 12u64);
        info.set_state(ScanState::Starting);
        assert_eq!(info.state(), Some("STARTING"));
        assert_eq!(info.outcome(), None);

        info.set_state(ScanOutcome::UserAborted);
        assert_eq!(info.outcome(), Some(ScanOutcome::UserAborted));
        assert_eq!(info.scan_nb(), Some(12));
    }

    #[test]
    fn test_merge_overwrites() {
        let mut info = ScanInfo::new().with(keys::TITLE, "a");
        info.merge(&ScanInfo::new().with(keys::TITLE, "b").with("extra", json!([1])));
        assert_eq!(info.get_str(keys::TITLE), Some("b"));
        assert_eq!(info.get("extra"), Some(&json!([1])));
    }
}
