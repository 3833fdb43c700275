//! Session-scoped engine context.
//!
//! Holds what would otherwise be process globals: the scan counter per
//! target filename, the bounded history of recently completed scans and the
//! positioners snapshotted into every `scan_info`. One context lives for one
//! session; [`EngineContext::reset`] tears it down.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use daq_core::{DaqResult, Positioner, ScanInfo, ScanOutcome, ScanWriter, Settings};
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use tracing::{debug, warn};

/// Summary of a completed scan kept in the history ring.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanRecord {
    /// Scan name
    pub name: String,
    /// Scan number, when one was allocated
    pub scan_nb: Option<u64>,
    /// `db_name` of the scan's storage node, when one was created
    pub node: Option<String>,
    /// Terminal outcome
    pub outcome: ScanOutcome,
    /// Terminal `scan_info`
    pub info: ScanInfo,
}

/// Shared session state for scans and sequences.
pub struct EngineContext {
    settings: Settings,
    counters: Mutex<HashMap<String, u64>>,
    history: Mutex<VecDeque<ScanRecord>>,
    positioners: RwLock<Vec<Arc<dyn Positioner>>>,
}

impl EngineContext {
    /// New session context.
    pub fn new(settings: Settings) -> Arc<Self> {
        let capacity = settings.scan.history_size;
        Arc::new(Self {
            settings,
            counters: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::with_capacity(capacity)),
            positioners: RwLock::new(Vec::new()),
        })
    }

    /// Session settings.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Session name copied into `scan_info`.
    pub fn session_name(&self) -> &str {
        &self.settings.session.name
    }

    /// User name copied into `scan_info`.
    pub fn user_name(&self) -> &str {
        &self.settings.session.user
    }

    /// Allocate the next scan number for the writer's target file.
    ///
    /// The first time a filename is seen the counter is seeded from the
    /// highest scan number the writer reports as already present.
    pub async fn next_scan_number(&self, writer: &dyn ScanWriter) -> DaqResult<u64> {
        let key = writer
            .filename()
            .unwrap_or_else(|| self.settings.scan.default_filename.clone());

        let known = self.counters.lock().contains_key(&key);
        let seed = if known {
            0
        } else {
            writer.scan_entries().await?.into_iter().max().unwrap_or(0)
        };

        let mut counters = self.counters.lock();
        let counter = counters.entry(key.clone()).or_insert(seed);
        *counter += 1;
        debug!(filename = %key, scan_nb = *counter, "allocated scan number");
        Ok(*counter)
    }

    /// Register an axis whose position is recorded at every scan start.
    pub fn register_positioner(&self, positioner: Arc<dyn Positioner>) {
        self.positioners.write().push(positioner);
    }

    /// User and dial positions of every registered axis.
    ///
    /// An axis that fails to report is recorded as `null`.
    pub async fn snapshot_positions(&self) -> (Map<String, Value>, Map<String, Value>) {
        let positioners = self.positioners.read().clone();
        let mut user = Map::new();
        let mut dial = Map::new();
        for axis in positioners {
            let name = axis.name().to_string();
            let position = match axis.position().await {
                Ok(p) => Value::from(p),
                Err(e) => {
                    warn!(axis = %name, error = %e, "cannot read position");
                    Value::Null
                }
            };
            let dial_position = match axis.dial_position().await {
                Ok(p) => Value::from(p),
                Err(e) => {
                    warn!(axis = %name, error = %e, "cannot read dial position");
                    Value::Null
                }
            };
            user.insert(name.clone(), position);
            dial.insert(name, dial_position);
        }
        (user, dial)
    }

    pub(crate) fn push_history(&self, record: ScanRecord) {
        let capacity = self.settings.scan.history_size.max(1);
        let mut history = self.history.lock();
        while history.len() >= capacity {
            history.pop_front();
        }
        history.push_back(record);
    }

    /// Recent scans, oldest first.
    pub fn history(&self) -> Vec<ScanRecord> {
        self.history.lock().iter().cloned().collect()
    }

    /// Most recently completed scan.
    pub fn last_scan(&self) -> Option<ScanRecord> {
        self.history.lock().back().cloned()
    }

    /// Look a scan up by number in the history.
    pub fn find_scan(&self, scan_nb: u64) -> Option<ScanRecord> {
        self.history
            .lock()
            .iter()
            .rev()
            .find(|record| record.scan_nb == Some(scan_nb))
            .cloned()
    }

    /// End of session: forget counters, history and positioners.
    pub fn reset(&self) {
        self.counters.lock().clear();
        self.history.lock().clear();
        self.positioners.write().clear();
    }
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("session", &self.settings.session.name)
            .field("history", &self.history.lock().len())
            .finish()
    }
}
