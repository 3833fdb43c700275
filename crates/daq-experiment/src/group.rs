//! Groups: one-shot sequences over scans that already ran.

use std::sync::Arc;

use daq_core::{DaqError, DaqResult, DataStore, ScanInfo, ScanWriter, SequenceError};
use tracing::info;

use crate::context::{EngineContext, ScanRecord};
use crate::scan::Scan;
use crate::sequence::Sequence;

/// Something that can be grouped.
#[derive(Debug, Clone)]
pub enum GroupMember {
    /// A running or finished scan handle
    Scan(Scan),
    /// A scan number, resolved through the engine history
    Number(u64),
    /// An explicit history entry, possibly from another process
    Record(ScanRecord),
}

impl From<Scan> for GroupMember {
    fn from(scan: Scan) -> Self {
        GroupMember::Scan(scan)
    }
}

impl From<&Scan> for GroupMember {
    fn from(scan: &Scan) -> Self {
        GroupMember::Scan(scan.clone())
    }
}

impl From<u64> for GroupMember {
    fn from(scan_nb: u64) -> Self {
        GroupMember::Number(scan_nb)
    }
}

impl From<ScanRecord> for GroupMember {
    fn from(record: ScanRecord) -> Self {
        GroupMember::Record(record)
    }
}

enum Resolved {
    Live(Scan),
    Record(ScanRecord),
}

/// Builder for a group record.
pub struct Group {
    sequence: Sequence,
    title: String,
    context: Arc<EngineContext>,
}

impl Group {
    /// New group titled `title`.
    pub fn new(title: impl Into<String>, context: Arc<EngineContext>) -> Self {
        let title = title.into();
        Self {
            sequence: Sequence::new(title.clone(), context.clone()).scan_type("group"),
            title,
            context,
        }
    }

    /// Extra `scan_info` for the group record.
    pub fn scan_info(mut self, info: ScanInfo) -> Self {
        self.sequence = self.sequence.scan_info(info);
        self
    }

    /// Storage backend of the group record.
    pub fn store(mut self, store: Arc<dyn DataStore>) -> Self {
        self.sequence = self.sequence.store(store);
        self
    }

    /// Writer of the group record.
    pub fn writer(mut self, writer: Arc<dyn ScanWriter>) -> Self {
        self.sequence = self.sequence.writer(writer);
        self
    }

    fn resolve(&self, member: GroupMember) -> DaqResult<Resolved> {
        match member {
            GroupMember::Scan(scan) => {
                if !scan.has_started() {
                    return Err(SequenceError::NotStarted(scan.name().to_string()).into());
                }
                Ok(Resolved::Live(scan))
            }
            GroupMember::Number(scan_nb) => self
                .context
                .find_scan(scan_nb)
                .map(Resolved::Record)
                .ok_or(DaqError::UnknownScan(scan_nb)),
            GroupMember::Record(record) => Ok(Resolved::Record(record)),
        }
    }

    /// Publish `members` under a new group record and return its scan.
    ///
    /// Every member is validated before anything runs. The group's outcome
    /// is the worst member outcome.
    pub async fn run<I, M>(self, members: I) -> DaqResult<Scan>
    where
        I: IntoIterator<Item = M>,
        M: Into<GroupMember>,
    {
        let resolved = members
            .into_iter()
            .map(|m| self.resolve(m.into()))
            .collect::<DaqResult<Vec<_>>>()?;

        let count = resolved.len();
        let ctx = self.sequence.open().await?;
        let mut adding = Ok(());
        for member in &resolved {
            let added = match member {
                Resolved::Live(scan) => ctx.add(scan).await,
                Resolved::Record(record) => ctx.add_record(record),
            };
            if added.is_err() {
                adding = added;
                break;
            }
        }
        let exit = ctx.close().await;
        adding?;
        exit?;

        info!(group = %self.title, members = count, "group published");
        Ok(ctx.scan().clone())
    }
}
