//! Scan presets: user hooks around the scan phases.

use async_trait::async_trait;

use crate::scan::Scan;

/// Hooks run by the scan engine at phase boundaries.
///
/// `prepare` and `start` run at the beginning of the matching phase; an
/// error there fails the scan like a hardware error. `stop` runs during
/// finalization, before the terminal state is published, and its errors are
/// collected with the stop-phase errors.
#[async_trait]
pub trait ScanPreset: Send + Sync {
    /// Beginning of PREPARE.
    async fn prepare(&self, _scan: &Scan) -> anyhow::Result<()> {
        Ok(())
    }

    /// Beginning of START.
    async fn start(&self, _scan: &Scan) -> anyhow::Result<()> {
        Ok(())
    }

    /// End of the scan, whatever its outcome.
    async fn stop(&self, _scan: &Scan) -> anyhow::Result<()> {
        Ok(())
    }
}
