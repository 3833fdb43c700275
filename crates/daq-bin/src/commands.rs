//! Demo scans and sequences against mock hardware.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use daq_core::{keys, DaqError, ScanInfo, ScanOutcome, Signal};
use daq_driver_mock::{linspace, HardwareConfig, MockHardware, StepMaster, TimerMaster};
use daq_experiment::{
    AcquisitionChain, DataEvents, DataWatchCallback, EngineContext, NodeMap, Scan, Sequence,
};
use tracing::{info, warn};

/// Parameters of one step scan.
#[derive(Debug, Clone)]
pub struct ScanArgs {
    pub motor: String,
    pub start: f64,
    pub stop: f64,
    pub points: usize,
    pub count_time: Duration,
}

/// What a finished scan produced.
#[derive(Debug, Clone)]
pub struct ScanSummary {
    pub name: String,
    pub scan_nb: Option<u64>,
    pub outcome: Option<ScanOutcome>,
    /// `(channel, number of samples, last value)`
    pub channels: Vec<(String, usize, String)>,
}

impl std::fmt::Display for ScanSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let nb = self.scan_nb.map_or("-".to_string(), |n| n.to_string());
        let outcome = self
            .outcome
            .map_or("UNKNOWN".to_string(), |o| o.to_string());
        writeln!(f, "scan #{} {}: {}", nb, self.name, outcome)?;
        for (channel, count, last) in &self.channels {
            writeln!(f, "  {:<24} {:>6} points  last={}", channel, count, last)?;
        }
        Ok(())
    }
}

/// Logs point progress of the running scan.
#[derive(Default)]
struct Progress {
    points: AtomicUsize,
}

#[async_trait]
impl DataWatchCallback for Progress {
    async fn on_scan_new(&self, info: &ScanInfo) -> Result<()> {
        info!(
            scan = info.get_str(keys::TITLE).unwrap_or_default(),
            npoints = info.get(keys::NPOINTS).and_then(|v| v.as_u64()).unwrap_or(0),
            "scan started"
        );
        Ok(())
    }

    async fn on_scan_data(&self, events: &DataEvents, _nodes: &NodeMap, _info: &ScanInfo) -> Result<()> {
        let starts = events
            .values()
            .filter(|signals| signals.contains(&Signal::Start))
            .count();
        if starts > 0 {
            let points = self.points.fetch_add(1, Ordering::AcqRel) + 1;
            tracing::debug!(points, "acquiring");
        }
        Ok(())
    }

    async fn on_scan_end(&self, info: &ScanInfo) -> Result<()> {
        info!(
            state = info.state().unwrap_or_default(),
            "scan ended"
        );
        Ok(())
    }
}

fn build_chain(hardware: &MockHardware, args: &ScanArgs) -> Result<Arc<AcquisitionChain>> {
    let axis = hardware.axis(&args.motor)?;
    let intervals = args.points.saturating_sub(1);
    let master = Arc::new(StepMaster::new(
        "axis",
        axis,
        linspace(args.start, args.stop, intervals),
    ));
    let chain = Arc::new(AcquisitionChain::new());
    chain.add_master(master.clone())?;
    for counter in &hardware.counters {
        chain.add(master.clone(), counter.clone())?;
    }
    for detector in &hardware.detectors {
        chain.add(master.clone(), detector.clone())?;
    }
    Ok(chain)
}

/// Run `scan` until done; Ctrl-C turns into a user abort.
async fn run_interruptible(scan: &Scan) -> Result<(), DaqError> {
    let run = scan.run();
    tokio::pin!(run);
    tokio::select! {
        result = &mut run => result,
        _ = tokio::signal::ctrl_c() => {
            warn!(scan = %scan.name(), "interrupted, aborting scan");
            scan.abort();
            run.await
        }
    }
}

async fn summarize(scan: &Scan) -> Result<ScanSummary> {
    let mut channels = Vec::new();
    for channel in scan.chain().channels() {
        let fullname = channel.fullname();
        let data = scan.channel_data(&fullname).await?;
        let last = data
            .last()
            .map(|v| match (v.as_f64(), v.as_text()) {
                (Some(x), _) => format!("{:.4}", x),
                (None, Some(text)) => text.to_string(),
                (None, None) => format!("<{}>", v.shape()),
            })
            .unwrap_or_else(|| "-".to_string());
        channels.push((fullname, data.len(), last));
    }
    Ok(ScanSummary {
        name: scan.name().to_string(),
        scan_nb: scan.scan_number(),
        outcome: scan.outcome(),
        channels,
    })
}

fn prepare_hardware(config: &HardwareConfig, count_time: Duration) -> MockHardware {
    let mut config = config.clone();
    config.set_count_time(count_time);
    config.build()
}

/// One step scan over `args.motor` with every counter and detector.
pub async fn run_scan(
    context: Arc<EngineContext>,
    hardware: &HardwareConfig,
    args: &ScanArgs,
) -> Result<ScanSummary> {
    let hw = prepare_hardware(hardware, args.count_time);
    for axis in &hw.axes {
        context.register_positioner(axis.clone());
    }
    let chain = build_chain(&hw, args)?;
    let scan = Scan::builder(chain, context)
        .name("ascan")
        .data_watch(Arc::new(Progress::default()))
        .build();

    let result = run_interruptible(&scan).await;
    let summary = summarize(&scan).await?;
    match result {
        Ok(()) => Ok(summary),
        Err(DaqError::UserAborted(_)) => {
            warn!(scan = %summary.name, "scan aborted by user");
            Ok(summary)
        }
        Err(e) => Err(e).with_context(|| format!("scan '{}' failed", summary.name)),
    }
}

/// A sequence of `scans` time scans published under one record.
pub async fn run_sequence(
    context: Arc<EngineContext>,
    hardware: &HardwareConfig,
    scans: usize,
    points: usize,
    count_time: Duration,
) -> Result<(ScanSummary, Vec<ScanSummary>)> {
    let sequence = Sequence::new("sequence", context.clone()).open().await?;
    let mut members = Vec::with_capacity(scans);
    let mut failure = None;

    for i in 0..scans {
        let hw = prepare_hardware(hardware, count_time);
        let timer = Arc::new(TimerMaster::new("timer", count_time, points));
        let chain = Arc::new(AcquisitionChain::new());
        chain.add_master(timer.clone())?;
        for counter in &hw.counters {
            chain.add(timer.clone(), counter.clone())?;
        }
        let scan = Scan::new(chain, format!("timescan{}", i + 1), context.clone());
        let result = sequence.add_and_run(&scan).await;
        members.push(summarize(&scan).await?);
        if let Err(e) = result {
            failure = Some(e);
            break;
        }
    }

    let closed = sequence.close().await;
    if let Some(e) = failure {
        return Err(e).context("sequence member failed");
    }
    closed.context("sequence did not publish every member")?;

    let group = sequence.scan();
    group.wait_finished().await;
    let numbers = sequence.published_scan_numbers().await?;
    info!(members = ?numbers, "sequence published");
    Ok((summarize(group).await?, members))
}

#[cfg(test)]
mod tests {
    use super::*;
    use daq_core::Settings;

    fn quick() -> ScanArgs {
        ScanArgs {
            motor: "sy".into(),
            start: 0.0,
            stop: 1.0,
            points: 3,
            count_time: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn test_demo_scan() {
        let context = EngineContext::new(Settings::default());
        let summary = run_scan(context.clone(), &HardwareConfig::demo(), &quick())
            .await
            .unwrap();
        assert_eq!(summary.outcome, Some(ScanOutcome::Done));
        assert_eq!(summary.scan_nb, Some(1));
        let (_, count, last) = summary
            .channels
            .iter()
            .find(|(name, _, _)| name == "axis:sy")
            .unwrap();
        assert_eq!((*count, last.as_str()), (3, "1.0000"));
        assert!(summary.to_string().contains("DONE"));
    }

    #[tokio::test]
    async fn test_unknown_motor() {
        let context = EngineContext::new(Settings::default());
        let mut args = quick();
        args.motor = "nope".into();
        assert!(run_scan(context, &HardwareConfig::demo(), &args).await.is_err());
    }

    #[tokio::test]
    async fn test_demo_sequence() {
        let context = EngineContext::new(Settings::default());
        let (group, members) = run_sequence(context, &HardwareConfig::demo(), 2, 2, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(members.len(), 2);
        assert!(members.iter().all(|m| m.outcome == Some(ScanOutcome::Done)));
        assert_eq!(group.outcome, Some(ScanOutcome::Done));
    }
}
