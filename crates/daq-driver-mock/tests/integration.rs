//! Mock objects driven the way the scan engine drives them.

use daq_core::{
    AcqContext, AcquisitionChannel, AcquisitionObject, ChannelValue, DaqResult, EventSink,
    Positioner, Signal, SlaveHandle, Step,
};
use daq_driver_mock::*;
use parking_lot::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct Recorder {
    data: Mutex<Vec<(String, ChannelValue)>>,
    signals: Mutex<Vec<(String, Signal)>>,
}

#[async_trait::async_trait]
impl EventSink for Recorder {
    async fn new_data(&self, channel: &AcquisitionChannel, data: Vec<ChannelValue>) -> DaqResult<()> {
        let mut stored = self.data.lock();
        stored.extend(data.into_iter().map(|v| (channel.fullname(), v)));
        Ok(())
    }

    async fn device_signal(&self, device: &str, signal: Signal) -> DaqResult<()> {
        self.signals.lock().push((device.to_string(), signal));
        Ok(())
    }
}

fn connect(object: &dyn AcquisitionObject, sink: &Arc<Recorder>) {
    for channel in object.channels() {
        channel.connect("test", sink.clone()).unwrap();
    }
}

/// A step master triggering two counters publishes one value per counter per point.
#[tokio::test]
async fn test_step_master_triggers_slaves() {
    let sink = Arc::new(Recorder::default());
    let axis = Arc::new(MockAxis::new("sy"));
    let master = StepMaster::new("ascan", axis.clone(), linspace(0.0, 1.0, 2));
    let diode = Arc::new(MockCounter::new("diode"));
    let mca = Arc::new(MockDetector::spectrum("mca", 8));
    connect(&master, &sink);
    connect(diode.as_ref(), &sink);
    connect(mca.as_ref(), &sink);

    let iteration = Arc::new(AtomicUsize::new(0));
    let slave_ctx = AcqContext::new(iteration.clone(), vec![], None, None);
    let ctx = AcqContext::new(
        iteration,
        vec![
            SlaveHandle {
                object: diode.clone(),
                ctx: slave_ctx.clone(),
            },
            SlaveHandle {
                object: mca.clone(),
                ctx: slave_ctx,
            },
        ],
        Some(sink.clone() as Arc<dyn EventSink>),
        None,
    );

    master.prepare(&ctx).await.unwrap();
    let mut points = 0;
    loop {
        master.start(&ctx).await.unwrap();
        points += 1;
        if master.next_step().await.unwrap() == Step::Done {
            break;
        }
    }

    assert_eq!(points, 3);
    assert_eq!(axis.position().await.unwrap(), 1.0);
    assert_eq!(diode.reads(), 3);
    assert_eq!(mca.frames(), 3);

    let data = sink.data.lock();
    let positions: Vec<f64> = data
        .iter()
        .filter(|(name, _)| name == "ascan:sy")
        .filter_map(|(_, v)| v.as_f64())
        .collect();
    assert_eq!(positions, vec![0.0, 0.5, 1.0]);
    assert_eq!(
        sink.signals
            .lock()
            .iter()
            .filter(|(d, s)| d == "diode" && *s == Signal::Start)
            .count(),
        3
    );
}

/// Stop delays and failures are injectable independently.
#[tokio::test(start_paused = true)]
async fn test_slow_failing_stop() {
    let counter = MockCounter::new("diode").with_errors(ErrorConfig::scenarios(vec![
        ErrorScenario::Delay {
            operation: "stop",
            delay: Duration::from_secs(1),
        },
        ErrorScenario::Timeout { operation: "stop" },
    ]));
    let started = tokio::time::Instant::now();
    let err = counter.stop().await.unwrap_err();
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert!(matches!(
        err.downcast_ref::<MockFault>(),
        Some(MockFault::Timeout { .. })
    ));
    assert_eq!(counter.calls().stop, 1);
}

/// Hardware built from the demo description is usable as-is.
#[tokio::test]
async fn test_demo_hardware() {
    let hw = HardwareConfig::demo().build();
    let diode = hw.counter("diode").unwrap();
    diode.trigger(&AcqContext::detached()).await.unwrap();
    assert_eq!(diode.reads(), 1);
    assert_eq!(hw.axis("sy").unwrap().dial_position().await.unwrap(), 0.0);
}
