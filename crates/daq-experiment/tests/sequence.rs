//! Sequences and groups publishing member scans.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{context, context_with, step_scan, timer_chain};
use daq_core::{
    keys, ChannelShape, ChannelValue, DaqError, DataType, ScanOutcome, SequenceError,
};
use daq_driver_mock::{ErrorConfig, ErrorScenario, MockCounter};
use daq_experiment::{Group, Scan, Sequence, GROUPING_MASTER};

fn loopscan(ctx: &Arc<daq_experiment::EngineContext>, points: usize) -> Scan {
    let diode = Arc::new(MockCounter::new("diode"));
    let (chain, _timer) = timer_chain(Duration::from_millis(1), points, &[diode]);
    Scan::new(chain, "loopscan", ctx.clone())
}

#[tokio::test]
async fn test_sequence_publishes_members_in_order() {
    let ctx = context();

    let seq_ctx = Sequence::new("seq", ctx.clone())
        .sequence_context(|seq| {
            let ctx = ctx.clone();
            async move {
                let first = loopscan(&ctx, 2);
                let second = loopscan(&ctx, 3);
                first.run().await?;
                second.run().await?;
                seq.add(&first).await?;
                seq.add(&second).await?;
                Ok(seq)
            }
        })
        .await
        .unwrap();

    assert_eq!(
        seq_ctx.published_scans().await.unwrap(),
        vec!["2_loopscan".to_string(), "3_loopscan".to_string()]
    );
    assert_eq!(seq_ctx.published_scan_numbers().await.unwrap(), vec![2, 3]);

    let record = seq_ctx.scan();
    assert_eq!(record.outcome(), Some(ScanOutcome::Done));
    assert_eq!(record.scan_number(), Some(1));
    assert_eq!(
        record.scan_info().get(keys::IS_SCAN_SEQUENCE),
        Some(&true.into())
    );
}

#[tokio::test]
async fn test_add_and_run_publishes_every_member() {
    let ctx = context();
    let seq = Sequence::new("seq", ctx.clone()).open().await.unwrap();

    let mut numbers = Vec::new();
    for _ in 0..4 {
        let member = loopscan(&ctx, 2);
        seq.add_and_run(&member).await.unwrap();
        numbers.push(member.scan_number().unwrap() as i64);
    }
    seq.close().await.unwrap();
    seq.close().await.unwrap();

    assert_eq!(seq.queued(), 4);
    assert_eq!(seq.published(), 4);
    assert_eq!(seq.published_scan_numbers().await.unwrap(), numbers);
    assert_eq!(seq.scan().outcome(), Some(ScanOutcome::Done));
}

#[tokio::test]
async fn test_deferred_add_publishes_once_member_starts() {
    let ctx = context();
    let seq = Sequence::new("seq", ctx.clone()).open().await.unwrap();

    let member = loopscan(&ctx, 2);
    seq.add(&member).await.unwrap();
    assert_eq!(seq.queued(), 0);
    member.run().await.unwrap();
    seq.wait_all_subscans(Duration::from_secs(5)).await.unwrap();
    seq.close().await.unwrap();

    assert_eq!(seq.published_scans().await.unwrap(), vec!["2_loopscan".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_member_that_never_starts_fails_exit() {
    let ctx = context_with(|settings| settings.sequence.subscan_timeout_ms = 100);
    let never_run = loopscan(&ctx, 2);

    let err = Sequence::new("seq", ctx.clone())
        .sequence_context(|seq| async move { seq.add(&never_run).await })
        .await
        .unwrap_err();

    assert!(
        matches!(
            err,
            DaqError::Sequence(SequenceError::SubscanTimeout { pending: 1, .. })
        ),
        "{err}"
    );
}

#[tokio::test(start_paused = true)]
async fn test_member_left_unpublished_fails_close() {
    let ctx = context_with(|settings| settings.sequence.publish_timeout_ms = 100);
    let seq = Sequence::new("seq", ctx.clone()).open().await.unwrap();
    seq.scan().kill();
    seq.scan().wait_finished().await;

    let member = loopscan(&ctx, 1);
    member.run().await.unwrap();
    seq.add(&member).await.unwrap();
    assert_eq!(seq.queued(), 1);

    let err = seq.close().await.unwrap_err();

    assert!(
        matches!(
            err,
            DaqError::Sequence(SequenceError::Unpublished {
                queued: 1,
                published: 0,
                ..
            })
        ),
        "{err}"
    );
    assert_eq!(seq.published(), 0);
}

#[tokio::test]
async fn test_killed_member_escalates_sequence() {
    let ctx = context();
    let seq = Sequence::new("seq", ctx.clone()).open().await.unwrap();

    let good = loopscan(&ctx, 2);
    seq.add_and_run(&good).await.unwrap();
    let bad = Scan::new(
        step_scan(
            3,
            ErrorConfig::scenario(ErrorScenario::FailAfterN {
                operation: "read",
                count: 1,
            }),
        )
        .chain,
        "ascan",
        ctx.clone(),
    );
    assert!(seq.add_and_run(&bad).await.is_err());
    assert_eq!(bad.outcome(), Some(ScanOutcome::Killed));
    seq.close().await.unwrap();

    assert_eq!(seq.published(), 2);
    assert_eq!(seq.scan().outcome(), Some(ScanOutcome::Killed));
    assert_eq!(seq.scan().scan_info().state(), Some("KILLED"));
}

#[tokio::test]
async fn test_add_and_run_rejects_started_scan() {
    let ctx = context();
    let seq = Sequence::new("seq", ctx.clone()).open().await.unwrap();
    let member = loopscan(&ctx, 1);
    member.run().await.unwrap();

    let err = seq.add_and_run(&member).await.unwrap_err();

    assert!(matches!(
        err,
        DaqError::Sequence(SequenceError::AlreadyStarted(ref name)) if name == "loopscan"
    ));
    seq.close().await.unwrap();
}

#[tokio::test]
async fn test_custom_channels_are_recorded() {
    let ctx = context();
    let mut sequence = Sequence::new("seq", ctx.clone());
    let temperature =
        sequence.add_custom_channel("temperature", ChannelShape::Scalar, DataType::Float64);

    let seq = sequence.open().await.unwrap();
    assert_eq!(seq.custom_channels().len(), 1);
    for value in [21.5, 22.0] {
        let member = loopscan(&ctx, 1);
        seq.add_and_run(&member).await.unwrap();
        temperature.emit_one(ChannelValue::Float(value)).await.unwrap();
    }
    seq.close().await.unwrap();

    assert_eq!(
        seq.scan()
            .channel_data("custom_channels:temperature")
            .await
            .unwrap(),
        vec![ChannelValue::Float(21.5), ChannelValue::Float(22.0)]
    );
}

#[tokio::test]
async fn test_group_takes_worst_member_outcome() {
    let ctx = context();
    let good = Scan::new(step_scan(3, ErrorConfig::none()).chain, "ascan", ctx.clone());
    let bad = Scan::new(
        step_scan(
            3,
            ErrorConfig::scenario(ErrorScenario::FailAfterN {
                operation: "read",
                count: 1,
            }),
        )
        .chain,
        "ascan",
        ctx.clone(),
    );
    good.run().await.unwrap();
    assert!(bad.run().await.is_err());
    assert_eq!(bad.outcome(), Some(ScanOutcome::Killed));

    let group = Group::new("group", ctx.clone())
        .run([&good, &bad])
        .await
        .unwrap();

    assert_eq!(group.outcome(), Some(ScanOutcome::Killed));
    assert_eq!(group.scan_info().state(), Some("KILLED"));
    assert_eq!(
        group
            .channel_data(&format!("{}:scan_numbers", GROUPING_MASTER))
            .await
            .unwrap(),
        vec![ChannelValue::Int(1), ChannelValue::Int(2)]
    );
}

#[tokio::test]
async fn test_group_of_done_members_is_done() {
    let ctx = context();
    for _ in 0..2 {
        loopscan(&ctx, 1).run().await.unwrap();
    }

    let group = Group::new("group", ctx.clone())
        .run([1u64, 2u64])
        .await
        .unwrap();

    assert_eq!(group.outcome(), Some(ScanOutcome::Done));
    assert_eq!(group.scan_number(), Some(3));
    assert_eq!(
        group
            .channel_data(&format!("{}:scans", GROUPING_MASTER))
            .await
            .unwrap(),
        vec![
            ChannelValue::Text("1_loopscan".into()),
            ChannelValue::Text("2_loopscan".into())
        ]
    );
    assert_eq!(ctx.last_scan().unwrap().name, "group");
}

#[tokio::test]
async fn test_group_validates_members_before_publishing() {
    let ctx = context();
    let unstarted = loopscan(&ctx, 1);

    let err = Group::new("group", ctx.clone())
        .run([&unstarted])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DaqError::Sequence(SequenceError::NotStarted(ref name)) if name == "loopscan"
    ));

    let err = Group::new("group", ctx.clone())
        .run([42u64])
        .await
        .unwrap_err();
    assert!(matches!(err, DaqError::UnknownScan(42)));
    assert!(ctx.history().is_empty());
}
