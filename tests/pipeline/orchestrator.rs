use backfill::{
    AbortReason, BackfillTarget, FeedId, FeedSelection, FeedState, MemoryProgressStore,
    Orchestrator, ProgressStore, RemoteError, RunResult, ScanMode, ScanWindow, SequenceRange,
};
use chrono::{Duration as ChronoDuration, Utc};

use crate::support::{
    helpers::{assert_contiguous_backwards, config, hourly_dates, init_tracing, RecordingProcessor},
    mock_remote::MockRemote,
};

fn orchestrator(
    remote: &MockRemote,
    feeds: Vec<FeedState>,
    safety_margin: u64,
    chunk_size: u64,
) -> (Orchestrator<MemoryProgressStore, RecordingProcessor>, RecordingProcessor) {
    let processor = RecordingProcessor::default();
    let config = config()
        .safety_margin(safety_margin)
        .chunk_size(chunk_size)
        .build()
        .unwrap();
    let orchestrator = Orchestrator::new(
        config,
        remote.connector(),
        MemoryProgressStore::new(feeds),
        processor.clone(),
    );
    (orchestrator, processor)
}

#[tokio::test]
async fn count_target_walks_fixed_windows_back_to_the_target() {
    init_tracing();
    let remote = MockRemote::new().with_feed(
        "alt.binaries.test",
        SequenceRange::new(1, 5_000),
        hourly_dates(Utc::now(), 5_000),
    );
    let feed = FeedState::new(FeedId(1), "alt.binaries.test", 1_000, BackfillTarget::Count(600));
    let (mut orchestrator, processor) = orchestrator(&remote, vec![feed], 0, 300);

    let summary = orchestrator.run_active().await.unwrap();

    assert!(matches!(summary.feeds[0].result, RunResult::Completed));
    assert_eq!(
        processor.windows_for("alt.binaries.test"),
        vec![ScanWindow::new(700, 999), ScanWindow::new(400, 699)]
    );
    let stored = orchestrator.store().feed(FeedId(1)).unwrap();
    assert_eq!(stored.first_record, 400);
    assert_eq!(orchestrator.store().history_for(FeedId(1)), vec![700, 400]);
    assert!(processor
        .scans()
        .iter()
        .all(|record| record.mode == ScanMode::Backfill));
}

#[tokio::test]
async fn windows_tile_the_span_without_gaps() {
    init_tracing();
    let remote = MockRemote::new().with_feed(
        "alt.test",
        SequenceRange::new(1, 100_000),
        hourly_dates(Utc::now(), 100_000),
    );
    let feed = FeedState::new(FeedId(1), "alt.test", 50_001, BackfillTarget::Count(12_345));
    let (mut orchestrator, processor) = orchestrator(&remote, vec![feed], 0, 1_000);

    let summary = orchestrator.run_active().await.unwrap();

    let windows = processor.windows_for("alt.test");
    assert_eq!(windows.len(), 13);
    assert_eq!(summary.total_windows(), 13);
    assert_contiguous_backwards(&windows, 50_001, 37_656);
    assert!(windows.iter().all(|window| window.width() <= 1_000));
}

#[tokio::test]
async fn frontier_within_the_safety_margin_is_exhausted_and_disabled() {
    init_tracing();
    let remote = MockRemote::new().with_feed(
        "alt.old",
        SequenceRange::new(50, 5_000),
        hourly_dates(Utc::now(), 5_000),
    );
    let feed = FeedState::new(FeedId(1), "alt.old", 80, BackfillTarget::Days(3_650));
    let (mut orchestrator, processor) = orchestrator(&remote, vec![feed], 50, 300);

    let summary = orchestrator.run_active().await.unwrap();

    assert!(matches!(summary.feeds[0].result, RunResult::Exhausted));
    assert_eq!(summary.feeds[0].windows, 0);
    assert!(processor.scans().is_empty());
    assert!(!orchestrator.store().feed(FeedId(1)).unwrap().enabled);
}

#[tokio::test]
async fn target_older_than_retention_starts_from_the_oldest_message() {
    init_tracing();
    let now = Utc::now();
    let remote = MockRemote::new().with_feed(
        "alt.short",
        SequenceRange::new(100, 1_000),
        hourly_dates(now, 1_000),
    );
    let feed = FeedState::new(FeedId(1), "alt.short", 900, BackfillTarget::Days(365));
    let (mut orchestrator, processor) = orchestrator(&remote, vec![feed], 10, 500);

    let summary = orchestrator.run_active().await.unwrap();

    assert!(matches!(summary.feeds[0].result, RunResult::Completed));
    assert_eq!(summary.feeds[0].target, Some(100));
    assert_contiguous_backwards(&processor.windows_for("alt.short"), 900, 100);
}

#[tokio::test]
async fn days_target_is_located_by_date() {
    init_tracing();
    let now = Utc::now();
    let remote = MockRemote::new().with_feed(
        "alt.dated",
        SequenceRange::new(1, 20_000),
        hourly_dates(now, 20_000),
    );
    let feed = FeedState::new(FeedId(1), "alt.dated", 19_000, BackfillTarget::Days(30));
    let (mut orchestrator, _processor) = orchestrator(&remote, vec![feed], 10, 5_000);

    let summary = orchestrator.run_active().await.unwrap();

    let report = &summary.feeds[0];
    assert!(matches!(report.result, RunResult::Completed), "{}", report.result);
    // 30 days of hourly messages below the newest one.
    let target = report.target.unwrap();
    assert!((19_270..=19_290).contains(&target), "target {target}");
    let stored = orchestrator.store().feed(FeedId(1)).unwrap();
    assert_eq!(stored.first_record, target);
    let age = now - stored.first_record_date.unwrap();
    assert!(age >= ChronoDuration::days(30) - ChronoDuration::hours(2));
}

#[tokio::test]
async fn second_run_does_not_move_the_frontier_again() {
    init_tracing();
    let remote = MockRemote::new().with_feed(
        "alt.dated",
        SequenceRange::new(1, 20_000),
        hourly_dates(Utc::now(), 20_000),
    );
    let feed = FeedState::new(FeedId(1), "alt.dated", 19_900, BackfillTarget::Days(10));
    let (mut orchestrator, processor) = orchestrator(&remote, vec![feed], 10, 200);

    orchestrator.run_active().await.unwrap();
    let frontier = orchestrator.store().feed(FeedId(1)).unwrap().first_record;
    let scanned = processor.scans().len();

    let again = orchestrator.run_active().await.unwrap();

    assert!(!again.feeds[0].result.is_aborted(), "{}", again.feeds[0].result);
    assert_eq!(again.feeds[0].windows, 0);
    assert_eq!(processor.scans().len(), scanned);
    assert_eq!(orchestrator.store().feed(FeedId(1)).unwrap().first_record, frontier);
}

#[tokio::test]
async fn rerun_after_an_abort_resumes_below_the_last_checkpoint() {
    init_tracing();
    let remote = MockRemote::new().with_feed(
        "alt.dated",
        SequenceRange::new(1, 20_000),
        hourly_dates(Utc::now(), 20_000),
    );
    let feed = FeedState::new(FeedId(1), "alt.dated", 19_900, BackfillTarget::Days(10));
    let processor = RecordingProcessor::failing_after(1);
    let config = config().safety_margin(10).chunk_size(50).build().unwrap();
    let mut orchestrator = Orchestrator::new(
        config,
        remote.connector(),
        MemoryProgressStore::new(vec![feed]),
        processor.clone(),
    );

    let aborted = orchestrator.run_active().await.unwrap();

    assert!(matches!(
        aborted.feeds[0].result,
        RunResult::Aborted(AbortReason::Scan(_))
    ));
    assert_eq!(processor.windows_for("alt.dated"), vec![ScanWindow::new(19_850, 19_899)]);
    let checkpoint = orchestrator.store().feed(FeedId(1)).unwrap().first_record;
    assert_eq!(checkpoint, 19_850);
    let target = aborted.feeds[0].target.unwrap();

    processor.heal();
    let resumed = orchestrator.run_active().await.unwrap();

    assert!(matches!(resumed.feeds[0].result, RunResult::Completed), "{}", resumed.feeds[0].result);
    assert_eq!(resumed.feeds[0].target, Some(target));
    let windows = processor.windows_for("alt.dated");
    let rerun = &windows[1..];
    assert_eq!(rerun[0].last, checkpoint - 1);
    assert_contiguous_backwards(rerun, checkpoint, target);
    assert!(rerun.iter().all(|window| window.last < checkpoint));
    assert_eq!(orchestrator.store().feed(FeedId(1)).unwrap().first_record, target);
}

#[tokio::test]
async fn frontier_never_moves_newer_across_runs() {
    init_tracing();
    let remote = MockRemote::new().with_feed(
        "alt.test",
        SequenceRange::new(1, 10_000),
        hourly_dates(Utc::now(), 10_000),
    );
    let feed = FeedState::new(FeedId(1), "alt.test", 9_000, BackfillTarget::Count(700));
    let (mut orchestrator, _processor) = orchestrator(&remote, vec![feed], 0, 250);

    let mut previous = 9_000;
    for _ in 0..3 {
        orchestrator.run_active().await.unwrap();
        let frontier = orchestrator.store().feed(FeedId(1)).unwrap().first_record;
        assert!(frontier < previous);
        previous = frontier;
    }
    let history = orchestrator.store().history_for(FeedId(1));
    assert!(history.windows(2).all(|pair| pair[1] < pair[0]));
}

#[tokio::test]
async fn a_failing_feed_does_not_stop_the_run() {
    init_tracing();
    let now = Utc::now();
    let remote = MockRemote::new()
        .with_feed("alt.a", SequenceRange::new(1, 5_000), hourly_dates(now, 5_000))
        .with_feed("alt.c", SequenceRange::new(1, 5_000), hourly_dates(now, 5_000));
    let feeds = vec![
        FeedState::new(FeedId(1), "alt.a", 1_000, BackfillTarget::Count(100)),
        FeedState::new(FeedId(2), "alt.b", 1_000, BackfillTarget::Count(100)),
        FeedState::new(FeedId(3), "alt.c", 1_000, BackfillTarget::Count(100)),
    ];
    let (mut orchestrator, processor) = orchestrator(&remote, feeds, 0, 300);

    let summary = orchestrator.run_active().await.unwrap();

    assert!(matches!(summary.get("alt.a").unwrap().result, RunResult::Completed));
    assert!(matches!(
        summary.get("alt.b").unwrap().result,
        RunResult::Aborted(AbortReason::Remote(RemoteError::UnknownFeed { .. }))
    ));
    assert!(matches!(summary.get("alt.c").unwrap().result, RunResult::Completed));
    assert_eq!(processor.windows_for("alt.c"), vec![ScanWindow::new(900, 999)]);
    assert_eq!(remote.closes(), 2, "one pair of connections for the whole run");
}

#[tokio::test]
async fn processor_failure_aborts_only_that_feed() {
    init_tracing();
    let now = Utc::now();
    let remote = MockRemote::new()
        .with_feed("alt.a", SequenceRange::new(1, 5_000), hourly_dates(now, 5_000))
        .with_feed("alt.b", SequenceRange::new(1, 5_000), hourly_dates(now, 5_000));
    let feeds = vec![
        FeedState::new(FeedId(1), "alt.a", 1_000, BackfillTarget::Count(100)),
        FeedState::new(FeedId(2), "alt.b", 1_000, BackfillTarget::Count(100)),
    ];
    let processor = RecordingProcessor::failing_for("alt.a");
    let config = config().safety_margin(0).chunk_size(300).build().unwrap();
    let mut orchestrator = Orchestrator::new(
        config,
        remote.connector(),
        MemoryProgressStore::new(feeds),
        processor.clone(),
    );

    let summary = orchestrator.run_active().await.unwrap();

    assert!(matches!(
        summary.get("alt.a").unwrap().result,
        RunResult::Aborted(AbortReason::Scan(_))
    ));
    assert!(orchestrator.store().history_for(FeedId(1)).is_empty());
    assert_eq!(orchestrator.store().history_for(FeedId(2)), vec![900]);
}

#[tokio::test]
async fn failing_to_open_a_connection_aborts_the_run() {
    init_tracing();
    let remote = MockRemote::new()
        .with_feed("alt.a", SequenceRange::new(1, 5_000), hourly_dates(Utc::now(), 5_000))
        .failing_connect(2);
    let feed = FeedState::new(FeedId(1), "alt.a", 1_000, BackfillTarget::Count(100));
    let (mut orchestrator, processor) = orchestrator(&remote, vec![feed], 0, 300);

    let err = orchestrator.run_active().await.unwrap_err();

    assert!(format!("{err:#}").contains("connection refused"));
    assert!(processor.scans().is_empty());
    assert_eq!(remote.closes(), 1, "the bulk slot opened first is closed again");
}

#[tokio::test]
async fn one_reset_is_retried_after_reconnecting() {
    init_tracing();
    let remote = MockRemote::new().with_feed(
        "alt.a",
        SequenceRange::new(1, 5_000),
        hourly_dates(Utc::now(), 5_000),
    );
    let feed = FeedState::new(FeedId(1), "alt.a", 1_000, BackfillTarget::Count(100));
    let (mut orchestrator, _processor) = orchestrator(&remote, vec![feed], 0, 300);
    remote.reset_next_date_reads(1);

    let summary = orchestrator.run_active().await.unwrap();

    assert!(matches!(summary.feeds[0].result, RunResult::Completed));
    assert_eq!(remote.reconnects(), 1);
    assert_eq!(remote.date_calls(), vec![900, 900]);
}

#[tokio::test]
async fn two_consecutive_resets_are_terminal_for_the_feed() {
    init_tracing();
    let remote = MockRemote::new().with_feed(
        "alt.a",
        SequenceRange::new(1, 5_000),
        hourly_dates(Utc::now(), 5_000),
    );
    let feed = FeedState::new(FeedId(1), "alt.a", 1_000, BackfillTarget::Count(100));
    let (mut orchestrator, processor) = orchestrator(&remote, vec![feed], 0, 300);
    remote.reset_next_date_reads(2);

    let summary = orchestrator.run_active().await.unwrap();

    assert!(matches!(
        summary.feeds[0].result,
        RunResult::Aborted(AbortReason::Remote(RemoteError::ConnectionReset { .. }))
    ));
    assert_eq!(remote.reconnects(), 1, "never a second reconnect");
    assert_eq!(remote.date_calls().len(), 2, "never a third attempt");
    assert_eq!(processor.scans().len(), 1);
    assert!(orchestrator.store().history().is_empty());
}

#[tokio::test]
async fn safe_count_mode_backfills_one_feed_inside_the_safe_window() {
    init_tracing();
    let now = Utc::now();
    let remote = MockRemote::new()
        .with_feed("alt.a", SequenceRange::new(1, 5_000), hourly_dates(now, 5_000))
        .with_feed("alt.b", SequenceRange::new(1, 5_000), hourly_dates(now, 5_000));
    let feeds = vec![
        FeedState::new(FeedId(1), "alt.a", 1_000, BackfillTarget::Days(30))
            .with_first_record_date(now - ChronoDuration::days(20 * 365)),
        FeedState::new(FeedId(2), "alt.b", 1_000, BackfillTarget::Days(30))
            .with_first_record_date(now - ChronoDuration::days(40)),
    ];
    let (mut orchestrator, processor) = orchestrator(&remote, feeds, 0, 300);

    let summary = orchestrator.run(FeedSelection::SafeCount { count: 250 }).await.unwrap();

    assert_eq!(summary.feeds.len(), 1);
    assert_eq!(summary.feeds[0].feed, "alt.b");
    assert_eq!(processor.windows_for("alt.b"), vec![ScanWindow::new(750, 999)]);
    let listed = orchestrator.store().list_feeds().unwrap();
    assert_eq!(listed[0].first_record, 1_000, "feeds outside the window are untouched");
}
