use std::collections::HashMap;
use std::sync::Arc;

use backfill::{
    BackfillConfig, BackfillTarget, FeedId, FeedState, JsonFileProgressStore, NntpConnector,
    Orchestrator, ProgressStore, RunResult, ScanWindow,
};
use chrono::{Duration as ChronoDuration, Utc};
use std::time::Duration;

use crate::support::{
    fake_nntp::{FakeGroup, FakeNntpServer},
    helpers::{hourly_dates, init_tracing, RecordingProcessor},
};

async fn server(now: chrono::DateTime<Utc>) -> FakeNntpServer {
    let mut groups = HashMap::new();
    groups.insert(
        "alt.binaries.sounds".to_owned(),
        FakeGroup {
            low: 1_000,
            high: 3_000,
            dates: hourly_dates(now, 3_000),
        },
    );
    groups.insert(
        "alt.binaries.gaps".to_owned(),
        FakeGroup {
            low: 1,
            high: 1_000,
            dates: Arc::new(move |sequence: u64| {
                (sequence % 10 != 0).then(|| now - ChronoDuration::hours(1_000 - sequence as i64))
            }),
        },
    );
    FakeNntpServer::start(groups).await.unwrap()
}

fn config(port: u16) -> BackfillConfig {
    BackfillConfig::builder()
        .host("127.0.0.1")
        .port(port)
        .username("reader")
        .password("secret")
        .safety_margin(5)
        .chunk_size(250)
        .date_retries(1)
        .date_retry_delay(Duration::ZERO)
        .request_timeout(Duration::from_secs(5))
        .build()
        .unwrap()
}

#[tokio::test]
async fn backfills_over_nntp_and_persists_checkpoints() {
    init_tracing();
    let now = Utc::now();
    let server = server(now).await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("feeds.json");
    let store = JsonFileProgressStore::create(
        &path,
        vec![FeedState::new(
            FeedId(7),
            "alt.binaries.sounds",
            2_900,
            BackfillTarget::Days(30),
        )],
    )
    .unwrap();
    let config = config(server.port());
    let connector = Arc::new(NntpConnector::new(config.nntp_settings()));
    let processor = RecordingProcessor::default();
    let mut orchestrator = Orchestrator::new(config, connector, store, processor.clone());

    let summary = orchestrator.run_active().await.unwrap();

    let report = &summary.feeds[0];
    assert!(matches!(report.result, RunResult::Completed), "{}", report.result);
    let target = report.target.unwrap();
    assert!((2_275..=2_285).contains(&target), "target {target}");
    assert_eq!(processor.windows_for("alt.binaries.sounds")[0], ScanWindow::new(2_650, 2_899));

    let reopened = JsonFileProgressStore::open(&path).unwrap();
    let stored = reopened.read_feed_state(FeedId(7)).unwrap().unwrap();
    assert_eq!(stored.first_record, target);
    assert!(stored.first_record_date.is_some());

    assert_eq!(server.count("AUTHINFO USER reader"), 2, "both slots authenticate");
    assert_eq!(server.count("XFEATURE COMPRESS GZIP"), 1, "only the bulk slot asks");
    assert_eq!(server.count("QUIT"), 2);
}

#[tokio::test]
async fn missing_group_is_reported_and_other_feeds_continue() {
    init_tracing();
    let server = server(Utc::now()).await;
    let dir = tempfile::tempdir().unwrap();
    let store = JsonFileProgressStore::create(
        dir.path().join("feeds.json"),
        vec![
            FeedState::new(FeedId(1), "alt.binaries.missing", 500, BackfillTarget::Count(100)),
            FeedState::new(FeedId(2), "alt.binaries.sounds", 2_000, BackfillTarget::Count(100)),
        ],
    )
    .unwrap();
    let config = config(server.port());
    let connector = Arc::new(NntpConnector::new(config.nntp_settings()));
    let mut orchestrator =
        Orchestrator::new(config, connector, store, RecordingProcessor::default());

    let summary = orchestrator.run_active().await.unwrap();

    assert!(summary.get("alt.binaries.missing").unwrap().result.is_aborted());
    assert!(matches!(
        summary.get("alt.binaries.sounds").unwrap().result,
        RunResult::Completed
    ));
    assert_eq!(
        orchestrator
            .store()
            .feed_by_name("alt.binaries.sounds")
            .unwrap()
            .unwrap()
            .first_record,
        1_900
    );
}

#[tokio::test]
async fn missing_dates_fall_back_and_degrade_the_result() {
    init_tracing();
    let server = server(Utc::now()).await;
    let dir = tempfile::tempdir().unwrap();
    let store = JsonFileProgressStore::create(
        dir.path().join("feeds.json"),
        vec![FeedState::new(FeedId(1), "alt.binaries.gaps", 900, BackfillTarget::Count(100))],
    )
    .unwrap();
    let config = config(server.port());
    let connector = Arc::new(NntpConnector::new(config.nntp_settings()));
    let mut orchestrator =
        Orchestrator::new(config, connector, store, RecordingProcessor::default());

    let summary = orchestrator.run_active().await.unwrap();

    // The checkpoint lands on sequence 800, which has no Date header.
    assert!(matches!(summary.feeds[0].result, RunResult::Degraded), "{}", summary.feeds[0].result);
    assert_eq!(orchestrator.telemetry().fallback_dates(), 1);
    assert_eq!(server.count("XHDR Date 800"), 2, "one read plus one retry");
    let stored = orchestrator.store().feed_by_name("alt.binaries.gaps").unwrap().unwrap();
    assert_eq!(stored.first_record, 800);
}
