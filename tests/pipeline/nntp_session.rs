use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use backfill::{
    CompressionMode, ConnectionSlot, NntpConnector, NntpSettings, RemoteError, SequenceRange,
};
use chrono::{DateTime, TimeZone, Utc};

use crate::support::{
    fake_nntp::{FakeGroup, FakeNntpServer, Fault},
    helpers::{hourly_dates, init_tracing},
};

const REQUEST_TIMEOUT: Duration = Duration::from_millis(200);

/// Whole seconds so dates survive the RFC 2822 round trip.
fn anchor() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

fn group(low: u64, high: u64) -> FakeGroup {
    FakeGroup {
        low,
        high,
        dates: hourly_dates(anchor(), high),
    }
}

async fn server(faults: Vec<Fault>) -> FakeNntpServer {
    let groups = HashMap::from([
        ("alt.slow".to_owned(), group(1, 100)),
        ("alt.fast".to_owned(), group(500, 510)),
    ]);
    FakeNntpServer::start_with_faults(groups, faults).await.unwrap()
}

async fn slot(server: &FakeNntpServer) -> ConnectionSlot {
    let connector = Arc::new(NntpConnector::new(NntpSettings {
        host: "127.0.0.1".to_owned(),
        port: server.port(),
        username: None,
        password: None,
    }));
    ConnectionSlot::open(
        connector.as_ref(),
        CompressionMode::Uncompressed,
        REQUEST_TIMEOUT,
        Duration::ZERO,
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn hung_session_is_abandoned_and_the_retry_runs_on_a_fresh_one() {
    init_tracing();
    let server = server(vec![Fault::hang("XHDR").on_session(0)]).await;
    let mut slot = slot(&server).await;

    slot.select_feed("alt.fast").await.unwrap();
    let date = slot.fetch_date(505).await.unwrap();

    assert_eq!(date, (hourly_dates(anchor(), 510))(505).unwrap());
    assert_eq!(server.sessions(), 2);
    assert_eq!(server.count("QUIT"), 0, "no QUIT is sent to a hung session");
    assert_eq!(server.count("GROUP alt.fast"), 2, "feed reselected on the new session");
    let metrics = slot.metrics();
    assert_eq!(metrics.reconnects, 1);
    assert_eq!(metrics.total_timeouts, 1);
    assert!(!slot.is_stale());
}

#[tokio::test]
async fn server_that_never_answers_gets_exactly_one_retry() {
    init_tracing();
    let server = server(vec![Fault::hang("XHDR")]).await;
    let mut slot = slot(&server).await;

    slot.select_feed("alt.fast").await.unwrap();
    let err = slot.fetch_date(505).await.unwrap_err();

    assert!(
        matches!(err, RemoteError::Timeout { operation: "fetch_date", .. }),
        "{err}"
    );
    assert_eq!(server.count("XHDR"), 2);
    assert_eq!(server.sessions(), 2);
    assert!(slot.is_stale());
}

#[tokio::test]
async fn late_reply_is_never_read_as_the_next_answer() {
    init_tracing();
    let server = server(vec![Fault::delay("GROUP alt.slow", Duration::from_millis(300))]).await;
    let mut slot = slot(&server).await;

    let err = slot.select_feed("alt.slow").await.unwrap_err();
    assert!(matches!(err, RemoteError::Timeout { .. }), "{err}");
    assert!(slot.is_stale());

    // Let the delayed alt.slow reply land on the old session.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let range = slot.select_feed("alt.fast").await.unwrap();

    assert_eq!(range, SequenceRange::new(500, 510));
    assert_eq!(slot.selected_feed(), Some("alt.fast"));
    assert_eq!(server.sessions(), 3);
}

#[tokio::test]
async fn date_read_after_a_timed_out_call_comes_from_a_fresh_session() {
    init_tracing();
    let server = server(vec![
        Fault::delay("XHDR Date 501", Duration::from_millis(300)),
    ])
    .await;
    let mut slot = slot(&server).await;

    slot.select_feed("alt.fast").await.unwrap();
    slot.fetch_date(501).await.unwrap_err();
    tokio::time::sleep(Duration::from_millis(150)).await;
    let date = slot.fetch_date(509).await.unwrap();

    assert_eq!(date, (hourly_dates(anchor(), 510))(509).unwrap());
    assert_eq!(server.sessions(), 3);
    assert_eq!(slot.range(), Some(SequenceRange::new(500, 510)));
}
