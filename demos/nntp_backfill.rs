use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use backfill::{
    BackfillConfig, BackfillReport, ConnectionSlot, FeedSelection, FeedState,
    JsonFileProgressStore, NntpConnector, ProgressStore, ReportOrder, Runner, ScanFuture,
    ScanMode, ScanProcessor, ScanWindow,
};
use chrono::Utc;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

const DEFAULT_STORE_PATH: &str = "feeds.json";
const DEFAULT_LOG_DIRECTIVE: &str = "warn";

#[tokio::main]
async fn main() -> Result<()> {
    init_example_tracing();

    let args = DemoArgs::from_env()?;
    let config = BackfillConfig::from_env()?;
    let store = JsonFileProgressStore::open(&args.store_path)?;

    if args.report_only {
        let feeds = store.list_feeds()?;
        println!(
            "{}",
            BackfillReport::build(&feeds, Utc::now(), ReportOrder::OldestFirst, args.limit)
        );
        return Ok(());
    }

    let bar = build_progress_bar();
    bar.println(format!(
        "Backfilling from {}:{} using {}",
        config.host(),
        config.port(),
        args.store_path.display()
    ));

    let connector = Arc::new(NntpConnector::new(config.nntp_settings()));
    let processor = ProgressProcessor { bar: bar.clone() };
    let mut runner = Runner::new(config, connector, store, processor);

    let summary = runner.run_until_ctrl_c(args.selection()).await;
    match summary {
        Ok(summary) => {
            bar.finish_with_message("done");
            bar.println(summary.to_string());
        }
        Err(err) => {
            bar.abandon_with_message("run failed");
            return Err(err);
        }
    }

    let (store, _) = runner.into_parts();
    let feeds = store.list_feeds()?;
    println!(
        "{}",
        BackfillReport::build(&feeds, Utc::now(), ReportOrder::OldestFirst, args.limit)
    );
    Ok(())
}

fn init_example_tracing() {
    if env::var_os("RUST_LOG").is_none() {
        env::set_var("RUST_LOG", DEFAULT_LOG_DIRECTIVE);
    }
    backfill::init_tracing();
}

fn build_progress_bar() -> ProgressBar {
    let bar = ProgressBar::with_draw_target(None, ProgressDrawTarget::stdout_with_hz(12));
    let style = ProgressStyle::with_template(
        "{spinner:.green} [{elapsed_precise}] {pos} messages ({per_sec:.2} msg/s) {msg}",
    )
    .expect("valid progress bar template");
    bar.set_style(style);
    bar.enable_steady_tick(Duration::from_millis(120));
    bar
}

/// Stands in for an indexer: counts the messages in each window.
struct ProgressProcessor {
    bar: ProgressBar,
}

impl ScanProcessor for ProgressProcessor {
    fn scan<'a>(
        &'a mut self,
        _connection: &'a mut ConnectionSlot,
        feed: &'a FeedState,
        window: ScanWindow,
        _mode: ScanMode,
    ) -> ScanFuture<'a> {
        Box::pin(async move {
            self.bar.set_message(format!("{} {window}", feed.name));
            self.bar.inc(window.width());
            Ok(())
        })
    }
}

struct DemoArgs {
    store_path: PathBuf,
    feed: Option<String>,
    count: Option<u64>,
    safe: bool,
    report_only: bool,
    limit: Option<usize>,
}

impl DemoArgs {
    fn from_env() -> Result<Self> {
        Ok(Self {
            store_path: env::var("BACKFILL_STORE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_STORE_PATH)),
            feed: env::var("BACKFILL_FEED").ok().filter(|feed| !feed.is_empty()),
            count: parse_env::<u64>("BACKFILL_COUNT")?,
            safe: parse_env::<bool>("BACKFILL_SAFE")?.unwrap_or(false),
            report_only: parse_env::<bool>("BACKFILL_REPORT")?.unwrap_or(false),
            limit: parse_env::<usize>("BACKFILL_REPORT_LIMIT")?,
        })
    }

    fn selection(&self) -> FeedSelection {
        match (&self.feed, self.count) {
            (Some(name), Some(count)) => FeedSelection::NamedCount {
                name: name.clone(),
                count,
            },
            (Some(name), None) => FeedSelection::Named(name.clone()),
            (None, Some(count)) if self.safe => FeedSelection::SafeCount { count },
            (None, Some(count)) => FeedSelection::ActiveCount {
                count,
                within_safe_window: false,
            },
            (None, None) => FeedSelection::Active {
                within_safe_window: self.safe,
            },
        }
    }
}

fn parse_env<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("invalid value for {key}: {value}")),
        _ => Ok(None),
    }
}
