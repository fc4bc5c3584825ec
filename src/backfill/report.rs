//! Plain-text overview of how far each backfill-enabled feed has come.

use crate::backfill::feed::{BackfillTarget, FeedState};
use crate::backfill::locator::days_old;
use chrono::{DateTime, Utc};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReportOrder {
    /// Feeds furthest from now first.
    #[default]
    OldestFirst,
    NewestFirst,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReportRow {
    pub name: String,
    pub target: BackfillTarget,
    /// Age of the frontier message at report time, in days.
    pub backfilled_days: f64,
    pub oldest_post: DateTime<Utc>,
    pub last_updated: Option<DateTime<Utc>>,
    pub messages_held: u64,
}

#[derive(Debug, Clone, Default)]
pub struct BackfillReport {
    pub rows: Vec<ReportRow>,
}

impl BackfillReport {
    /// Builds the report from enabled feeds that have a dated frontier.
    pub fn build(
        feeds: &[FeedState],
        now: DateTime<Utc>,
        order: ReportOrder,
        limit: Option<usize>,
    ) -> Self {
        let mut rows: Vec<ReportRow> = feeds
            .iter()
            .filter(|feed| feed.enabled)
            .filter_map(|feed| {
                let oldest_post = feed.first_record_date?;
                Some(ReportRow {
                    name: feed.name.clone(),
                    target: feed.target,
                    backfilled_days: days_old(now, oldest_post),
                    oldest_post,
                    last_updated: feed.last_updated,
                    messages_held: feed.messages_held(),
                })
            })
            .collect();

        rows.sort_by(|a, b| {
            let by_date = a.oldest_post.cmp(&b.oldest_post);
            match order {
                ReportOrder::OldestFirst => by_date,
                ReportOrder::NewestFirst => by_date.reverse(),
            }
            .then_with(|| a.name.cmp(&b.name))
        });
        if let Some(limit) = limit {
            rows.truncate(limit);
        }
        Self { rows }
    }
}

fn target_cell(row: &ReportRow) -> String {
    match row.target {
        BackfillTarget::Days(days) => format!("{days} ({:.1})", row.backfilled_days),
        BackfillTarget::Count(count) => format!("{count} msgs ({:.1})", row.backfilled_days),
    }
}

impl fmt::Display for BackfillReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:<40} {:>18} {:<20} {:<20} {:>12}",
            "feed", "target (days)", "oldest post", "last updated", "messages"
        )?;
        for row in &self.rows {
            let last_updated = row
                .last_updated
                .map(|date| date.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_owned());
            writeln!(
                f,
                "{:<40} {:>18} {:<20} {:<20} {:>12}",
                row.name,
                target_cell(row),
                row.oldest_post.format("%Y-%m-%d %H:%M:%S"),
                last_updated,
                row.messages_held
            )?;
        }
        write!(f, "{} feed(s)", self.rows.len())
    }
}
