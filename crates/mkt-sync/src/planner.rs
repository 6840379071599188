//! Backfill and incremental window planning. Pure calendar arithmetic over an injected `now`.

use chrono::{DateTime, Duration, DurationRound, Months, NaiveDate, Utc};
use mkt_core::{Cadence, InvalidWindow, Resolution, SourceKind, SyncWindow};
use mkt_storage::DeleteFilter;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlannerError {
    #[error("backfill month marks must be strictly decreasing and non-empty, got {0:?}")]
    MisorderedMarks(Vec<u32>),
    #[error("hourly span of {0} days must be positive")]
    InvalidHourlySpan(i64),
    #[error("calendar arithmetic overflowed computing {0}")]
    CalendarOverflow(&'static str),
    #[error("planned window is empty: {0}")]
    EmptyWindow(#[from] InvalidWindow),
}

/// Where the backfill regime draws its span boundaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillSpans {
    /// Start of the one-shot full-history stats window; `None` disables it.
    pub history_start: Option<NaiveDate>,
    /// Month offsets (oldest first) separating the daily-resolution spans. The
    /// last mark is where 4-hour resolution begins.
    pub daily_month_marks: Vec<u32>,
    /// Trailing days fetched at hourly resolution.
    pub hourly_days: i64,
}

impl Default for BackfillSpans {
    fn default() -> Self {
        Self {
            history_start: NaiveDate::from_ymd_opt(2020, 1, 1),
            daily_month_marks: vec![12, 8, 4, 1],
            hourly_days: 7,
        }
    }
}

/// Maximum age per resolution before rows are expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub hourly: Duration,
    pub four_hourly: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            hourly: Duration::days(7),
            four_hourly: Duration::days(30),
        }
    }
}

impl RetentionPolicy {
    pub fn max_age(&self, resolution: Resolution) -> Option<Duration> {
        match resolution {
            Resolution::Hour => Some(self.hourly),
            Resolution::FourHours => Some(self.four_hourly),
            Resolution::Day => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackfillStep {
    pub kind: SourceKind,
    pub window: SyncWindow,
    /// Run the provider's full-history query template.
    pub historical: bool,
    /// Send every target in one request instead of chunking.
    pub single_batch: bool,
}

#[derive(Debug, Clone)]
pub struct WindowPlanner {
    spans: BackfillSpans,
    retention: RetentionPolicy,
}

impl WindowPlanner {
    pub fn new(spans: BackfillSpans, retention: RetentionPolicy) -> Result<Self, PlannerError> {
        let marks = &spans.daily_month_marks;
        if marks.is_empty() || marks.windows(2).any(|w| w[0] <= w[1]) {
            return Err(PlannerError::MisorderedMarks(marks.clone()));
        }
        if spans.hourly_days <= 0 {
            return Err(PlannerError::InvalidHourlySpan(spans.hourly_days));
        }
        Ok(Self { spans, retention })
    }

    /// The full backfill sequence: warehouse windows oldest to newest with
    /// finer resolution toward the present, then the streaming index and TVL
    /// history steps.
    pub fn backfill(&self, now: DateTime<Utc>) -> Result<Vec<BackfillStep>, PlannerError> {
        let day_anchor = start_of_day(now)?;
        let end = floor_to(now, Resolution::Hour)?;

        let marks = self
            .spans
            .daily_month_marks
            .iter()
            .map(|m| {
                day_anchor
                    .checked_sub_months(Months::new(*m))
                    .ok_or(PlannerError::CalendarOverflow("backfill month mark"))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let hourly_start = day_anchor
            .checked_sub_signed(Duration::days(self.spans.hourly_days))
            .ok_or(PlannerError::CalendarOverflow("hourly span start"))?;
        let oldest = marks[0];

        let mut steps = Vec::new();

        if let Some(start) = self.history_start()? {
            if start < oldest {
                steps.push(BackfillStep {
                    kind: SourceKind::AnalyticsWarehouse,
                    window: SyncWindow::new(start, oldest, Resolution::Day)?,
                    historical: true,
                    single_batch: true,
                });
            }
        }

        for pair in marks.windows(2) {
            steps.push(warehouse_step(pair[0], pair[1], Resolution::Day)?);
        }
        steps.push(warehouse_step(marks[marks.len() - 1], hourly_start, Resolution::FourHours)?);
        steps.push(warehouse_step(hourly_start, end, Resolution::Hour)?);

        steps.push(BackfillStep {
            kind: SourceKind::StreamingIndex,
            window: SyncWindow::new(oldest, end, Resolution::Day)?,
            historical: false,
            single_batch: false,
        });

        let tvl_start = self.history_start()?.unwrap_or(oldest);
        steps.push(BackfillStep {
            kind: SourceKind::ProtocolTvl,
            window: SyncWindow::new(tvl_start, end, Resolution::Day)?,
            historical: true,
            single_batch: false,
        });

        Ok(steps)
    }

    /// One window `[now - cadence, now)` with `now` aligned to the hour.
    pub fn incremental(&self, cadence: Cadence, now: DateTime<Utc>) -> Result<SyncWindow, PlannerError> {
        let end = floor_to(now, Resolution::Hour)?;
        let start = end
            .checked_sub_signed(cadence.interval())
            .ok_or(PlannerError::CalendarOverflow("incremental window start"))?;
        Ok(SyncWindow::new(start, end, cadence.resolution())?)
    }

    /// The streaming index only publishes daily buckets, so its incremental
    /// window reaches back to the start of the day the tick window opens in.
    pub fn streaming_window(&self, window: &SyncWindow) -> Result<SyncWindow, PlannerError> {
        Ok(SyncWindow::new(
            start_of_day(window.date_from())?,
            window.date_to(),
            Resolution::Day,
        )?)
    }

    /// Deletes that enforce the retention policy as of `now`.
    pub fn expiry_filters(&self, now: DateTime<Utc>) -> Vec<DeleteFilter> {
        Resolution::ALL
            .iter()
            .filter_map(|res| {
                let max_age = self.retention.max_age(*res)?;
                let cutoff = now.checked_sub_signed(max_age)?;
                Some(DeleteFilter::older_than(cutoff).at_resolution(*res))
            })
            .collect()
    }

    fn history_start(&self) -> Result<Option<DateTime<Utc>>, PlannerError> {
        self.spans
            .history_start
            .map(|d| {
                d.and_hms_opt(0, 0, 0)
                    .map(|dt| dt.and_utc())
                    .ok_or(PlannerError::CalendarOverflow("history start"))
            })
            .transpose()
    }
}

fn warehouse_step(
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    resolution: Resolution,
) -> Result<BackfillStep, PlannerError> {
    Ok(BackfillStep {
        kind: SourceKind::AnalyticsWarehouse,
        window: SyncWindow::new(from, to, resolution)?,
        historical: false,
        single_batch: false,
    })
}

fn floor_to(at: DateTime<Utc>, resolution: Resolution) -> Result<DateTime<Utc>, PlannerError> {
    at.duration_trunc(resolution.span())
        .map_err(|_| PlannerError::CalendarOverflow("truncating timestamp"))
}

fn start_of_day(at: DateTime<Utc>) -> Result<DateTime<Utc>, PlannerError> {
    floor_to(at, Resolution::Day)
}
