//! Core domain model for the market data sync engine: targets, windows, records, batching.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "mkt-core";

/// Time granularity at which a window is fetched and retained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Resolution {
    #[serde(rename = "1h")]
    Hour,
    #[serde(rename = "4h")]
    FourHours,
    #[serde(rename = "1d")]
    Day,
}

impl Resolution {
    pub const ALL: [Resolution; 3] = [Resolution::Hour, Resolution::FourHours, Resolution::Day];

    pub fn as_str(self) -> &'static str {
        match self {
            Resolution::Hour => "1h",
            Resolution::FourHours => "4h",
            Resolution::Day => "1d",
        }
    }

    /// Width of one bucket at this resolution.
    pub fn span(self) -> Duration {
        match self {
            Resolution::Hour => Duration::hours(1),
            Resolution::FourHours => Duration::hours(4),
            Resolution::Day => Duration::days(1),
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown resolution or cadence `{0}` (expected 1h, 4h or 1d)")]
pub struct ParseResolutionError(String);

impl FromStr for Resolution {
    type Err = ParseResolutionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "1h" => Ok(Resolution::Hour),
            "4h" => Ok(Resolution::FourHours),
            "1d" => Ok(Resolution::Day),
            other => Err(ParseResolutionError(other.to_string())),
        }
    }
}

/// Recurring interval at which an incremental tick fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Cadence {
    #[serde(rename = "1h")]
    Hourly,
    #[serde(rename = "4h")]
    FourHourly,
    #[serde(rename = "1d")]
    Daily,
}

impl Cadence {
    pub const ALL: [Cadence; 3] = [Cadence::Hourly, Cadence::FourHourly, Cadence::Daily];

    pub fn resolution(self) -> Resolution {
        match self {
            Cadence::Hourly => Resolution::Hour,
            Cadence::FourHourly => Resolution::FourHours,
            Cadence::Daily => Resolution::Day,
        }
    }

    pub fn interval(self) -> Duration {
        self.resolution().span()
    }

    pub fn as_str(self) -> &'static str {
        self.resolution().as_str()
    }

    /// Six-field cron expression (seconds first). Offsets keep cadences from
    /// firing in the same second.
    pub fn default_cron(self) -> &'static str {
        match self {
            Cadence::Hourly => "0 0 * * * *",
            Cadence::FourHourly => "0 5 */4 * * *",
            Cadence::Daily => "0 10 0 * * *",
        }
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Cadence {
    type Err = ParseResolutionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.parse::<Resolution>()? {
            Resolution::Hour => Cadence::Hourly,
            Resolution::FourHours => Cadence::FourHourly,
            Resolution::Day => Cadence::Daily,
        })
    }
}

/// Closed set of upstream provider families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    PriceIndex,
    ProtocolTvl,
    AnalyticsWarehouse,
    StreamingIndex,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::PriceIndex => "price_index",
            SourceKind::ProtocolTvl => "protocol_tvl",
            SourceKind::AnalyticsWarehouse => "analytics_warehouse",
            SourceKind::StreamingIndex => "streaming_index",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An entity to sync, loaded from the catalog for the lifetime of one cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncTarget {
    /// Stable identifier that records are persisted under.
    pub id: String,
    /// Provider-facing reference (coin uid, token address, protocol slug).
    pub reference: String,
    #[serde(default)]
    pub weight: Option<u64>,
}

impl SyncTarget {
    pub fn new(id: impl Into<String>, reference: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            reference: reference.into(),
            weight: None,
        }
    }

    pub fn with_weight(mut self, weight: u64) -> Self {
        self.weight = Some(weight);
        self
    }

    /// Weight hint, falling back to the reference length since identifiers
    /// travel in the request line/headers.
    pub fn weight(&self) -> u64 {
        self.weight.unwrap_or(self.reference.len() as u64)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("window start {date_from} is not before end {date_to}")]
pub struct InvalidWindow {
    pub date_from: DateTime<Utc>,
    pub date_to: DateTime<Utc>,
}

/// Half-open `[date_from, date_to)` range plus resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncWindow {
    date_from: DateTime<Utc>,
    date_to: DateTime<Utc>,
    resolution: Resolution,
}

impl SyncWindow {
    pub fn new(
        date_from: DateTime<Utc>,
        date_to: DateTime<Utc>,
        resolution: Resolution,
    ) -> Result<Self, InvalidWindow> {
        if date_from >= date_to {
            return Err(InvalidWindow { date_from, date_to });
        }
        Ok(Self {
            date_from,
            date_to,
            resolution,
        })
    }

    pub fn date_from(&self) -> DateTime<Utc> {
        self.date_from
    }

    pub fn date_to(&self) -> DateTime<Utc> {
        self.date_to
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.date_from && at < self.date_to
    }
}

impl fmt::Display for SyncWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{} .. {}) @{}",
            self.date_from.format("%Y-%m-%dT%H:%M"),
            self.date_to.format("%Y-%m-%dT%H:%M"),
            self.resolution
        )
    }
}

/// One provider call's worth of targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub index: usize,
    pub targets: Vec<SyncTarget>,
}

impl Batch {
    pub fn weight(&self) -> u64 {
        self.targets.iter().map(SyncTarget::weight).sum()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn references(&self) -> impl Iterator<Item = &str> {
        self.targets.iter().map(|t| t.reference.as_str())
    }
}

/// A single ingested observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub entity: String,
    pub observed_at: DateTime<Utc>,
    /// Exchange or provider tag; third component of the dedup key.
    pub source: String,
    pub kind: SourceKind,
    pub resolution: Resolution,
    pub value: f64,
    #[serde(default)]
    pub payload: Option<JsonValue>,
}

/// Identity of a persisted record: (entity, timestamp in ms, source).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DedupKey {
    pub entity: String,
    pub observed_at_ms: i64,
    pub source: String,
}

impl Record {
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            entity: self.entity.clone(),
            observed_at_ms: self.observed_at.timestamp_millis(),
            source: self.source.clone(),
        }
    }

    /// First dedup-key field that is blank, if any.
    pub fn missing_key_field(&self) -> Option<&'static str> {
        if self.entity.trim().is_empty() {
            Some("entity")
        } else if self.source.trim().is_empty() {
            Some("source")
        } else {
            None
        }
    }
}

/// Provider-specific batching limit. Written as `{ count: N }` or `{ max_weight: N }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ChunkSpec", into = "ChunkSpec")]
pub enum ChunkConstraint {
    Count(usize),
    Weight(u64),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChunkSpecError {
    #[error("chunk needs one of `count` or `max_weight`")]
    Missing,
    #[error("chunk sets both `count` and `max_weight`")]
    Ambiguous,
}

/// Plain-map form of [`ChunkConstraint`], identical across serde formats.
#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChunkSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max_weight: Option<u64>,
}

impl TryFrom<ChunkSpec> for ChunkConstraint {
    type Error = ChunkSpecError;

    fn try_from(spec: ChunkSpec) -> Result<Self, Self::Error> {
        match (spec.count, spec.max_weight) {
            (Some(n), None) => Ok(ChunkConstraint::Count(n)),
            (None, Some(max)) => Ok(ChunkConstraint::Weight(max)),
            (Some(_), Some(_)) => Err(ChunkSpecError::Ambiguous),
            (None, None) => Err(ChunkSpecError::Missing),
        }
    }
}

impl From<ChunkConstraint> for ChunkSpec {
    fn from(constraint: ChunkConstraint) -> Self {
        match constraint {
            ChunkConstraint::Count(n) => ChunkSpec { count: Some(n), max_weight: None },
            ChunkConstraint::Weight(max) => ChunkSpec { count: None, max_weight: Some(max) },
        }
    }
}

impl ChunkConstraint {
    /// Whether `batch` respects this constraint. Over-limit singletons are allowed.
    pub fn admits(&self, batch: &Batch) -> bool {
        match *self {
            ChunkConstraint::Count(n) => batch.len() <= n.max(1),
            ChunkConstraint::Weight(max) => batch.len() == 1 || batch.weight() <= max,
        }
    }
}

/// Partition `targets` into ordered batches; every target lands in exactly one batch.
pub fn chunk_targets(targets: Vec<SyncTarget>, constraint: ChunkConstraint) -> Vec<Batch> {
    let groups = match constraint {
        ChunkConstraint::Count(n) => chunk_by_count(targets, n.max(1)),
        ChunkConstraint::Weight(max) => chunk_by_weight(targets, max),
    };
    groups
        .into_iter()
        .enumerate()
        .map(|(index, targets)| Batch { index, targets })
        .collect()
}

fn chunk_by_count(targets: Vec<SyncTarget>, size: usize) -> Vec<Vec<SyncTarget>> {
    let mut out: Vec<Vec<SyncTarget>> = Vec::with_capacity(targets.len().div_ceil(size));
    for target in targets {
        match out.last_mut() {
            Some(last) if last.len() < size => last.push(target),
            _ => out.push(vec![target]),
        }
    }
    out
}

fn chunk_by_weight(targets: Vec<SyncTarget>, max_weight: u64) -> Vec<Vec<SyncTarget>> {
    let mut out = Vec::new();
    let mut current: Vec<SyncTarget> = Vec::new();
    let mut current_weight = 0u64;

    for target in targets {
        let weight = target.weight();
        if !current.is_empty() && current_weight.saturating_add(weight) > max_weight {
            out.push(std::mem::take(&mut current));
            current_weight = 0;
        }
        current_weight = current_weight.saturating_add(weight);
        current.push(target);
    }

    if !current.is_empty() {
        out.push(current);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn targets(weights: &[u64]) -> Vec<SyncTarget> {
        weights
            .iter()
            .enumerate()
            .map(|(i, w)| SyncTarget::new(format!("t{i}"), format!("ref-{i}")).with_weight(*w))
            .collect()
    }

    fn ids(batches: &[Batch]) -> Vec<Vec<String>> {
        batches
            .iter()
            .map(|b| b.targets.iter().map(|t| t.id.clone()).collect())
            .collect()
    }

    #[test]
    fn count_chunking_partitions_in_order() {
        let input = targets(&[1; 7]);
        let batches = chunk_targets(input.clone(), ChunkConstraint::Count(3));
        assert_eq!(batches.len(), 3);
        assert_eq!(batches.iter().map(Batch::len).collect::<Vec<_>>(), vec![3, 3, 1]);
        let flattened: Vec<_> = batches.iter().flat_map(|b| b.targets.clone()).collect();
        assert_eq!(flattened, input);
        assert_eq!(batches[2].index, 2);
    }

    #[test]
    fn zero_count_is_treated_as_one() {
        let batches = chunk_targets(targets(&[1, 1]), ChunkConstraint::Count(0));
        assert_eq!(batches.len(), 2);
    }

    #[test]
    fn oversized_target_is_isolated_not_dropped() {
        let batches = chunk_targets(targets(&[10, 10, 500, 10, 10]), ChunkConstraint::Weight(100));
        assert_eq!(
            ids(&batches),
            vec![
                vec!["t0".to_string(), "t1".to_string()],
                vec!["t2".to_string()],
                vec!["t3".to_string(), "t4".to_string()],
            ]
        );
    }

    #[test]
    fn weight_chunking_respects_ceiling_and_covers_everything() {
        let weights = [7, 3, 9, 1, 1, 12, 4, 4, 4, 30, 2, 8];
        let constraint = ChunkConstraint::Weight(12);
        let input = targets(&weights);
        let batches = chunk_targets(input.clone(), constraint);

        assert!(batches.iter().all(|b| constraint.admits(b)));
        let flattened: Vec<_> = batches.iter().flat_map(|b| b.targets.clone()).collect();
        assert_eq!(flattened, input);
    }

    #[test]
    fn weight_defaults_to_reference_length() {
        let target = SyncTarget::new("bitcoin", "bitcoin");
        assert_eq!(target.weight(), 7);
        let batches = chunk_targets(
            vec![
                SyncTarget::new("a", "aaaa"),
                SyncTarget::new("b", "bbbb"),
                SyncTarget::new("c", "cccc"),
            ],
            ChunkConstraint::Weight(8),
        );
        assert_eq!(batches.len(), 2);
    }

    #[test]
    fn chunk_constraint_reads_plain_maps() {
        let count: ChunkConstraint = serde_json::from_str(r#"{"count":3}"#).unwrap();
        assert_eq!(count, ChunkConstraint::Count(3));
        let weight: ChunkConstraint = serde_json::from_str(r#"{"max_weight":6000}"#).unwrap();
        assert_eq!(weight, ChunkConstraint::Weight(6000));
        assert_eq!(serde_json::to_string(&weight).unwrap(), r#"{"max_weight":6000}"#);

        assert!(serde_json::from_str::<ChunkConstraint>(r#"{"count":3,"max_weight":10}"#).is_err());
        assert!(serde_json::from_str::<ChunkConstraint>("{}").is_err());
        assert!(serde_json::from_str::<ChunkConstraint>(r#"{"size":3}"#).is_err());
    }

    #[test]
    fn window_rejects_empty_range() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert!(SyncWindow::new(at, at, Resolution::Hour).is_err());
        let window = SyncWindow::new(at, at + Duration::hours(1), Resolution::Hour).unwrap();
        assert!(window.contains(at));
        assert!(!window.contains(at + Duration::hours(1)));
    }

    #[test]
    fn resolution_and_cadence_parse() {
        assert_eq!("4h".parse::<Resolution>().unwrap(), Resolution::FourHours);
        assert_eq!("1d".parse::<Cadence>().unwrap(), Cadence::Daily);
        assert!("2h".parse::<Cadence>().is_err());
        assert_eq!(Cadence::Hourly.interval(), Duration::hours(1));
    }

    #[test]
    fn dedup_key_ignores_value_and_resolution() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 5, 0, 0).unwrap();
        let a = Record {
            entity: "42".into(),
            observed_at: at,
            source: "uniswap_v2".into(),
            kind: SourceKind::AnalyticsWarehouse,
            resolution: Resolution::Hour,
            value: 1.0,
            payload: None,
        };
        let b = Record {
            value: 2.0,
            resolution: Resolution::FourHours,
            ..a.clone()
        };
        assert_eq!(a.dedup_key(), b.dedup_key());
        assert_eq!(Record { entity: " ".into(), ..a }.missing_key_field(), Some("entity"));
    }
}
