use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mkt_core::{DedupKey, Record, Resolution, SourceKind, SyncTarget};
use sqlx::postgres::{PgPool, PgPoolOptions, Postgres};
use sqlx::{QueryBuilder, Row};
use thiserror::Error;
use tokio::sync::Mutex;

/// Seven binds per row; keeps each statement well under Postgres' 65535 limit.
const INSERT_CHUNK_ROWS: usize = 1000;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Failures that no later tick can recover from without a restart.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, StoreError::Database(sqlx::Error::PoolClosed))
    }
}

/// Range/scope of a delete. `date_to` is exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteFilter {
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: DateTime<Utc>,
    pub kind: Option<SourceKind>,
    pub resolution: Option<Resolution>,
}

impl DeleteFilter {
    pub fn older_than(date_to: DateTime<Utc>) -> Self {
        Self {
            date_from: None,
            date_to,
            kind: None,
            resolution: None,
        }
    }

    pub fn at_resolution(mut self, resolution: Resolution) -> Self {
        self.resolution = Some(resolution);
        self
    }

    pub fn for_kind(mut self, kind: SourceKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn matches(&self, record: &Record) -> bool {
        record.observed_at < self.date_to
            && self.date_from.map_or(true, |from| record.observed_at >= from)
            && self.kind.map_or(true, |kind| record.kind == kind)
            && self.resolution.map_or(true, |res| record.resolution == res)
    }
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn records_exist(&self, kind: SourceKind) -> Result<bool, StoreError>;

    /// Insert-if-absent on (entity, timestamp, source). Returns newly inserted rows.
    async fn insert_ignoring_duplicates(&self, records: &[Record]) -> Result<u64, StoreError>;

    async fn delete_where(&self, filter: &DeleteFilter) -> Result<u64, StoreError>;
}

/// Read-only lookup of sync targets per provider family.
#[async_trait]
pub trait TargetCatalog: Send + Sync {
    async fn load_targets(&self, kind: SourceKind) -> Result<Vec<SyncTarget>, StoreError>;
}

#[derive(Debug, Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn records_exist(&self, kind: SourceKind) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT EXISTS (SELECT 1 FROM market_records WHERE kind = $1) AS present")
            .bind(kind.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("present")?)
    }

    async fn insert_ignoring_duplicates(&self, records: &[Record]) -> Result<u64, StoreError> {
        let mut inserted = 0u64;
        for chunk in records.chunks(INSERT_CHUNK_ROWS) {
            let mut qb = QueryBuilder::<Postgres>::new(
                "INSERT INTO market_records (entity_id, observed_at, source, kind, resolution, value, payload) ",
            );
            qb.push_values(chunk, |mut b, r| {
                b.push_bind(r.entity.as_str())
                    .push_bind(r.observed_at)
                    .push_bind(r.source.as_str())
                    .push_bind(r.kind.as_str())
                    .push_bind(r.resolution.as_str())
                    .push_bind(r.value)
                    .push_bind(r.payload.clone());
            });
            qb.push(" ON CONFLICT (entity_id, observed_at, source) DO NOTHING");

            inserted += qb.build().execute(&self.pool).await?.rows_affected();
        }
        Ok(inserted)
    }

    async fn delete_where(&self, filter: &DeleteFilter) -> Result<u64, StoreError> {
        let mut qb = QueryBuilder::<Postgres>::new("DELETE FROM market_records WHERE observed_at < ");
        qb.push_bind(filter.date_to);
        if let Some(from) = filter.date_from {
            qb.push(" AND observed_at >= ");
            qb.push_bind(from);
        }
        if let Some(kind) = filter.kind {
            qb.push(" AND kind = ");
            qb.push_bind(kind.as_str());
        }
        if let Some(resolution) = filter.resolution {
            qb.push(" AND resolution = ");
            qb.push_bind(resolution.as_str());
        }
        Ok(qb.build().execute(&self.pool).await?.rows_affected())
    }
}

/// Catalog backed by the application's relational schema.
#[derive(Debug, Clone)]
pub struct PgCatalog {
    pool: PgPool,
}

impl PgCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TargetCatalog for PgCatalog {
    async fn load_targets(&self, kind: SourceKind) -> Result<Vec<SyncTarget>, StoreError> {
        let sql = match kind {
            SourceKind::PriceIndex => {
                "SELECT uid AS id, uid AS reference FROM coins WHERE uid IS NOT NULL ORDER BY uid"
            }
            SourceKind::ProtocolTvl => {
                r#"
                SELECT id::text AS id, defillama_id AS reference
                  FROM defi_protocols
                 WHERE defillama_id IS NOT NULL
                 ORDER BY id
                "#
            }
            SourceKind::AnalyticsWarehouse => {
                r#"
                SELECT id::text AS id, LOWER(address) AS reference
                  FROM platforms
                 WHERE type = 'erc20' AND address IS NOT NULL
                 ORDER BY id
                "#
            }
            SourceKind::StreamingIndex => {
                r#"
                SELECT id::text AS id, LOWER(address) AS reference
                  FROM platforms
                 WHERE type = 'bep20' AND address IS NOT NULL
                 ORDER BY id
                "#
            }
        };

        let rows = sqlx::query(sql).fetch_all(&self.pool).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(SyncTarget::new(
                row.try_get::<String, _>("id")?,
                row.try_get::<String, _>("reference")?,
            ));
        }
        Ok(out)
    }
}

/// In-process store keyed by the dedup key. Used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    rows: Mutex<BTreeMap<DedupKey, Record>>,
    unavailable: AtomicBool,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a lost connection: every subsequent call fails until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    pub async fn records(&self) -> Vec<Record> {
        self.rows.lock().await.values().cloned().collect()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store marked unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn records_exist(&self, kind: SourceKind) -> Result<bool, StoreError> {
        self.check_available()?;
        Ok(self.rows.lock().await.values().any(|r| r.kind == kind))
    }

    async fn insert_ignoring_duplicates(&self, records: &[Record]) -> Result<u64, StoreError> {
        self.check_available()?;
        let mut rows = self.rows.lock().await;
        let mut inserted = 0u64;
        for record in records {
            if let std::collections::btree_map::Entry::Vacant(slot) = rows.entry(record.dedup_key()) {
                slot.insert(record.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn delete_where(&self, filter: &DeleteFilter) -> Result<u64, StoreError> {
        self.check_available()?;
        let mut rows = self.rows.lock().await;
        let before = rows.len();
        rows.retain(|_, record| !filter.matches(record));
        Ok((before - rows.len()) as u64)
    }
}

#[derive(Debug, Default, Clone)]
pub struct StaticCatalog {
    targets: HashMap<SourceKind, Vec<SyncTarget>>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_targets(mut self, kind: SourceKind, targets: Vec<SyncTarget>) -> Self {
        self.targets.insert(kind, targets);
        self
    }
}

#[async_trait]
impl TargetCatalog for StaticCatalog {
    async fn load_targets(&self, kind: SourceKind) -> Result<Vec<SyncTarget>, StoreError> {
        Ok(self.targets.get(&kind).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn record(entity: &str, hour: u32, source: &str, resolution: Resolution) -> Record {
        Record {
            entity: entity.to_string(),
            observed_at: Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap(),
            source: source.to_string(),
            kind: SourceKind::AnalyticsWarehouse,
            resolution,
            value: 10.0,
            payload: None,
        }
    }

    #[tokio::test]
    async fn memory_store_ignores_existing_keys() {
        let store = MemoryRecordStore::new();
        let first = vec![record("1", 0, "sushi", Resolution::Hour)];
        assert_eq!(store.insert_ignoring_duplicates(&first).await.unwrap(), 1);

        let mut changed = first.clone();
        changed[0].value = 99.0;
        changed.push(record("1", 0, "uniswap_v2", Resolution::Hour));
        assert_eq!(store.insert_ignoring_duplicates(&changed).await.unwrap(), 1);

        let rows = store.records().await;
        assert_eq!(rows.len(), 2);
        let sushi = rows.iter().find(|r| r.source == "sushi").unwrap();
        assert_eq!(sushi.value, 10.0, "existing row must not be overwritten");
    }

    #[tokio::test]
    async fn delete_filter_scopes_by_resolution_and_range() {
        let store = MemoryRecordStore::new();
        store
            .insert_ignoring_duplicates(&[
                record("1", 0, "sushi", Resolution::Hour),
                record("1", 5, "sushi", Resolution::Hour),
                record("2", 0, "sushi", Resolution::Day),
            ])
            .await
            .unwrap();

        let cutoff = Utc.with_ymd_and_hms(2024, 1, 1, 3, 0, 0).unwrap();
        let removed = store
            .delete_where(&DeleteFilter::older_than(cutoff).at_resolution(Resolution::Hour))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.len().await, 2);

        let filter = DeleteFilter {
            date_from: Some(cutoff),
            date_to: cutoff + Duration::hours(3),
            kind: Some(SourceKind::PriceIndex),
            resolution: None,
        };
        assert_eq!(store.delete_where(&filter).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unavailable_store_reports_errors() {
        let store = MemoryRecordStore::new();
        store.set_unavailable(true);
        let err = store
            .records_exist(SourceKind::PriceIndex)
            .await
            .expect_err("unavailable");
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert!(!err.is_unrecoverable());
    }

    #[tokio::test]
    async fn static_catalog_returns_empty_for_unknown_kind() {
        let catalog = StaticCatalog::new().with_targets(
            SourceKind::PriceIndex,
            vec![SyncTarget::new("bitcoin", "bitcoin")],
        );
        assert_eq!(catalog.load_targets(SourceKind::PriceIndex).await.unwrap().len(), 1);
        assert!(catalog.load_targets(SourceKind::StreamingIndex).await.unwrap().is_empty());
    }
}
