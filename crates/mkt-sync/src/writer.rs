use std::sync::Arc;

use mkt_core::Record;
use mkt_storage::{RecordStore, StoreError};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("record store write failed: {0}")]
    Store(#[from] StoreError),
}

impl WriteError {
    pub fn is_unrecoverable(&self) -> bool {
        match self {
            WriteError::Store(err) => err.is_unrecoverable(),
        }
    }
}

/// A record whose dedup key is incomplete. Logged and dropped, never raised.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("malformed record: empty {field} (entity={entity:?}, source={source_tag:?})")]
pub struct MalformedRecord {
    pub field: &'static str,
    pub entity: String,
    pub source_tag: String,
}

impl MalformedRecord {
    pub fn check(record: &Record) -> Result<(), MalformedRecord> {
        match record.missing_key_field() {
            Some(field) => Err(MalformedRecord {
                field,
                entity: record.entity.clone(),
                source_tag: record.source.clone(),
            }),
            None => Ok(()),
        }
    }
}

/// Insert-if-absent persistence. Rows already present under the same
/// (entity, timestamp, source) key are left untouched.
#[derive(Clone)]
pub struct UpsertWriter {
    store: Arc<dyn RecordStore>,
}

impl UpsertWriter {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Returns how many rows were actually inserted.
    pub async fn write<I>(&self, records: I) -> Result<u64, WriteError>
    where
        I: IntoIterator<Item = Record>,
    {
        let mut dropped = 0usize;
        let valid: Vec<Record> = records
            .into_iter()
            .filter(|record| match MalformedRecord::check(record) {
                Ok(()) => true,
                Err(err) => {
                    warn!(error = %err, "dropping record");
                    dropped += 1;
                    false
                }
            })
            .collect();

        if valid.is_empty() {
            debug!(dropped, "nothing to write");
            return Ok(0);
        }

        let inserted = self.store.insert_ignoring_duplicates(&valid).await?;
        debug!(
            offered = valid.len(),
            inserted,
            dropped,
            "records written"
        );
        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use mkt_core::{Resolution, SourceKind};
    use mkt_storage::MemoryRecordStore;

    fn hourly_rows(entities: &[&str]) -> Vec<Record> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        entities
            .iter()
            .flat_map(|entity| {
                (0..24).map(move |h| Record {
                    entity: (*entity).to_string(),
                    observed_at: start + Duration::hours(h),
                    source: "uniswap_v2".into(),
                    kind: SourceKind::AnalyticsWarehouse,
                    resolution: Resolution::Hour,
                    value: 10.0 + h as f64,
                    payload: None,
                })
            })
            .collect()
    }

    #[tokio::test]
    async fn second_write_of_same_rows_inserts_nothing() {
        let store = Arc::new(MemoryRecordStore::new());
        let writer = UpsertWriter::new(store.clone());
        let rows = hourly_rows(&["1", "2", "3"]);

        assert_eq!(writer.write(rows.clone()).await.unwrap(), 72);
        assert_eq!(writer.write(rows).await.unwrap(), 0);
        assert_eq!(store.len().await, 72);
    }

    #[tokio::test]
    async fn existing_rows_are_not_overwritten() {
        let store = Arc::new(MemoryRecordStore::new());
        let writer = UpsertWriter::new(store.clone());
        let mut rows = hourly_rows(&["1"]);
        writer.write(rows.clone()).await.unwrap();

        rows[0].value = -1.0;
        assert_eq!(writer.write(rows).await.unwrap(), 0);
        let stored = store.records().await;
        assert!(stored.iter().all(|r| r.value >= 10.0));
    }

    #[tokio::test]
    async fn malformed_records_are_dropped_and_empty_input_is_a_noop() {
        let store = Arc::new(MemoryRecordStore::new());
        store.set_unavailable(true);
        let writer = UpsertWriter::new(store.clone());

        assert_eq!(writer.write(Vec::new()).await.unwrap(), 0);

        let mut rows = hourly_rows(&["1"]);
        for row in &mut rows {
            row.source = " ".into();
        }
        assert_eq!(writer.write(rows).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn store_failures_surface_as_write_errors() {
        let store = Arc::new(MemoryRecordStore::new());
        store.set_unavailable(true);
        let writer = UpsertWriter::new(store);

        let err = writer.write(hourly_rows(&["1"])).await.unwrap_err();
        assert!(matches!(err, WriteError::Store(StoreError::Unavailable(_))));
        assert!(!err.is_unrecoverable());
    }

    #[test]
    fn malformed_check_names_the_blank_field() {
        let mut row = hourly_rows(&["1"]).remove(0);
        row.entity.clear();
        let err = MalformedRecord::check(&row).unwrap_err();
        assert_eq!(err.field, "entity");
        assert_eq!(err.source_tag, "uniswap_v2");
        assert!(err.to_string().contains("source=\"uniswap_v2\""));
    }
}
