use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use mkt_adapters::{adapter_for_source, AdapterTable, FetchRequest, ProviderAdapter, RecordIter};
use mkt_core::{chunk_targets, Batch, Cadence, ChunkConstraint, Record, SourceKind, SyncWindow};
use mkt_storage::{BackoffAction, BackoffPolicy, HttpFetcher, RecordStore, StoreError, TargetCatalog};
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{ProviderConfig, ProviderRegistry, SyncConfig};
use crate::planner::{PlannerError, WindowPlanner};
use crate::writer::{UpsertWriter, WriteError};

#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Planner(#[from] PlannerError),
    #[error("loading {kind} targets failed: {source}")]
    Catalog {
        kind: SourceKind,
        #[source]
        source: StoreError,
    },
    #[error(transparent)]
    Write(#[from] WriteError),
    #[error("record store failed: {0}")]
    Store(#[from] StoreError),
    #[error("provider task failed: {0}")]
    Task(String),
}

impl CycleError {
    /// Errors that should stop the process instead of waiting for the next tick.
    pub fn is_unrecoverable(&self) -> bool {
        match self {
            CycleError::Catalog { source, .. } => source.is_unrecoverable(),
            CycleError::Store(err) => err.is_unrecoverable(),
            CycleError::Write(err) => err.is_unrecoverable(),
            CycleError::Planner(_) | CycleError::Task(_) => false,
        }
    }
}

/// Progress through one provider window. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleState {
    pub kind: SourceKind,
    pub window: SyncWindow,
    pub exchange: Option<String>,
    pub batches: usize,
    pub batch_index: usize,
    pub errors: usize,
    pub fetched: usize,
    pub inserted: u64,
}

impl CycleState {
    fn new(kind: SourceKind, window: SyncWindow, exchange: Option<&str>, batches: usize) -> Self {
        Self {
            kind,
            window,
            exchange: exchange.map(str::to_string),
            batches,
            batch_index: 0,
            errors: 0,
            fetched: 0,
            inserted: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TickSummary {
    pub run_id: Uuid,
    pub cadence: Cadence,
    pub window: SyncWindow,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub windows: Vec<CycleState>,
    pub expired: u64,
}

impl TickSummary {
    pub fn inserted(&self) -> u64 {
        self.windows.iter().map(|w| w.inserted).sum()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BackfillSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Kinds that already had data and were left alone.
    pub skipped_kinds: Vec<SourceKind>,
    pub windows: Vec<CycleState>,
    pub failed_steps: Vec<FailedStep>,
}

/// A backfill step that aborted with a recoverable error.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedStep {
    pub kind: SourceKind,
    pub window: SyncWindow,
    pub error: String,
}

impl BackfillSummary {
    pub fn inserted(&self) -> u64 {
        self.windows.iter().map(|w| w.inserted).sum()
    }
}

pub struct SyncEngine {
    registry: ProviderRegistry,
    planner: WindowPlanner,
    adapters: AdapterTable,
    http: HttpFetcher,
    backoff: BackoffPolicy,
    catalog: Arc<dyn TargetCatalog>,
    store: Arc<dyn RecordStore>,
    writer: UpsertWriter,
}

impl SyncEngine {
    pub fn new(
        config: &SyncConfig,
        registry: ProviderRegistry,
        catalog: Arc<dyn TargetCatalog>,
        store: Arc<dyn RecordStore>,
    ) -> anyhow::Result<Self> {
        let planner = registry.planner.build().context("invalid planner settings")?;
        let http = HttpFetcher::new(config.http_client_config())?;

        let mut adapters = AdapterTable::new();
        for provider in registry.enabled() {
            let adapter = adapter_for_source(provider.kind, &provider.endpoint())
                .with_context(|| format!("building adapter for {}", provider.kind))?;
            adapters.insert(provider.kind, adapter);
        }

        Ok(Self {
            registry,
            planner,
            adapters,
            http,
            backoff: config.backoff_policy(),
            catalog,
            writer: UpsertWriter::new(Arc::clone(&store)),
            store,
        })
    }

    /// Replace the adapter registered for `adapter.kind()`.
    pub fn with_adapter(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.adapters.insert(adapter.kind(), adapter);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Startup backfill. Each source kind is backfilled only if the store holds
    /// no records of that kind; the check happens once, before any step runs.
    /// A step that fails recoverably is recorded and the remaining steps still
    /// run; only an unrecoverable store error ends the backfill early.
    #[tracing::instrument(skip(self))]
    pub async fn run_backfill(&self, now: DateTime<Utc>) -> Result<BackfillSummary, CycleError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let plan = self.planner.backfill(now)?;

        let mut has_data: BTreeMap<SourceKind, bool> = BTreeMap::new();
        for step in &plan {
            if self.registry.get(step.kind).is_none() || has_data.contains_key(&step.kind) {
                continue;
            }
            has_data.insert(step.kind, self.store.records_exist(step.kind).await?);
        }
        let skipped_kinds: Vec<SourceKind> = has_data
            .iter()
            .filter(|(_, exists)| **exists)
            .map(|(kind, _)| *kind)
            .collect();
        for kind in &skipped_kinds {
            info!(%run_id, source = %kind, "records present, backfill skipped");
        }

        let mut windows = Vec::new();
        let mut failed_steps = Vec::new();
        for step in &plan {
            let Some(provider) = self.registry.get(step.kind) else {
                debug!(source = %step.kind, "provider disabled, backfill step skipped");
                continue;
            };
            if has_data.get(&step.kind).copied().unwrap_or(true) {
                continue;
            }
            let chunk = if step.single_batch {
                ChunkConstraint::Count(usize::MAX)
            } else {
                provider.backfill_chunk()
            };
            match self
                .run_provider_window(provider, step.window, step.historical, chunk, run_id)
                .await
            {
                Ok(states) => windows.extend(states),
                Err(err) if err.is_unrecoverable() => return Err(err),
                Err(err) => {
                    error!(%run_id, source = %step.kind, window = %step.window, error = %err, "backfill step failed");
                    failed_steps.push(FailedStep {
                        kind: step.kind,
                        window: step.window,
                        error: err.to_string(),
                    });
                }
            }
        }

        let summary = BackfillSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            skipped_kinds,
            windows,
            failed_steps,
        };
        info!(
            %run_id,
            windows = summary.windows.len(),
            failed = summary.failed_steps.len(),
            inserted = summary.inserted(),
            "backfill complete"
        );
        Ok(summary)
    }

    /// One incremental tick: every provider on this cadence runs concurrently,
    /// then the expiry pass trims rows past their retention.
    #[tracing::instrument(skip(self))]
    pub async fn run_tick(
        self: &Arc<Self>,
        cadence: Cadence,
        now: DateTime<Utc>,
    ) -> Result<TickSummary, CycleError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let window = self.planner.incremental(cadence, now)?;

        let mut tasks = JoinSet::new();
        for provider in self.registry.for_cadence(cadence) {
            let provider_window = match provider.kind {
                SourceKind::StreamingIndex => self.planner.streaming_window(&window)?,
                _ => window,
            };
            let engine = Arc::clone(self);
            let provider = provider.clone();
            tasks.spawn(async move {
                engine
                    .run_provider_window(&provider, provider_window, false, provider.chunk, run_id)
                    .await
            });
        }

        let mut windows = Vec::new();
        let mut failure: Option<CycleError> = None;
        while let Some(joined) = tasks.join_next().await {
            let err = match joined {
                Ok(Ok(states)) => {
                    windows.extend(states);
                    continue;
                }
                Ok(Err(err)) => err,
                Err(join_err) => CycleError::Task(join_err.to_string()),
            };
            error!(%run_id, %cadence, error = %err, "provider window aborted");
            if !failure.as_ref().is_some_and(CycleError::is_unrecoverable) {
                failure = Some(err);
            }
        }
        if let Some(err) = failure {
            return Err(err);
        }
        windows.sort_by(|a, b| (a.kind, &a.exchange).cmp(&(b.kind, &b.exchange)));

        let expired = self.expire(now).await?;
        let summary = TickSummary {
            run_id,
            cadence,
            window,
            started_at,
            finished_at: Utc::now(),
            windows,
            expired,
        };
        info!(
            %run_id,
            %cadence,
            window = %summary.window,
            inserted = summary.inserted(),
            expired,
            "tick complete"
        );
        Ok(summary)
    }

    /// Sync one window for one provider outside the regular schedule.
    pub async fn sync_window(
        &self,
        kind: SourceKind,
        window: SyncWindow,
        historical: bool,
    ) -> Result<Vec<CycleState>, CycleError> {
        let Some(provider) = self.registry.get(kind) else {
            warn!(source = %kind, "no enabled provider for kind");
            return Ok(Vec::new());
        };
        self.run_provider_window(provider, window, historical, provider.chunk, Uuid::new_v4())
            .await
    }

    /// Delete rows older than their resolution's retention.
    pub async fn expire(&self, now: DateTime<Utc>) -> Result<u64, CycleError> {
        let mut deleted = 0;
        for filter in self.planner.expiry_filters(now) {
            let n = self.store.delete_where(&filter).await?;
            if n > 0 {
                debug!(resolution = ?filter.resolution, cutoff = %filter.date_to, deleted = n, "expired rows");
            }
            deleted += n;
        }
        Ok(deleted)
    }

    #[tracing::instrument(
        skip(self, provider, window, chunk),
        fields(source = %provider.kind, window = %window)
    )]
    async fn run_provider_window(
        &self,
        provider: &ProviderConfig,
        window: SyncWindow,
        historical: bool,
        chunk: ChunkConstraint,
        run_id: Uuid,
    ) -> Result<Vec<CycleState>, CycleError> {
        let Some(adapter) = self.adapters.get(&provider.kind).cloned() else {
            warn!("no adapter registered, window skipped");
            return Ok(Vec::new());
        };

        let mut targets = self
            .catalog
            .load_targets(provider.kind)
            .await
            .map_err(|source| CycleError::Catalog {
                kind: provider.kind,
                source,
            })?;
        targets.extend(provider.aggregate_target());
        if targets.is_empty() {
            info!("catalog returned no targets");
            return Ok(Vec::new());
        }

        let mut states = Vec::new();
        for exchange in provider.exchange_passes() {
            let batches = chunk_targets(targets.clone(), chunk);
            let state = self
                .run_window(adapter.as_ref(), provider, window, exchange, historical, batches)
                .await?;
            states.push(state);
        }
        Ok(states)
    }

    async fn run_window(
        &self,
        adapter: &dyn ProviderAdapter,
        provider: &ProviderConfig,
        window: SyncWindow,
        exchange: Option<&str>,
        historical: bool,
        batches: Vec<Batch>,
    ) -> Result<CycleState, CycleError> {
        let mut state = CycleState::new(provider.kind, window, exchange, batches.len());
        let pause = provider.pause_between_batches();

        for batch in &batches {
            state.batch_index = batch.index;
            if batch.index > 0 && !pause.is_zero() {
                tokio::time::sleep(pause).await;
            }

            let request = FetchRequest {
                window: &window,
                batch,
                exchange,
                historical,
                requested_at: Utc::now(),
            };
            let Some(records) = self.fetch_with_backoff(adapter, &request).await else {
                state.errors += 1;
                continue;
            };
            let records: Vec<Record> = records.collect();
            state.fetched += records.len();
            state.inserted += self.writer.write(records).await?;
        }

        info!(
            exchange = exchange.unwrap_or("-"),
            batches = state.batches,
            errors = state.errors,
            fetched = state.fetched,
            inserted = state.inserted,
            "window synced"
        );
        Ok(state)
    }

    async fn fetch_with_backoff(
        &self,
        adapter: &dyn ProviderAdapter,
        request: &FetchRequest<'_>,
    ) -> Option<RecordIter> {
        let mut retries_used = 0;
        loop {
            let err = match adapter.fetch(&self.http, request).await {
                Ok(records) => return Some(records),
                Err(err) => err,
            };

            let decision = self.backoff.decide(&err, retries_used);
            match decision.action {
                BackoffAction::Retry => {
                    warn!(
                        batch = request.batch.index,
                        class = ?decision.class,
                        delay_secs = decision.delay.as_secs(),
                        error = %err,
                        "provider request failed, retrying"
                    );
                    tokio::time::sleep(decision.delay).await;
                    retries_used += 1;
                }
                BackoffAction::Skip => {
                    warn!(
                        batch = request.batch.index,
                        retries_used,
                        error = %err,
                        "provider request failed, batch skipped"
                    );
                    return None;
                }
            }
        }
    }
}
