//! Sync orchestration: window planning, the backoff-guarded batch loop, and the cadence scheduler.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use mkt_core::Cadence;
use mkt_storage::{PgCatalog, PgRecordStore};
use sqlx::migrate::Migrator;
use sqlx::PgPool;
use tracing::info;

mod config;
mod engine;
mod planner;
mod scheduler;
mod writer;

pub use config::{PlannerSettings, ProviderConfig, ProviderRegistry, SyncConfig, REGISTRY_FILE};
pub use engine::{BackfillSummary, CycleError, CycleState, FailedStep, SyncEngine, TickSummary};
pub use planner::{BackfillSpans, BackfillStep, PlannerError, RetentionPolicy, WindowPlanner};
pub use scheduler::{guarded_tick, CadenceScheduler, TickGuard, TickOutcome, TickPermit};
pub use writer::{MalformedRecord, UpsertWriter, WriteError};

pub const CRATE_NAME: &str = "mkt-sync";

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

/// Engine wired to Postgres from `SyncConfig::from_env()` and the workspace `providers.yaml`.
pub struct Runtime {
    pub config: SyncConfig,
    pub engine: Arc<SyncEngine>,
    pub pool: PgPool,
}

impl Runtime {
    pub async fn from_env() -> Result<Self> {
        let config = SyncConfig::from_env();
        let registry = ProviderRegistry::load(&config.registry_path()).await?;

        let store = PgRecordStore::connect(&config.database_url, config.db_max_connections)
            .await
            .context("connecting to database")?;
        let pool = store.pool().clone();
        let catalog = PgCatalog::new(pool.clone());

        let engine = SyncEngine::new(&config, registry, Arc::new(catalog), Arc::new(store))?;
        Ok(Self {
            config,
            engine: Arc::new(engine),
            pool,
        })
    }

    pub async fn migrate(&self) -> Result<()> {
        MIGRATOR.run(&self.pool).await.context("applying migrations")
    }
}

pub async fn migrate_from_env() -> Result<()> {
    let config = SyncConfig::from_env();
    let store = PgRecordStore::connect(&config.database_url, config.db_max_connections)
        .await
        .context("connecting to database")?;
    MIGRATOR.run(store.pool()).await.context("applying migrations")?;
    info!("migrations applied");
    Ok(())
}

pub async fn run_backfill_from_env() -> Result<BackfillSummary> {
    let runtime = Runtime::from_env().await?;
    runtime.migrate().await?;
    Ok(runtime.engine.run_backfill(Utc::now()).await?)
}

pub async fn run_tick_from_env(cadence: Cadence) -> Result<TickSummary> {
    let runtime = Runtime::from_env().await?;
    Ok(runtime.engine.run_tick(cadence, Utc::now()).await?)
}

/// Backfill to completion, then tick on every cadence until shutdown.
pub async fn run_forever_from_env() -> Result<()> {
    let runtime = Runtime::from_env().await?;
    runtime.migrate().await?;

    let summary = runtime
        .engine
        .run_backfill(Utc::now())
        .await
        .context("startup backfill")?;
    info!(
        run_id = %summary.run_id,
        inserted = summary.inserted(),
        skipped = ?summary.skipped_kinds,
        failed = summary.failed_steps.len(),
        "startup backfill finished"
    );

    if !runtime.config.scheduler_enabled {
        info!("scheduler disabled, exiting after backfill");
        return Ok(());
    }

    CadenceScheduler::build(Arc::clone(&runtime.engine), &runtime.config)
        .await?
        .run_until_shutdown()
        .await
}

/// The backfill plan for `now`, from the workspace registry's planner settings.
pub async fn backfill_plan_from_env(now: DateTime<Utc>) -> Result<Vec<BackfillStep>> {
    let config = SyncConfig::from_env();
    let registry = ProviderRegistry::load(&config.registry_path()).await?;
    let planner = registry.planner.build()?;
    Ok(planner
        .backfill(now)?
        .into_iter()
        .filter(|step| registry.get(step.kind).is_some())
        .collect())
}
