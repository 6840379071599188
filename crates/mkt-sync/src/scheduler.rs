use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use mkt_core::Cadence;
use tokio::sync::mpsc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::config::SyncConfig;
use crate::engine::{CycleError, SyncEngine};

/// At most one tick per cadence in flight.
#[derive(Debug, Clone, Default)]
pub struct TickGuard {
    running: Arc<AtomicBool>,
}

impl TickGuard {
    pub fn try_acquire(&self) -> Option<TickPermit> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| TickPermit {
                running: Arc::clone(&self.running),
            })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
pub struct TickPermit {
    running: Arc<AtomicBool>,
}

impl Drop for TickPermit {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Completed,
    Skipped,
    Failed,
}

/// Run one tick unless the previous tick of the same cadence is still going.
/// Failures are logged here; unrecoverable ones are forwarded on `fatal`.
pub async fn guarded_tick(
    engine: &Arc<SyncEngine>,
    cadence: Cadence,
    guard: &TickGuard,
    fatal: &mpsc::UnboundedSender<CycleError>,
) -> TickOutcome {
    let Some(_permit) = guard.try_acquire() else {
        warn!(%cadence, "previous tick still running, skipping");
        return TickOutcome::Skipped;
    };

    match engine.run_tick(cadence, Utc::now()).await {
        Ok(_) => TickOutcome::Completed,
        Err(err) if err.is_unrecoverable() => {
            error!(%cadence, error = %err, "unrecoverable tick failure");
            let _ = fatal.send(err);
            TickOutcome::Failed
        }
        Err(err) => {
            error!(%cadence, error = %err, "tick failed, waiting for next schedule");
            TickOutcome::Failed
        }
    }
}

pub struct CadenceScheduler {
    sched: JobScheduler,
    fatal_rx: mpsc::UnboundedReceiver<CycleError>,
}

impl CadenceScheduler {
    /// One cron job per cadence that has at least one provider.
    pub async fn build(engine: Arc<SyncEngine>, config: &SyncConfig) -> Result<Self> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();

        for cadence in Cadence::ALL {
            if engine.registry().for_cadence(cadence).next().is_none() {
                info!(%cadence, "no providers on cadence, only expiry runs");
            }
            let cron = config.cron_for(cadence);
            let guard = TickGuard::default();
            let engine = Arc::clone(&engine);
            let fatal_tx = fatal_tx.clone();

            let job = Job::new_async(cron, move |_uuid, _l| {
                let engine = Arc::clone(&engine);
                let guard = guard.clone();
                let fatal_tx = fatal_tx.clone();
                Box::pin(async move {
                    guarded_tick(&engine, cadence, &guard, &fatal_tx).await;
                })
            })
            .with_context(|| format!("creating {cadence} job for cron {cron}"))?;
            sched.add(job).await.context("adding scheduler job")?;
            info!(%cadence, cron, "scheduled");
        }

        Ok(Self { sched, fatal_rx })
    }

    /// Runs until Ctrl-C or an unrecoverable failure.
    pub async fn run_until_shutdown(mut self) -> Result<()> {
        self.sched.start().await.context("starting scheduler")?;

        let outcome = tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                signal.context("listening for ctrl-c")
            }
            Some(err) = self.fatal_rx.recv() => {
                Err(anyhow::Error::new(err).context("unrecoverable failure during tick"))
            }
        };

        if let Err(err) = self.sched.shutdown().await {
            warn!(error = %err, "scheduler shutdown failed");
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_admits_one_tick_at_a_time() {
        let guard = TickGuard::default();
        let first = guard.try_acquire().expect("first permit");
        assert!(guard.is_running());
        assert!(guard.clone().try_acquire().is_none());

        drop(first);
        assert!(!guard.is_running());
        assert!(guard.try_acquire().is_some());
    }
}
