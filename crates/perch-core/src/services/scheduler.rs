//! Scheduled sync
//!
//! Drives the sync engine on a single repeating timer. One timer, one
//! in-flight run at most: the engine's own guard rejects overlap, and a tick
//! that lands inside an API cooldown records a skipped run without touching
//! the network. Stopping prevents future ticks but never aborts a run
//! already in flight; callers needing a hard stop pair this with a
//! process-level timeout.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{interval, Duration};

use crate::api::SocialApi;
use crate::error::{Error, Result};
use crate::models::SyncRun;

use super::quota::QuotaStatus;
use super::sync::SyncEngine;

/// Snapshot of the scheduler for monitoring
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    /// Whether a sync run is currently in flight
    pub running: bool,
    /// Whether the repeating timer is active
    pub scheduled: bool,
    /// Last completed run timestamp (ISO 8601)
    pub last_run_at: Option<String>,
    /// Next scheduled run timestamp (ISO 8601)
    pub next_run_at: Option<String>,
    pub quota: QuotaStatus,
}

#[derive(Debug, Default)]
struct SchedulerState {
    scheduled: bool,
    last_run_at: Option<String>,
    next_run_at: Option<String>,
}

/// Repeating-timer driver for a [`SyncEngine`]
pub struct SyncScheduler<A: SocialApi + 'static> {
    engine: Arc<SyncEngine<A>>,
    state: Arc<RwLock<SchedulerState>>,
    shutdown_tx: Mutex<Option<tokio::sync::oneshot::Sender<()>>>,
}

impl<A: SocialApi + 'static> SyncScheduler<A> {
    pub fn new(engine: Arc<SyncEngine<A>>) -> Self {
        Self {
            engine,
            state: Arc::new(RwLock::new(SchedulerState::default())),
            shutdown_tx: Mutex::new(None),
        }
    }

    /// Access the driven engine
    pub fn engine(&self) -> &Arc<SyncEngine<A>> {
        &self.engine
    }

    /// Start the repeating timer. A no-op when already started.
    pub async fn start(&self, every: Duration) {
        {
            let state = self.state.read().await;
            if state.scheduled {
                log::info!("Sync scheduler is already running");
                return;
            }
        }

        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        {
            let mut tx = self.shutdown_tx.lock().await;
            *tx = Some(shutdown_tx);
        }

        {
            let mut state = self.state.write().await;
            state.scheduled = true;
            state.next_run_at = Some(next_run_timestamp(every));
        }

        log::info!("Starting sync scheduler with {:?} interval", every);

        let engine = Arc::clone(&self.engine);
        let state = Arc::clone(&self.state);

        tokio::spawn(async move {
            let mut timer = interval(every);

            // Skip the first tick (immediate)
            timer.tick().await;

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        Self::run_tick(&engine, &state).await;

                        let mut st = state.write().await;
                        st.next_run_at = Some(next_run_timestamp(every));
                    }
                    _ = &mut shutdown_rx => {
                        log::info!("Sync scheduler received shutdown signal");
                        break;
                    }
                }
            }

            let mut st = state.write().await;
            st.scheduled = false;
            st.next_run_at = None;
            log::info!("Sync scheduler stopped");
        });
    }

    async fn run_tick(engine: &Arc<SyncEngine<A>>, state: &Arc<RwLock<SchedulerState>>) {
        // A tick inside the cooldown must not issue any external call
        if engine.in_cooldown().await {
            log::warn!("Scheduled sync skipped: API cooldown still active");
            if let Err(e) = engine.record_skipped_run().await {
                log::error!("Failed to record skipped run: {}", e);
            }
            return;
        }

        match engine.run_once().await {
            Ok(run) => {
                let mut st = state.write().await;
                st.last_run_at = Some(run.finished_at.to_rfc3339());
            }
            Err(Error::SyncInProgress) => {
                log::warn!("Scheduled sync skipped: previous run still in flight");
            }
            Err(e) => {
                log::error!("Scheduled sync failed: {}", e);
            }
        }
    }

    /// Stop future scheduled runs. An in-flight run finishes naturally.
    pub async fn stop(&self) {
        let tx = {
            let mut guard = self.shutdown_tx.lock().await;
            guard.take()
        };

        if let Some(tx) = tx {
            let _ = tx.send(());
            log::info!("Sent shutdown signal to sync scheduler");
        }

        let mut state = self.state.write().await;
        state.scheduled = false;
        state.next_run_at = None;
    }

    /// Trigger an immediate run, subject to the engine's in-flight guard
    pub async fn run_now(&self) -> Result<SyncRun> {
        let run = self.engine.run_once().await?;
        let mut state = self.state.write().await;
        state.last_run_at = Some(run.finished_at.to_rfc3339());
        Ok(run)
    }

    /// Current scheduler and quota status
    pub async fn status(&self) -> SchedulerStatus {
        let state = self.state.read().await;
        SchedulerStatus {
            running: self.engine.is_running(),
            scheduled: state.scheduled,
            last_run_at: state.last_run_at.clone(),
            next_run_at: state.next_run_at.clone(),
            quota: self.engine.quota_status().await,
        }
    }
}

fn next_run_timestamp(every: Duration) -> String {
    let next = chrono::Utc::now()
        + chrono::Duration::from_std(every).unwrap_or_else(|_| chrono::Duration::zero());
    next.to_rfc3339()
}
