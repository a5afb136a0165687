//! Auto-sync scheduler.
//!
//! Wakes up every tick, and for each enabled, authorized connection with a
//! daily `auto_sync_time` slot that has passed today without a run since,
//! triggers an incremental sync.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::time;
use tracing::{debug, error, info, warn};

use crmsync_core::models::{IntegrationConnection, SyncSettings, SyncType};
use crmsync_core::IntegrationService;

/// Whether a connection's daily slot has passed today with no run started
/// since it.
pub fn is_due(
    settings: &SyncSettings,
    last_started: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> bool {
    if !settings.auto_sync_enabled {
        return false;
    }
    let Some(slot) = settings.auto_sync_slot() else {
        return false;
    };
    let slot_today = now.date_naive().and_time(slot).and_utc();
    now >= slot_today && last_started.map_or(true, |started| started < slot_today)
}

pub struct Scheduler {
    service: Arc<IntegrationService>,
    tick: Duration,
}

impl Scheduler {
    pub fn new(service: Arc<IntegrationService>, tick: Duration) -> Self {
        Self { service, tick }
    }

    /// Main scheduler loop. Returns once `shutdown` is notified.
    pub async fn run(&self, shutdown: Arc<Notify>) {
        info!(tick_secs = self.tick.as_secs(), "scheduler started");

        let mut interval = time::interval(self.tick);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
        // The first tick fires immediately; let the system finish starting.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.run_tick(Utc::now()).await;
                }
                _ = shutdown.notified() => {
                    info!("scheduler shutting down");
                    break;
                }
            }
        }
    }

    /// One pass over all active connections.
    pub async fn run_tick(&self, now: DateTime<Utc>) {
        let connections = match self.service.stores().credentials.list_active_connections() {
            Ok(c) => c,
            Err(e) => {
                error!(error = %e, "failed to list connections for auto-sync");
                return;
            }
        };

        for conn in connections {
            if !self.due(&conn, now) {
                continue;
            }
            self.run_for(&conn).await;
        }
    }

    fn due(&self, conn: &IntegrationConnection, now: DateTime<Utc>) -> bool {
        if !conn.sync_config.auto_sync_enabled {
            return false;
        }
        match self.service.stores().sync_logs.latest_sync_log(conn.id) {
            Ok(last) => is_due(&conn.sync_config, last.map(|l| l.started_at), now),
            Err(e) => {
                warn!(tenant_id = %conn.tenant_id, error = %e, "cannot read last sync; skipping");
                false
            }
        }
    }

    async fn run_for(&self, conn: &IntegrationConnection) {
        debug!(tenant_id = %conn.tenant_id, "auto-sync due");
        match self
            .service
            .trigger_sync(&conn.tenant_id, SyncType::Incremental)
            .await
        {
            Ok(summary) => info!(
                tenant_id = %conn.tenant_id,
                sync_log_id = summary.sync_log_id,
                status = summary.status.as_str(),
                organizations_fetched = summary.organizations_fetched,
                persons_fetched = summary.persons_fetched,
                errors = summary.error_count,
                "auto-sync finished"
            ),
            Err(e) if e.kind() == "sync_already_running" => {
                warn!(tenant_id = %conn.tenant_id, "skipping auto-sync: a run is in progress");
            }
            Err(e) => error!(
                tenant_id = %conn.tenant_id,
                kind = e.kind(),
                error = %e,
                "auto-sync failed"
            ),
        }
    }
}
