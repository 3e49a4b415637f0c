//! Background refresh worker.
//!
//! Drains the notification queue on a fixed tick. Each tick first clears
//! refresh leases abandoned by crashed workers, then processes every due
//! event on the orchestrator's bounded pool. A failed tick is logged and the
//! loop carries on.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::models::BatchResponse;
use crate::services::refresh_ledger::RefreshLedger;
use crate::services::refresh_service::RefreshService;

/// Delay before the first tick, so startup can finish registering projects.
pub const STARTUP_DELAY: Duration = Duration::from_secs(5);

/// Spawn the background refresh worker.
pub fn spawn_refresh_worker(
    service: Arc<RefreshService>,
    ledger: Arc<RefreshLedger>,
    every: Duration,
    startup_delay: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(startup_delay).await;
        let mut tick = interval(every);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tick.tick().await;
            run_once(&service, &ledger).await;
        }
    })
}

/// One worker tick. Errors are logged, never propagated.
pub async fn run_once(service: &Arc<RefreshService>, ledger: &RefreshLedger) -> BatchResponse {
    if let Err(e) = ledger.clear_expired().await {
        tracing::warn!("Failed to clear expired refresh leases: {e}");
    }

    match service.process_pending().await {
        Ok(batch) => {
            if !batch.errors.is_empty() {
                tracing::warn!("Refresh batch finished with {} error(s)", batch.errors.len());
            }
            batch
        }
        Err(e) => {
            tracing::error!("Refresh worker error: {e}");
            BatchResponse {
                errors: vec![e.to_string()],
                ..Default::default()
            }
        }
    }
}
