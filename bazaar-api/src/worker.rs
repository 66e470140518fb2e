use std::time::Duration;

use bazaar_wallet::{PayoutRunReport, SweepReport};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::state::AppState;

const LEASE_NAME: &str = "payout-sweep";

/// Periodically releases due holds and runs scheduled payouts.
///
/// With Redis configured only one replica works a tick; the others skip it.
pub async fn start_payout_worker(state: AppState, every: Duration) {
    let holder = Uuid::new_v4().to_string();
    let lease_ttl = every.as_secs().max(1) * 2;
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(interval_secs = every.as_secs(), holder = %holder, "Payout worker started");

    loop {
        ticker.tick().await;
        run_tick(&state, &holder, lease_ttl).await;
    }
}

/// One sweep followed by one payout run. Returns `None` when another replica
/// holds the lease.
pub async fn run_tick(state: &AppState, holder: &str, lease_ttl: u64) -> Option<(SweepReport, PayoutRunReport)> {
    let leased = match &state.redis {
        Some(redis) => match redis.acquire_lease(LEASE_NAME, holder, lease_ttl).await {
            Ok(true) => true,
            Ok(false) => {
                debug!("Payout lease held elsewhere, skipping tick");
                return None;
            }
            Err(e) => {
                // Sweep and payout are idempotent; a lost lease only costs duplicate work.
                warn!(error = %e, "Payout lease unavailable, running unlocked");
                false
            }
        },
        None => false,
    };

    let now = state.clock.now();
    let sweep = match state.sweeper.sweep(now).await {
        Ok(report) => {
            state.metrics.record_sweep(report.released);
            if report.released > 0 || report.failed > 0 {
                info!(released = report.released, failed = report.failed, "Hold sweep finished");
            }
            report
        }
        Err(e) => {
            error!(error = %e, "Hold sweep failed");
            SweepReport::default()
        }
    };

    let payouts = match state.payouts.run_due_payouts(now).await {
        Ok(report) => {
            state.metrics.record_payouts(report.paid, report.failed);
            if report.paid > 0 || report.failed > 0 {
                info!(paid = report.paid, failed = report.failed, "Scheduled payouts finished");
            }
            report
        }
        Err(e) => {
            error!(error = %e, "Scheduled payout run failed");
            PayoutRunReport::default()
        }
    };

    if leased {
        if let Some(redis) = &state.redis {
            if let Err(e) = redis.release_lease(LEASE_NAME, holder).await {
                warn!(error = %e, "Failed to release payout lease");
            }
        }
    }

    Some((sweep, payouts))
}
