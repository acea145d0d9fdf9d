//! Periodic driver for the accrual computation in [`pulse_core::accrual`].

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use pulse_core::accrual;
use pulse_core::{BonusSource, StateStore};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, trace, warn};

/// Recomputes and persists `{potentialPoints, countdown}` every `period`
/// until `shutdown` flips. The first tick runs immediately.
pub async fn run_accrual_clock(
    store: Arc<StateStore>,
    period: Duration,
    mut bonus: Box<dyn BonusSource>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }

        match accrual::tick(&store, bonus.as_mut(), Utc::now()) {
            Ok(accrual) => trace!(
                countdown = %accrual.countdown,
                potential_points = accrual.potential_points,
                "Accrual tick"
            ),
            Err(err) => warn!(error = %err, "Accrual tick failed to persist"),
        }
    }

    debug!("Accrual clock stopped");
}
