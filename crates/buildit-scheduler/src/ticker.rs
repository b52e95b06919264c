//! Periodic evaluation of timer and SCM triggers.

use chrono::Utc;
use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::orchestrator::ProjectScheduler;

/// Fire every trigger due since the previous tick, until `cancel` fires.
pub async fn run_ticker(scheduler: ProjectScheduler, period: Duration, cancel: CancellationToken) {
    info!(period_secs = period.as_secs(), "Starting trigger ticker");
    let mut ticks = interval(period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticks.tick().await;
    let mut last = Utc::now();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticks.tick() => {}
        }
        let now = Utc::now();
        let fired = scheduler.fire_due(last, now);
        if !fired.is_empty() {
            debug!(count = fired.len(), "Fired triggers");
        }
        last = now;
    }
    debug!("Trigger ticker stopped");
}
