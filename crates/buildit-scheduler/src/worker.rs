//! Executor loop that claims queued builds and runs them.

use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::orchestrator::{ExecutorSpec, ProjectScheduler};

/// Run one executor until `cancel` fires. A build that is already running
/// when `cancel` fires is finished first.
pub async fn run_executor(
    scheduler: ProjectScheduler,
    executor: ExecutorSpec,
    cancel: CancellationToken,
) {
    info!(executor = %executor.name, labels = ?executor.labels, "Starting executor");
    let notify = scheduler.queue().notifier();

    loop {
        // Register for wakeups before looking, so a release between the
        // look and the wait is not missed.
        let notified = notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if cancel.is_cancelled() {
            break;
        }

        // Claiming persists the next build number.
        let claim = {
            let scheduler = scheduler.clone();
            let executor = executor.clone();
            tokio::task::spawn_blocking(move || scheduler.try_claim(&executor)).await
        };
        match claim {
            Ok(Some(claimed)) => {
                scheduler.execute(claimed).await;
                continue;
            }
            Ok(None) => {}
            Err(e) => warn!(executor = %executor.name, error = %e, "Claim task failed"),
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = &mut notified => {}
            // Upstream blocking is re-evaluated even without a wakeup.
            _ = sleep(Duration::from_secs(1)) => {}
        }
    }
    debug!(executor = %executor.name, "Executor stopped");
}
