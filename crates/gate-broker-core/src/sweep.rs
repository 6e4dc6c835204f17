//! Background task that periodically reclaims lease-expired and
//! hard-cap-exceeded grants.

use std::sync::Arc;
use std::time::Duration;

use tracing::error;

use crate::broker::Broker;

/// How often the sweep runs, independent of `lease_ms`: a shorter poll keeps
/// reclaim latency bounded without needing a timer per entry.
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Run the expiry sweep on [`SWEEP_INTERVAL`] forever. Intended to be
/// spawned as its own task alongside the transport listener; a failed sweep
/// pass is logged and retried on the next tick rather than killing the task.
pub async fn run_sweep_loop(broker: Arc<Broker>) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        ticker.tick().await;
        if let Err(err) = broker.sweep_once().await {
            error!(%err, "expiry sweep pass failed");
        }
    }
}
