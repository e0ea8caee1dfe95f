//! Session liveness sweeper
//!
//! Background task that kills sessions whose agents have gone silent for
//! longer than the keepalive timeout. Heartbeats and relay traffic both
//! refresh a session's activity stamp.

use crate::router::SessionRouter;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Run the liveness sweeper until cancelled.
pub async fn run_liveness_sweeper(router: Arc<SessionRouter>, cancel: CancellationToken) {
    let timeout = router.keepalive_timeout();
    let tick = (timeout / 3).max(Duration::from_secs(1));
    let mut interval = tokio::time::interval(tick);

    info!(
        timeout_secs = timeout.as_secs(),
        check_secs = tick.as_secs(),
        "Starting liveness sweeper"
    );

    loop {
        tokio::select! {
            _ = interval.tick() => {
                sweep(&router, timeout).await;
            }
            _ = cancel.cancelled() => {
                info!("Liveness sweeper shutting down");
                break;
            }
        }
    }
}

async fn sweep(router: &Arc<SessionRouter>, timeout: Duration) {
    for entry in router.sessions().list() {
        let idle = entry.idle_for();
        if idle > timeout {
            debug!(
                session_id = %entry.session_id,
                agent_id = %entry.agent_id,
                idle_secs = idle.as_secs(),
                "Session exceeded keepalive timeout"
            );
            router.retire_session(&entry, "heartbeat timeout").await;
            entry.mark_closed();
        }
    }
}
