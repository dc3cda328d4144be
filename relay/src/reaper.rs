//! Background task that drops ended sessions after the retention window.

use common::session::SessionManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Scan the registry every `interval`; ended sessions past retention are
/// removed, active sessions are never touched.
pub(crate) fn spawn(manager: Arc<SessionManager>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let reaped = manager.reap_inactive();
            if reaped > 0 {
                log::info!("reaped {reaped} ended sessions ({} remain)", manager.len());
            }
        }
    })
}
