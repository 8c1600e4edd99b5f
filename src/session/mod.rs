//! Session registry and heartbeat.

pub mod registry;

pub use registry::{
    AcceptParams, Outbound, RegistryStats, SessionEvent, SessionHandle, SessionInfo,
    SessionRegistry,
};

use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Every `period`: close sessions idle for more than two periods, then ping
/// the rest.
pub async fn run_heartbeat(
    registry: Arc<SessionRegistry>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let closed = registry.sweep_idle_at(period, tokio::time::Instant::now().into_std());
                let pinged = registry.ping_all();
                debug!(closed, pinged, "Heartbeat");
            }
        }
    }
    info!("Heartbeat loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ServerFrame;
    use std::net::SocketAddr;

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_pings_then_times_out_silent_session() {
        let registry = Arc::new(SessionRegistry::new(10, 16));
        let mut handle = registry
            .accept(AcceptParams::new(SocketAddr::from(([127, 0, 0, 1], 9000)), 0))
            .unwrap();
        let cancel = CancellationToken::new();
        let period = Duration::from_secs(30);
        let task = tokio::spawn(run_heartbeat(registry.clone(), period, cancel.clone()));

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(matches!(
            handle.egress.try_recv(),
            Ok(Outbound::Frame(ServerFrame::Ping { .. }))
        ));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(registry.active(), 0);
        assert!(handle.closed.is_cancelled());

        cancel.cancel();
        task.await.unwrap();
    }
}
