// Liveness sweep.
//
// The server-side half of heartbeat liveness: every `sweep_interval` the
// hub closes clients idle past `client_timeout` and pings everyone else.
// A closed client goes through the normal disconnect path, so its rooms
// hear `user-left` and its presence flips offline.

use chrono::{DateTime, TimeDelta, Utc};
use tandem_common::protocol::{Envelope, MessageBody, PingPayload};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

use crate::HubState;

/// Run the sweep until the task is dropped.
pub async fn sweep_loop(state: HubState) {
    let mut ticker = interval(state.config.sweep_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.reset(); // skip the immediate first tick
    loop {
        ticker.tick().await;
        sweep_once(&state, Utc::now()).await;
    }
}

/// One pass: ask idle clients' socket tasks to close, ping the rest.
pub async fn sweep_once(state: &HubState, now: DateTime<Utc>) {
    let timeout = TimeDelta::from_std(state.config.client_timeout).unwrap_or(TimeDelta::MAX);
    let Some(cutoff) = now.checked_sub_signed(timeout) else {
        return; // timeout too large to ever trip
    };

    let (idle, live) = state.clients.partition_idle(cutoff).await;
    for client_id in idle {
        warn!(client_id = %client_id, "closing idle client");
        state.clients.close(client_id).await;
    }

    if !live.is_empty() {
        let ping = Envelope::new(MessageBody::Ping(PingPayload { sent_at: now }));
        let delivered = state.clients.send_to_each(&live, &ping).await;
        debug!(pinged = delivered, "sweep ping");
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::Outbound;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    #[tokio::test]
    async fn idle_clients_are_closed_and_live_ones_pinged() {
        let state = HubState::default(); // 60s client timeout
        let idle = Uuid::new_v4();
        let live = Uuid::new_v4();
        let (tx_idle, mut rx_idle) = mpsc::unbounded_channel();
        let (tx_live, mut rx_live) = mpsc::unbounded_channel();

        let start = Utc::now();
        state.clients.register(idle, tx_idle, start).await;
        state.clients.register(live, tx_live, start).await;
        state.clients.touch(live, None, start + TimeDelta::seconds(50)).await;

        sweep_once(&state, start + TimeDelta::seconds(61)).await;

        assert!(matches!(rx_idle.try_recv(), Ok(Outbound::Close)));
        match rx_live.try_recv() {
            Ok(Outbound::Frame(envelope)) => {
                assert!(matches!(envelope.body, MessageBody::Ping(_)));
            }
            other => panic!("expected a sweep ping, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn a_fresh_client_is_only_pinged() {
        let state = HubState::default();
        let id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let start = Utc::now();
        state.clients.register(id, tx, start).await;

        sweep_once(&state, start + TimeDelta::seconds(59)).await;

        match rx.try_recv() {
            Ok(Outbound::Frame(envelope)) => {
                assert!(matches!(envelope.body, MessageBody::Ping(_)));
            }
            other => panic!("expected a sweep ping, got {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }
}
