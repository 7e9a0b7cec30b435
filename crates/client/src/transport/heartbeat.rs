// Heartbeat bookkeeping: outstanding pings and measured latency.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use uuid::Uuid;

/// Tracks in-flight pings by message id and turns matching pongs into
/// latency samples. Unmatched pongs are ignored; the client never
/// closes a connection over a missed pong.
#[derive(Debug, Default)]
pub struct PingTracker {
    in_flight: HashMap<Uuid, Instant>,
    last_latency: Option<Duration>,
}

impl PingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a ping at the moment it is sent.
    pub fn record_ping(&mut self, message_id: Uuid, sent_at: Instant) {
        self.in_flight.insert(message_id, sent_at);
    }

    /// Pairs a pong with its ping. Returns the round-trip time, or
    /// `None` for a pong we never asked for.
    pub fn record_pong(&mut self, ping_id: Uuid, received_at: Instant) -> Option<Duration> {
        let sent_at = self.in_flight.remove(&ping_id)?;
        let latency = received_at.saturating_duration_since(sent_at);
        self.last_latency = Some(latency);
        Some(latency)
    }

    pub fn last_latency(&self) -> Option<Duration> {
        self.last_latency
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Forgets outstanding pings, e.g. across a reconnect. The last
    /// latency sample survives.
    pub fn clear_in_flight(&mut self) {
        self.in_flight.clear();
    }
}

// ── Tests ───────────────────────────────────────────────────────────
