// Transport connection manager: reconnecting bidirectional message channel.
//
// Owns the connection state machine, the offline send queue, the ordered
// subscription list, and heartbeat bookkeeping. Callers construct and own a
// `Connection`; nothing here is global.
//
// Transport is abstracted via `Transport` for testability. The production
// WebSocket implementation lives in the `ws` module.

pub mod heartbeat;
pub mod queue;
pub mod ws;

use std::future::Future;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use tandem_common::protocol::{
    is_supported_protocol_version, Envelope, MessageBody, PingPayload, PongPayload, ProtocolError,
    PROTOCOL_VERSION,
};

use heartbeat::PingTracker;
use queue::{SendQueue, DEFAULT_QUEUE_CAPACITY};

// ── Configuration ───────────────────────────────────────────────────

/// Connection parameters for one hub endpoint.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Hub WebSocket URL (e.g. "wss://hub.example.com/ws").
    pub url: String,
    /// User on whose behalf frames are stamped.
    pub user_id: String,
    /// Frames held while disconnected before sends hard-fail.
    pub queue_capacity: usize,
    /// How often to probe the hub with a ping.
    pub heartbeat_interval: Duration,
    pub reconnect: ReconnectPolicy,
}

impl ConnectionConfig {
    pub fn new(url: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            user_id: user_id.into(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            heartbeat_interval: Duration::from_secs(30),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Reconnection parameters.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub base_delay: Duration,
    /// Multiplier applied per attempt: delay(n) = base * decay^(n-1).
    pub decay: f64,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            base_delay: Duration::from_millis(1000),
            decay: 1.5,
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    /// Backoff delay for the numbered attempt (1-based), capped at
    /// `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(64) as i32;
        let scaled = self.base_delay.as_millis() as f64 * self.decay.powi(exp);
        let capped = scaled.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

// ── Transport trait ─────────────────────────────────────────────────

/// Abstraction over the network channel for testability.
///
/// In production this is tokio-tungstenite; in tests it can be a mock
/// that records frames. All methods return `Send` futures so the
/// session driver can run on a multi-threaded tokio runtime.
pub trait Transport: Send + 'static {
    /// Open the channel to the given URL.
    fn open(&mut self, url: &str) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Send one frame.
    fn send(&mut self, frame: &Envelope)
        -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Receive the next frame. Returns None on clean close.
    fn recv(&mut self) -> impl Future<Output = Result<Option<Envelope>, TransportError>> + Send;

    /// Close the channel.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

// ── Connection state ────────────────────────────────────────────────

/// Current state of the hub connection.
///
/// `Error` is terminal: it is entered after `max_attempts` consecutive
/// failures and left only by an explicit `connect()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

// ── Events & errors ─────────────────────────────────────────────────

/// Events surfaced by the connection for the session driver to handle.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Channel open; queued frames flushed and subscriptions replayed.
    Connected,
    /// Channel lost or failed; `retrying` says whether the policy
    /// allows another automatic attempt.
    Disconnected { reason: String, retrying: bool },
    /// A frame from the hub.
    Inbound(Envelope),
    /// A heartbeat round trip completed.
    Latency(Duration),
}

/// How a send was carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Written to the open channel.
    Sent,
    /// Held in the offline queue for the next flush.
    Queued,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("send queue full (capacity {capacity})")]
    QueueFull { capacity: usize },
    #[error("not connected")]
    NotConnected,
    #[error("invalid server url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("transport failure: {0}")]
    Connection(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

// ── Connection manager ──────────────────────────────────────────────

/// Manages the hub connection lifecycle.
pub struct Connection<T: Transport> {
    config: ConnectionConfig,
    transport: T,
    state: ConnectionState,
    queue: SendQueue,
    /// Channels in original subscription order, replayed after reconnect.
    subscriptions: Vec<String>,
    consecutive_failures: u32,
    /// Cleared by an explicit `disconnect()`.
    auto_reconnect: bool,
    pings: PingTracker,
}

impl<T: Transport> Connection<T> {
    pub fn new(config: ConnectionConfig, transport: T) -> Self {
        let queue = SendQueue::new(config.queue_capacity);
        Self {
            config,
            transport,
            state: ConnectionState::Disconnected,
            queue,
            subscriptions: Vec::new(),
            consecutive_failures: 0,
            auto_reconnect: true,
            pings: PingTracker::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn subscriptions(&self) -> &[String] {
        &self.subscriptions
    }

    pub fn queued_frames(&self) -> usize {
        self.queue.len()
    }

    pub fn latency(&self) -> Option<Duration> {
        self.pings.last_latency()
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.config.heartbeat_interval
    }

    /// Stamp a body with this connection's user and a fresh message id.
    pub fn compose(&self, body: MessageBody) -> Envelope {
        Envelope::new(body).with_user(self.config.user_id.clone())
    }

    /// Attempt to connect (or reconnect) to the hub.
    ///
    /// No-op when already connecting or connected. On success the queue
    /// is flushed first, then subscriptions are replayed in original
    /// order. On failure the state moves to `Reconnecting` (or `Error`
    /// once the policy is exhausted).
    pub async fn connect(&mut self) -> Result<ConnectionEvent, TransportError> {
        if matches!(self.state, ConnectionState::Connecting | ConnectionState::Connected) {
            return Ok(ConnectionEvent::Connected);
        }
        validate_server_url(&self.config.url)?;

        if self.state == ConnectionState::Error {
            // Explicit retry after exhaustion starts a fresh cycle.
            self.consecutive_failures = 0;
        }
        self.auto_reconnect = true;
        self.state = ConnectionState::Connecting;

        if let Err(e) = self.transport.open(&self.config.url).await {
            return Ok(self.connect_attempt_failed(format!("connection failed: {e}")));
        }

        self.state = ConnectionState::Connected;
        self.consecutive_failures = 0;
        self.pings.clear_in_flight();

        let pending = self.queue.drain();
        let flushed = pending.len();
        let mut frames = pending.into_iter();
        while let Some(frame) = frames.next() {
            if let Err(e) = self.transport.send(&frame).await {
                warn!(error = %e, "queue flush interrupted, requeueing remainder");
                let mut rest = vec![frame];
                rest.extend(frames);
                self.queue.requeue_front(rest);
                return Ok(ConnectionEvent::Connected);
            }
        }

        for channel in self.subscriptions.clone() {
            let frame = self.compose(MessageBody::Subscribe).with_channel(channel.clone());
            if let Err(e) = self.transport.send(&frame).await {
                warn!(error = %e, channel, "resubscribe interrupted");
                break;
            }
        }

        info!(url = %self.config.url, flushed, "hub connection established");
        Ok(ConnectionEvent::Connected)
    }

    /// Disconnect and suppress automatic reconnection. Queued frames
    /// survive for the next explicit `connect()`.
    pub async fn disconnect(&mut self) {
        self.auto_reconnect = false;
        self.transport.close().await;
        self.state = ConnectionState::Disconnected;
        self.consecutive_failures = 0;
        self.pings.clear_in_flight();
    }

    /// Send one frame, or hold it in the queue while the channel is
    /// down. A transmit failure on an open channel falls back to the
    /// queue once; a full queue is a hard error.
    pub async fn send(&mut self, frame: Envelope) -> Result<SendOutcome, TransportError> {
        if self.state == ConnectionState::Connected {
            match self.transport.send(&frame).await {
                Ok(()) => return Ok(SendOutcome::Sent),
                Err(e) => {
                    warn!(
                        error = %e,
                        msg_type = frame.message_type(),
                        "send failed on open channel, queueing for retry"
                    );
                }
            }
        }
        let capacity = self.queue.capacity();
        match self.queue.enqueue(frame) {
            Ok(()) => Ok(SendOutcome::Queued),
            Err(_) => Err(TransportError::QueueFull { capacity }),
        }
    }

    /// Record channel membership and announce it when connected.
    ///
    /// Subscribe frames are never queued: the subscription list itself
    /// is replayed after every reconnect, which also covers calls made
    /// while offline.
    pub async fn subscribe(&mut self, channel: &str) {
        if !self.subscriptions.iter().any(|c| c == channel) {
            self.subscriptions.push(channel.to_string());
        }
        if self.state == ConnectionState::Connected {
            let frame = self.compose(MessageBody::Subscribe).with_channel(channel);
            if let Err(e) = self.transport.send(&frame).await {
                warn!(error = %e, channel, "subscribe send failed");
            }
        }
    }

    pub async fn unsubscribe(&mut self, channel: &str) {
        self.subscriptions.retain(|c| c != channel);
        if self.state == ConnectionState::Connected {
            let frame = self.compose(MessageBody::Unsubscribe).with_channel(channel);
            if let Err(e) = self.transport.send(&frame).await {
                warn!(error = %e, channel, "unsubscribe send failed");
            }
        }
    }

    /// Send a ping and remember when it left. The matching pong turns
    /// into a `Latency` event; a missed pong never closes the channel.
    pub async fn send_heartbeat(&mut self) -> Result<(), TransportError> {
        if self.state != ConnectionState::Connected {
            return Ok(());
        }
        let frame = self.compose(MessageBody::Ping(PingPayload { sent_at: Utc::now() }));
        let message_id = frame.message_id;
        self.transport.send(&frame).await?;
        self.pings.record_ping(message_id, Instant::now());
        Ok(())
    }

    /// Process the next incoming frame.
    ///
    /// Pings are answered in place and unmatched pongs swallowed; both
    /// return `None`. A closed or failed channel returns a
    /// `Disconnected` event and moves the state machine.
    pub async fn recv_event(&mut self) -> Result<Option<ConnectionEvent>, TransportError> {
        if self.state != ConnectionState::Connected {
            return Err(TransportError::NotConnected);
        }

        match self.transport.recv().await {
            Ok(Some(envelope)) => self.route_inbound(envelope).await,
            Ok(None) => {
                self.transport.close().await;
                Ok(Some(self.connection_lost("connection closed by server".to_string())))
            }
            Err(e) => {
                self.transport.close().await;
                Ok(Some(self.connection_lost(format!("receive failed: {e}"))))
            }
        }
    }

    async fn route_inbound(
        &mut self,
        envelope: Envelope,
    ) -> Result<Option<ConnectionEvent>, TransportError> {
        match &envelope.body {
            MessageBody::Ping(_) => {
                let pong = self
                    .compose(MessageBody::Pong(PongPayload { ping_id: envelope.message_id }));
                if let Err(e) = self.transport.send(&pong).await {
                    warn!(error = %e, "failed to answer hub ping");
                }
                Ok(None)
            }
            MessageBody::Pong(payload) => {
                match self.pings.record_pong(payload.ping_id, Instant::now()) {
                    Some(latency) => Ok(Some(ConnectionEvent::Latency(latency))),
                    None => {
                        debug!("pong without a matching ping");
                        Ok(None)
                    }
                }
            }
            MessageBody::Subscribe | MessageBody::Unsubscribe => {
                debug!(msg_type = envelope.message_type(), "ignoring client-only frame");
                Ok(None)
            }
            MessageBody::Error(payload) => {
                warn!(code = %payload.code, message = %payload.message, "hub reported error");
                Ok(Some(ConnectionEvent::Inbound(envelope)))
            }
            MessageBody::Sync(payload) => {
                // Version skew is logged, not fatal, in v1.
                if let Some(protocol) = &payload.protocol {
                    if !is_supported_protocol_version(protocol) {
                        warn!(
                            announced = %protocol,
                            speaking = PROTOCOL_VERSION,
                            "hub announced an unsupported protocol version"
                        );
                    }
                }
                Ok(Some(ConnectionEvent::Inbound(envelope)))
            }
            _ => Ok(Some(ConnectionEvent::Inbound(envelope))),
        }
    }

    /// Backoff delay before the next automatic attempt.
    pub fn reconnect_delay(&self) -> Duration {
        self.config.reconnect.delay_for_attempt(self.consecutive_failures + 1)
    }

    /// Count a failed attempt toward the policy limit.
    fn connect_attempt_failed(&mut self, reason: String) -> ConnectionEvent {
        self.consecutive_failures += 1;
        self.connection_lost(reason)
    }

    fn connection_lost(&mut self, reason: String) -> ConnectionEvent {
        self.pings.clear_in_flight();
        let policy = &self.config.reconnect;
        let retrying = self.auto_reconnect
            && policy.enabled
            && self.consecutive_failures < policy.max_attempts;
        self.state = if retrying {
            ConnectionState::Reconnecting
        } else if self.auto_reconnect && policy.enabled {
            ConnectionState::Error
        } else {
            ConnectionState::Disconnected
        };
        ConnectionEvent::Disconnected { reason, retrying }
    }
}

fn validate_server_url(value: &str) -> Result<(), TransportError> {
    let parsed = Url::parse(value).map_err(|error| TransportError::InvalidUrl {
        url: value.to_string(),
        reason: error.to_string(),
    })?;
    match parsed.scheme() {
        "wss" => Ok(()),
        "ws" if is_loopback_host(parsed.host_str()) => Ok(()),
        _ => Err(TransportError::InvalidUrl {
            url: value.to_string(),
            reason: "must use wss (ws is allowed only for localhost testing)".to_string(),
        }),
    }
}

fn is_loopback_host(host: Option<&str>) -> bool {
    let Some(host) = host else {
        return false;
    };
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.parse::<IpAddr>().is_ok_and(|addr| addr.is_loopback())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use tandem_common::protocol::ActivityPayload;

    // ── Mock transport ──────────────────────────────────────────────

    #[derive(Debug, Default)]
    struct MockTransport {
        /// Frames returned by recv() in order; None means clean close.
        recv_queue: VecDeque<Option<Envelope>>,
        /// Frames written via send().
        sent: Vec<Envelope>,
        opened: bool,
        closed: bool,
        /// If set, open returns this error.
        open_error: Option<String>,
        /// If set, every send returns this error.
        send_error: Option<String>,
    }

    impl MockTransport {
        fn queue_recv(&mut self, frame: Envelope) {
            self.recv_queue.push_back(Some(frame));
        }

        fn queue_close(&mut self) {
            self.recv_queue.push_back(None);
        }
    }

    impl Transport for MockTransport {
        async fn open(&mut self, _url: &str) -> Result<(), TransportError> {
            if let Some(err) = &self.open_error {
                return Err(TransportError::Connection(err.clone()));
            }
            self.opened = true;
            self.closed = false;
            Ok(())
        }

        async fn send(&mut self, frame: &Envelope) -> Result<(), TransportError> {
            if let Some(err) = &self.send_error {
                return Err(TransportError::Connection(err.clone()));
            }
            self.sent.push(frame.clone());
            Ok(())
        }

        async fn recv(&mut self) -> Result<Option<Envelope>, TransportError> {
            Ok(self.recv_queue.pop_front().flatten())
        }

        async fn close(&mut self) {
            self.closed = true;
            self.opened = false;
        }
    }

    fn test_config() -> ConnectionConfig {
        ConnectionConfig::new("wss://hub.test/ws", "user-a")
    }

    fn activity(action: &str) -> Envelope {
        Envelope::new(MessageBody::Activity(ActivityPayload {
            action: action.to_string(),
            entity_type: None,
            entity_id: None,
        }))
        .with_channel("room-1")
    }

    fn action_of(frame: &Envelope) -> String {
        match &frame.body {
            MessageBody::Activity(payload) => payload.action.clone(),
            other => panic!("expected activity, got {other:?}"),
        }
    }

    // ── Connection lifecycle ────────────────────────────────────────

    #[tokio::test]
    async fn connect_happy_path() {
        let mut conn = Connection::new(test_config(), MockTransport::default());
        assert_eq!(conn.state(), ConnectionState::Disconnected);

        let event = conn.connect().await.expect("connect should succeed");
        assert_eq!(event, ConnectionEvent::Connected);
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert!(conn.transport.opened);
    }

    #[tokio::test]
    async fn connect_rejects_plain_ws_for_remote_hosts() {
        let mut config = test_config();
        config.url = "ws://hub.test/ws".to_string();
        let mut conn = Connection::new(config, MockTransport::default());

        let error = conn.connect().await.expect_err("insecure url should be rejected");
        assert!(error.to_string().contains("must use wss"));
    }

    #[tokio::test]
    async fn connect_allows_plain_ws_for_loopback() {
        let mut config = test_config();
        config.url = "ws://127.0.0.1:9999/ws".to_string();
        let mut conn = Connection::new(config, MockTransport::default());

        conn.connect().await.expect("loopback ws should be allowed");
        assert_eq!(conn.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn connect_failure_enters_reconnecting() {
        let mut transport = MockTransport::default();
        transport.open_error = Some("refused".to_string());

        let mut conn = Connection::new(test_config(), transport);
        let event = conn.connect().await.expect("failure surfaces as event");

        match event {
            ConnectionEvent::Disconnected { reason, retrying } => {
                assert!(reason.contains("connection failed"));
                assert!(retrying);
            }
            other => panic!("expected Disconnected, got {other:?}"),
        }
        assert_eq!(conn.state(), ConnectionState::Reconnecting);
    }

    #[tokio::test]
    async fn exhausted_attempts_enter_error_state() {
        let mut config = test_config();
        config.reconnect.max_attempts = 2;
        let mut transport = MockTransport::default();
        transport.open_error = Some("refused".to_string());

        let mut conn = Connection::new(config, transport);
        conn.connect().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Reconnecting);

        let event = conn.connect().await.unwrap();
        match event {
            ConnectionEvent::Disconnected { retrying, .. } => assert!(!retrying),
            other => panic!("expected Disconnected, got {other:?}"),
        }
        assert_eq!(conn.state(), ConnectionState::Error);
    }

    #[tokio::test]
    async fn explicit_connect_leaves_error_state() {
        let mut config = test_config();
        config.reconnect.max_attempts = 1;
        let mut transport = MockTransport::default();
        transport.open_error = Some("refused".to_string());

        let mut conn = Connection::new(config, transport);
        conn.connect().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Error);

        conn.transport.open_error = None;
        let event = conn.connect().await.unwrap();
        assert_eq!(event, ConnectionEvent::Connected);
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(conn.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn disconnect_suppresses_reconnection() {
        let mut conn = Connection::new(test_config(), MockTransport::default());
        conn.connect().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);

        conn.disconnect().await;
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(conn.transport.closed);
        assert!(!conn.auto_reconnect);
    }

    // ── Send + queue ────────────────────────────────────────────────

    #[tokio::test]
    async fn send_while_connected_transmits() {
        let mut conn = Connection::new(test_config(), MockTransport::default());
        conn.connect().await.unwrap();

        let outcome = conn.send(activity("edit")).await.unwrap();
        assert_eq!(outcome, SendOutcome::Sent);
        assert_eq!(conn.transport.sent.len(), 1);
        assert_eq!(conn.queued_frames(), 0);
    }

    #[tokio::test]
    async fn offline_sends_flush_in_fifo_order_on_connect() {
        let mut conn = Connection::new(test_config(), MockTransport::default());

        for action in ["one", "two", "three"] {
            let outcome = conn.send(activity(action)).await.unwrap();
            assert_eq!(outcome, SendOutcome::Queued);
        }
        assert_eq!(conn.queued_frames(), 3);

        conn.connect().await.unwrap();
        let actions: Vec<_> = conn.transport.sent.iter().map(action_of).collect();
        assert_eq!(actions, ["one", "two", "three"]);
        assert_eq!(conn.queued_frames(), 0);
    }

    #[tokio::test]
    async fn queue_full_is_a_hard_error() {
        let mut config = test_config();
        config.queue_capacity = 2;
        let mut conn = Connection::new(config, MockTransport::default());

        conn.send(activity("one")).await.unwrap();
        conn.send(activity("two")).await.unwrap();

        let error = conn.send(activity("three")).await.expect_err("queue should be full");
        match error {
            TransportError::QueueFull { capacity } => assert_eq!(capacity, 2),
            other => panic!("expected QueueFull, got {other:?}"),
        }
        assert_eq!(conn.queued_frames(), 2);
    }

    #[tokio::test]
    async fn send_failure_on_open_channel_falls_back_to_queue() {
        let mut conn = Connection::new(test_config(), MockTransport::default());
        conn.connect().await.unwrap();

        conn.transport.send_error = Some("broken pipe".to_string());
        let outcome = conn.send(activity("edit")).await.unwrap();
        assert_eq!(outcome, SendOutcome::Queued);
        assert_eq!(conn.queued_frames(), 1);
    }

    // ── Subscriptions ───────────────────────────────────────────────

    #[tokio::test]
    async fn subscribe_while_connected_sends_frame() {
        let mut conn = Connection::new(test_config(), MockTransport::default());
        conn.connect().await.unwrap();

        conn.subscribe("room-1").await;
        assert_eq!(conn.subscriptions(), ["room-1"]);
        let frame = conn.transport.sent.last().unwrap();
        assert_eq!(frame.message_type(), "subscribe");
        assert_eq!(frame.channel.as_deref(), Some("room-1"));
        assert_eq!(frame.user_id.as_deref(), Some("user-a"));
    }

    #[tokio::test]
    async fn resubscription_replays_in_original_order() {
        let mut conn = Connection::new(test_config(), MockTransport::default());

        conn.subscribe("alpha").await;
        conn.subscribe("beta").await;
        conn.subscribe("gamma").await;
        assert!(conn.transport.sent.is_empty(), "offline subscribes are not transmitted");

        conn.connect().await.unwrap();
        let channels: Vec<_> = conn
            .transport
            .sent
            .iter()
            .map(|f| {
                assert_eq!(f.message_type(), "subscribe");
                f.channel.clone().unwrap()
            })
            .collect();
        assert_eq!(channels, ["alpha", "beta", "gamma"]);
    }

    #[tokio::test]
    async fn queued_frames_flush_before_resubscription() {
        let mut conn = Connection::new(test_config(), MockTransport::default());

        conn.subscribe("alpha").await;
        conn.send(activity("pending-edit")).await.unwrap();

        conn.connect().await.unwrap();
        let types: Vec<_> =
            conn.transport.sent.iter().map(|f| f.message_type().to_string()).collect();
        assert_eq!(types, ["activity", "subscribe"]);
    }

    #[tokio::test]
    async fn unsubscribe_removes_channel_from_replay() {
        let mut conn = Connection::new(test_config(), MockTransport::default());

        conn.subscribe("alpha").await;
        conn.subscribe("beta").await;
        conn.unsubscribe("alpha").await;

        conn.connect().await.unwrap();
        let channels: Vec<_> =
            conn.transport.sent.iter().filter_map(|f| f.channel.clone()).collect();
        assert_eq!(channels, ["beta"]);
    }

    // ── Heartbeat ───────────────────────────────────────────────────

    #[tokio::test]
    async fn pong_produces_a_latency_event() {
        let mut conn = Connection::new(test_config(), MockTransport::default());
        conn.connect().await.unwrap();

        conn.send_heartbeat().await.unwrap();
        let ping_id = conn.transport.sent.last().unwrap().message_id;

        conn.transport
            .queue_recv(Envelope::new(MessageBody::Pong(PongPayload { ping_id })));
        let event = conn.recv_event().await.unwrap().expect("latency event");
        assert!(matches!(event, ConnectionEvent::Latency(_)));
        assert!(conn.latency().is_some());
    }

    #[tokio::test]
    async fn inbound_ping_is_answered_with_pong() {
        let mut conn = Connection::new(test_config(), MockTransport::default());
        conn.connect().await.unwrap();

        let ping = Envelope::new(MessageBody::Ping(PingPayload { sent_at: Utc::now() }));
        let ping_id = ping.message_id;
        conn.transport.queue_recv(ping);

        let event = conn.recv_event().await.unwrap();
        assert!(event.is_none(), "pings are handled in place");

        let pong = conn.transport.sent.last().unwrap();
        match &pong.body {
            MessageBody::Pong(payload) => assert_eq!(payload.ping_id, ping_id),
            other => panic!("expected pong, got {other:?}"),
        }
    }

    // ── Receive events ──────────────────────────────────────────────

    #[tokio::test]
    async fn inbound_frames_pass_through() {
        let mut conn = Connection::new(test_config(), MockTransport::default());
        conn.connect().await.unwrap();

        let frame = activity("typing");
        conn.transport.queue_recv(frame.clone());

        let event = conn.recv_event().await.unwrap().expect("inbound event");
        assert_eq!(event, ConnectionEvent::Inbound(frame));
    }

    #[tokio::test]
    async fn unsupported_protocol_version_is_not_fatal() {
        use tandem_common::protocol::SyncPayload;

        let mut conn = Connection::new(test_config(), MockTransport::default());
        conn.connect().await.unwrap();

        let welcome = Envelope::new(MessageBody::Sync(SyncPayload {
            client_id: Some(uuid::Uuid::new_v4()),
            protocol: Some("tandem-sync.v0".to_string()),
            ..SyncPayload::default()
        }));
        conn.transport.queue_recv(welcome.clone());

        // Skew is logged, but the frame still reaches the caller.
        let event = conn.recv_event().await.unwrap().expect("inbound event");
        assert_eq!(event, ConnectionEvent::Inbound(welcome));
        assert_eq!(conn.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn server_close_enters_reconnecting() {
        let mut conn = Connection::new(test_config(), MockTransport::default());
        conn.connect().await.unwrap();
        conn.transport.queue_close();

        let event = conn.recv_event().await.unwrap().expect("close event");
        match event {
            ConnectionEvent::Disconnected { retrying, .. } => assert!(retrying),
            other => panic!("expected Disconnected, got {other:?}"),
        }
        assert_eq!(conn.state(), ConnectionState::Reconnecting);
    }

    #[tokio::test]
    async fn recv_fails_when_not_connected() {
        let mut conn = Connection::new(test_config(), MockTransport::default());
        assert!(matches!(
            conn.recv_event().await,
            Err(TransportError::NotConnected)
        ));
    }

    // ── Reconnection backoff ────────────────────────────────────────

    #[test]
    fn backoff_follows_decay_curve() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(1500));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(2250));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(3375));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(5062));
    }

    #[test]
    fn backoff_caps_at_max_delay() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for_attempt(20), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn reconnect_delay_tracks_failed_attempts() {
        let mut transport = MockTransport::default();
        transport.open_error = Some("refused".to_string());

        let mut conn = Connection::new(test_config(), transport);
        assert_eq!(conn.reconnect_delay(), Duration::from_millis(1000));

        conn.connect().await.unwrap();
        assert_eq!(conn.reconnect_delay(), Duration::from_millis(1500));

        conn.connect().await.unwrap();
        assert_eq!(conn.reconnect_delay(), Duration::from_millis(2250));
    }

    #[tokio::test]
    async fn successful_connect_resets_failure_count() {
        let mut transport = MockTransport::default();
        transport.open_error = Some("refused".to_string());

        let mut conn = Connection::new(test_config(), transport);
        conn.connect().await.unwrap();
        conn.connect().await.unwrap();
        assert!(conn.consecutive_failures >= 2);

        conn.transport.open_error = None;
        conn.connect().await.unwrap();
        assert_eq!(conn.consecutive_failures, 0);
        assert_eq!(conn.reconnect_delay(), Duration::from_millis(1000));
    }
}
