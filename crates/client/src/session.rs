// Session driver: owns the connection and runs its event loop.
//
// `Session::spawn` moves a `Connection` onto a background task that
// multiplexes the heartbeat timer, caller commands, and inbound frames.
// Callers interact through a cloneable `SessionHandle`; connection
// events fan out on a broadcast channel and the connection state is
// mirrored into a watch channel.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{interval, sleep, Interval, MissedTickBehavior};
use tracing::{debug, warn};

use tandem_common::protocol::MessageBody;

use crate::transport::{
    Connection, ConnectionEvent, ConnectionState, SendOutcome, Transport, TransportError,
};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session task is no longer running")]
    Closed,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

enum Command {
    Connect,
    Disconnect,
    Send {
        body: MessageBody,
        channel: Option<String>,
        reply: oneshot::Sender<Result<SendOutcome, TransportError>>,
    },
    Subscribe(String),
    Unsubscribe(String),
}

// ── Handle ──────────────────────────────────────────────────────────

/// Cheap, cloneable entry point to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<ConnectionEvent>,
    state: watch::Receiver<ConnectionState>,
    latency: watch::Receiver<Option<Duration>>,
}

impl SessionHandle {
    /// Ask the driver to connect. Progress arrives as events.
    pub fn connect(&self) -> Result<(), SessionError> {
        self.command(Command::Connect)
    }

    /// Disconnect and suppress automatic reconnection.
    pub fn disconnect(&self) -> Result<(), SessionError> {
        self.command(Command::Disconnect)
    }

    pub fn subscribe(&self, channel: impl Into<String>) -> Result<(), SessionError> {
        self.command(Command::Subscribe(channel.into()))
    }

    pub fn unsubscribe(&self, channel: impl Into<String>) -> Result<(), SessionError> {
        self.command(Command::Unsubscribe(channel.into()))
    }

    /// Send one message, stamped with the session user and a fresh id.
    pub async fn send(
        &self,
        body: MessageBody,
        channel: Option<String>,
    ) -> Result<SendOutcome, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Send { body, channel, reply: reply_tx })
            .map_err(|_| SessionError::Closed)?;
        reply_rx.await.map_err(|_| SessionError::Closed)?.map_err(SessionError::from)
    }

    /// New subscription to the session event stream.
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Most recent heartbeat round-trip time, if any.
    pub fn latency(&self) -> Option<Duration> {
        *self.latency.borrow()
    }

    fn command(&self, command: Command) -> Result<(), SessionError> {
        self.commands.send(command).map_err(|_| SessionError::Closed)
    }
}

// ── Session ─────────────────────────────────────────────────────────

/// Handle for the session background task.
/// Dropping the session stops the task.
pub struct Session {
    handle: SessionHandle,
    shutdown_tx: watch::Sender<bool>,
    _task: tokio::task::JoinHandle<()>,
}

impl Session {
    /// Move the connection onto a background driver task.
    pub fn spawn<T: Transport>(connection: Connection<T>) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(connection.state());
        let (latency_tx, latency_rx) = watch::channel(None);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let events = event_tx.clone();
        let task = tokio::spawn(async move {
            session_loop(connection, command_rx, events, state_tx, latency_tx, shutdown_rx).await;
        });

        let handle = SessionHandle {
            commands: command_tx,
            events: event_tx,
            state: state_rx,
            latency: latency_rx,
        };
        Self { handle, shutdown_tx, _task: task }
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Gracefully stop the driver; the connection is closed on exit.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

// ── Driver loop ─────────────────────────────────────────────────────

async fn session_loop<T: Transport>(
    mut conn: Connection<T>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: broadcast::Sender<ConnectionEvent>,
    state_tx: watch::Sender<ConnectionState>,
    latency_tx: watch::Sender<Option<Duration>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut heartbeat = interval(conn.heartbeat_interval());
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        sync_state(&state_tx, conn.state());

        match conn.state() {
            ConnectionState::Connected => {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = heartbeat.tick() => {
                        if let Err(error) = conn.send_heartbeat().await {
                            warn!(%error, "heartbeat send failed");
                        }
                    }
                    maybe_command = commands.recv() => {
                        match maybe_command {
                            Some(command) => {
                                handle_command(&mut conn, command, &mut heartbeat, &events, &latency_tx)
                                    .await;
                            }
                            None => break,
                        }
                    }
                    received = conn.recv_event() => {
                        match received {
                            Ok(Some(event)) => publish_event(&events, &latency_tx, event),
                            Ok(None) => {}
                            Err(error) => debug!(%error, "receive skipped"),
                        }
                    }
                }
            }
            ConnectionState::Reconnecting => {
                let delay = conn.reconnect_delay();
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = sleep(delay) => {
                        attempt_connect(&mut conn, &mut heartbeat, &events, &latency_tx).await;
                    }
                    maybe_command = commands.recv() => {
                        match maybe_command {
                            Some(command) => {
                                handle_command(&mut conn, command, &mut heartbeat, &events, &latency_tx)
                                    .await;
                            }
                            None => break,
                        }
                    }
                }
            }
            // Disconnected, Error, and the transient Connecting all sit
            // idle until the caller acts.
            _ => {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    maybe_command = commands.recv() => {
                        match maybe_command {
                            Some(command) => {
                                handle_command(&mut conn, command, &mut heartbeat, &events, &latency_tx)
                                    .await;
                            }
                            None => break,
                        }
                    }
                }
            }
        }
    }

    conn.disconnect().await;
    sync_state(&state_tx, conn.state());
    debug!("session driver stopped");
}

async fn handle_command<T: Transport>(
    conn: &mut Connection<T>,
    command: Command,
    heartbeat: &mut Interval,
    events: &broadcast::Sender<ConnectionEvent>,
    latency_tx: &watch::Sender<Option<Duration>>,
) {
    match command {
        Command::Connect => {
            if conn.state() != ConnectionState::Connected {
                attempt_connect(conn, heartbeat, events, latency_tx).await;
            }
        }
        Command::Disconnect => {
            conn.disconnect().await;
            publish_event(
                events,
                latency_tx,
                ConnectionEvent::Disconnected {
                    reason: "disconnected by client".to_string(),
                    retrying: false,
                },
            );
        }
        Command::Send { body, channel, reply } => {
            let mut frame = conn.compose(body);
            if let Some(channel) = channel {
                frame = frame.with_channel(channel);
            }
            let _ = reply.send(conn.send(frame).await);
        }
        Command::Subscribe(channel) => conn.subscribe(&channel).await,
        Command::Unsubscribe(channel) => conn.unsubscribe(&channel).await,
    }
}

async fn attempt_connect<T: Transport>(
    conn: &mut Connection<T>,
    heartbeat: &mut Interval,
    events: &broadcast::Sender<ConnectionEvent>,
    latency_tx: &watch::Sender<Option<Duration>>,
) {
    match conn.connect().await {
        Ok(event) => {
            if matches!(event, ConnectionEvent::Connected) {
                heartbeat.reset();
            }
            publish_event(events, latency_tx, event);
        }
        Err(error) => {
            warn!(%error, "connect failed");
            publish_event(
                events,
                latency_tx,
                ConnectionEvent::Disconnected { reason: error.to_string(), retrying: false },
            );
        }
    }
}

fn publish_event(
    events: &broadcast::Sender<ConnectionEvent>,
    latency_tx: &watch::Sender<Option<Duration>>,
    event: ConnectionEvent,
) {
    if let ConnectionEvent::Latency(sample) = &event {
        let _ = latency_tx.send(Some(*sample));
    }
    let _ = events.send(event);
}

fn sync_state(state_tx: &watch::Sender<ConnectionState>, state: ConnectionState) {
    state_tx.send_if_modified(|current| {
        if *current == state {
            false
        } else {
            *current = state;
            true
        }
    });
}

// ── Tests ───────────────────────────────────────────────────────────
