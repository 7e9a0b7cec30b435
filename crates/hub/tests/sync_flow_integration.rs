// Two full client stacks (transport, session, engine) talking through a
// served hub: the wire-level proof that a change pushed on one side is
// applied exactly once on the other, and that advisory locks exclude
// peers across the network.

use std::net::SocketAddr;
use std::time::Duration;

use tandem_client::session::Session;
use tandem_client::sync::engine::{ChangeDraft, EngineConfig};
use tandem_client::sync::{SyncEngine, SyncEvent};
use tandem_client::transport::ws::WsTransport;
use tandem_client::transport::{Connection, ConnectionConfig, ConnectionState};
use tandem_common::change::Change;
use tandem_common::protocol::{entity_channel, LOCKS_CHANNEL};
use tandem_hub::config::HubConfig;
use tandem_hub::{serve, HubState};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout, timeout_at, Instant};

async fn start_hub() -> (SocketAddr, HubState) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("test listener should bind");
    let addr = listener.local_addr().expect("listener should expose local address");
    let state = HubState::new(HubConfig::default());
    let state_for_server = state.clone();
    tokio::spawn(async move {
        serve(listener, state_for_server).await.expect("hub should run");
    });
    (addr, state)
}

/// Bring up a full client stack and wait until it is connected. The
/// session must outlive the engine, so both are returned.
async fn connect_engine(addr: SocketAddr, user: &str) -> (Session, SyncEngine) {
    let config = ConnectionConfig::new(format!("ws://{addr}/ws"), user);
    let connection = Connection::new(config, WsTransport::new());
    let session = Session::spawn(connection);
    let handle = session.handle();
    handle.connect().expect("connect command should queue");

    let mut states = handle.state_changes();
    timeout(Duration::from_secs(5), states.wait_for(|s| *s == ConnectionState::Connected))
        .await
        .expect("timed out waiting for the connection")
        .expect("state channel should stay open");

    let engine =
        SyncEngine::spawn(handle, user, EngineConfig::default()).expect("engine should spawn");
    (session, engine)
}

async fn wait_for_members(state: &HubState, channel: &str, expected: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while state.rooms.members(channel).await.len() != expected {
        assert!(Instant::now() < deadline, "room {channel} never reached {expected} members");
        sleep(Duration::from_millis(20)).await;
    }
}

async fn next_remote_change(events: &mut broadcast::Receiver<SyncEvent>) -> Change {
    timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await.expect("event stream should stay open") {
                SyncEvent::RemoteChange(change) => return change,
                _ => {}
            }
        }
    })
    .await
    .expect("timed out waiting for the remote change")
}

#[tokio::test]
async fn a_pushed_change_reaches_the_peer_exactly_once() {
    let (addr, state) = start_hub().await;
    let (_session_x, engine_x) = connect_engine(addr, "user-x").await;
    let (_session_y, engine_y) = connect_engine(addr, "user-y").await;

    let channel = entity_channel("order", "42");
    engine_x.start_sync("order", "42").await.expect("x should start syncing");
    engine_y.start_sync("order", "42").await.expect("y should start syncing");
    wait_for_members(&state, &channel, 2).await;

    let mut events_y = engine_y.events();
    let pushed = engine_x
        .push_change(ChangeDraft::update(
            "order",
            "42",
            "status",
            Some(serde_json::json!("pending")),
            Some(serde_json::json!("shipped")),
        ))
        .await
        .expect("push should broadcast");

    let received = next_remote_change(&mut events_y).await;
    assert_eq!(received.id, pushed.id);
    assert_eq!(received.user_id, "user-x");
    assert_eq!(received.after, pushed.after);

    // A quiet window with no second delivery of the same change.
    let mut duplicate = false;
    let quiet_until = Instant::now() + Duration::from_millis(300);
    loop {
        match timeout_at(quiet_until, events_y.recv()).await {
            Ok(Ok(SyncEvent::RemoteChange(change))) => {
                if change.id == pushed.id {
                    duplicate = true;
                }
            }
            Ok(Ok(_)) => {}
            Ok(Err(_)) | Err(_) => break,
        }
    }
    assert!(!duplicate, "the change should be applied exactly once");

    let history = engine_y.change_history().await;
    assert_eq!(history.iter().filter(|c| c.id == pushed.id).count(), 1);

    // The author does not re-apply its own echo either.
    let history = engine_x.change_history().await;
    assert_eq!(history.iter().filter(|c| c.id == pushed.id).count(), 1);
}

#[tokio::test]
async fn advisory_locks_exclude_peers_until_released() {
    let (addr, state) = start_hub().await;
    let (_session_x, engine_x) = connect_engine(addr, "user-x").await;
    let (_session_y, engine_y) = connect_engine(addr, "user-y").await;
    wait_for_members(&state, LOCKS_CHANNEL, 2).await;

    let granted = engine_x
        .acquire_lock("order", "42")
        .await
        .expect("acquire should send")
        .expect("the lock should be granted");
    assert_eq!(granted.locked_by, "user-x");

    let deadline = Instant::now() + Duration::from_secs(5);
    while !engine_y.is_locked("order", "42").await {
        assert!(Instant::now() < deadline, "the lock signal never reached the peer");
        sleep(Duration::from_millis(20)).await;
    }
    let denied = engine_y.acquire_lock("order", "42").await.expect("acquire should send");
    assert!(denied.is_none(), "the peer must be refused while the lock is held");

    assert!(engine_x.release_lock("order", "42").await.expect("release should send"));
    let deadline = Instant::now() + Duration::from_secs(5);
    while engine_y.is_locked("order", "42").await {
        assert!(Instant::now() < deadline, "the release never reached the peer");
        sleep(Duration::from_millis(20)).await;
    }

    let taken_over = engine_y
        .acquire_lock("order", "42")
        .await
        .expect("acquire should send")
        .expect("the freed lock should pass to the peer");
    assert_eq!(taken_over.locked_by, "user-y");
}
