// tandem-hub: WebSocket fan-out hub for Tandem collaboration sessions.
//
// Clients connect to `/ws`, receive a welcome frame carrying their
// assigned id, and exchange protocol frames that the hub routes between
// named rooms. See `handler` for the routing rules and `sweep` for the
// liveness timer.

pub mod clients;
pub mod config;
pub mod handler;
pub mod presence;
pub mod rooms;
pub mod sweep;

use std::io;

use tokio::net::TcpListener;

use crate::clients::ClientRegistry;
use crate::config::HubConfig;
use crate::presence::PresenceRegistry;
use crate::rooms::RoomRegistry;

pub use crate::handler::router;

/// Everything the handlers share: configuration plus the three
/// registries. Cheap to clone; the registries are handles to shared maps.
#[derive(Debug, Clone, Default)]
pub struct HubState {
    pub config: HubConfig,
    pub clients: ClientRegistry,
    pub rooms: RoomRegistry,
    pub presence: PresenceRegistry,
}

impl HubState {
    pub fn new(config: HubConfig) -> Self {
        Self { config, ..Self::default() }
    }
}

/// Serve the hub on an already-bound listener, sweep included, until the
/// future is dropped. The binary attaches its own shutdown signal; tests
/// bind port 0 and spawn this directly.
pub async fn serve(listener: TcpListener, state: HubState) -> io::Result<()> {
    let sweeper = tokio::spawn(sweep::sweep_loop(state.clone()));
    let result = axum::serve(listener, router(state)).await;
    sweeper.abort();
    result
}
