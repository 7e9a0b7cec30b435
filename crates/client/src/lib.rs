// tandem-client: reconnecting transport and synchronization engine
// for the Tandem hub.

pub mod config;
pub mod session;
pub mod sync;
pub mod transport;
