//! WebSocket transport and client dispatch for flowhost.
//!
//! Provides:
//! - Wire protocol (tagged JSON message enums)
//! - `ClientDispatcher` - Per-connection request handling and the
//!   runner-to-client event bridge
//! - `ConnectionServer` - axum WebSocket server with admission control,
//!   stats, and broadcast

pub mod dispatcher;
pub mod protocol;
pub mod server;

pub use dispatcher::ClientDispatcher;
pub use protocol::{ClientMessage, ServerMessage};
pub use server::{ConnectionInfo, ConnectionServer, ServerState, ServerStatsSnapshot};
