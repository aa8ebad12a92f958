//! Tunnel server.

pub(crate) mod server;
mod session;

pub use server::{ServerConfig, ServerStats, TunnelServer, TunnelServerBuilder};
pub use session::ClientSession;
