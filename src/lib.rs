//! # udptun
//!
//! A reliability layer for tunneling UDP datagrams over a persistent TCP
//! connection. Datagrams are carried as newline-delimited JSON frames with
//! hex-encoded payloads, and the transport survives the failure modes TCP
//! alone does not cover:
//!
//! - **Delivery**: at-least-once semantics via per-frame acknowledgments,
//!   a bounded retransmit buffer, and a periodic retransmit loop
//! - **Recovery**: automatic reconnection with capped exponential backoff
//!   and jitter
//! - **Liveness**: server-side heartbeat probes on idle connections
//! - **Admission**: a hard cap on concurrent client sessions
//!
//! ## Crate Organization
//!
//! - [`core`]: packet value object, errors, protocol constants
//! - [`wire`]: the JSON line protocol (payload, ack, and error frames)
//! - [`recovery`]: pending buffer, reliable channel, connection manager
//! - [`client`]: high-level [`TunnelClient`] API
//! - [`server`]: high-level [`TunnelServer`] API
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use udptun::prelude::*;
//!
//! let server = TunnelServerBuilder::new().bind("0.0.0.0", 11223).build();
//! server.start().await?;
//!
//! let (client, mut packets) = TunnelClientBuilder::new()
//!     .server("127.0.0.1", 11223)
//!     .build();
//! client.send_packet(Packet::new(&b"hello"[..], "127.0.0.1", 5000)?).await?;
//! let echoed = packets.recv().await;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod core;
pub mod recovery;
pub mod server;
pub mod wire;

pub use client::{ClientConfig, ClientMetrics, PacketReceiver, TunnelClient, TunnelClientBuilder};
pub use core::{ClientError, ConnectionError, FrameError, Packet, PacketError, ServerError};
pub use recovery::{ChannelConfig, ConnectionPhase, RetryPolicy};
pub use server::{ClientSession, ServerConfig, ServerStats, TunnelServer, TunnelServerBuilder};

/// Commonly used types, importable in one line.
pub mod prelude {
    pub use crate::client::{PacketReceiver, TunnelClient, TunnelClientBuilder};
    pub use crate::core::{Packet, PacketError};
    pub use crate::recovery::{ChannelConfig, RetryPolicy};
    pub use crate::server::{TunnelServer, TunnelServerBuilder};
    pub use crate::wire::Frame;
}
