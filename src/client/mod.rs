//! Tunnel client.

mod client;

pub use client::{
    ClientConfig, ClientMetrics, PacketReceiver, TunnelClient, TunnelClientBuilder,
    DEFAULT_RECV_QUEUE,
};
