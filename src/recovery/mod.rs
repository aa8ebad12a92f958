//! Transport reliability: the pending-acknowledgment buffer, the
//! connection-lifecycle manager, and the reliable-delivery channel.
//!
//! These three pieces add the guarantees UDP lacks when its datagrams are
//! carried over a tunnel: acknowledgment, retransmission, and automatic
//! reconnection with bounded backoff.
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │           ReliableChannel               │  sequence, buffer, resend
//! ├────────────────────┬────────────────────┤
//! │   PendingBuffer    │ ConnectionManager  │  unacked frames │ lifecycle
//! ├────────────────────┴────────────────────┤
//! │        injected send / connect fns      │
//! └─────────────────────────────────────────┘
//! ```

mod buffer;
mod channel;
mod connection;

pub use buffer::{BufferEntry, PendingBuffer};
pub use channel::{ChannelConfig, ReliableChannel, SendFn, SendFuture};
pub use connection::{
    ConnectFn, ConnectFuture, ConnectionManager, ConnectionPhase, RetryPolicy,
};
