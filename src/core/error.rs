//! Error types shared across the tunnel.

use thiserror::Error;

/// Errors raised while constructing or routing a [`Packet`](super::Packet).
///
/// These indicate programming or integration defects, not transient network
/// conditions, so they are raised synchronously to the caller.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    /// Address is not a valid IPv4 dotted quad.
    #[error("invalid IPv4 address: {0}")]
    InvalidAddress(String),

    /// Payload exceeds the maximum UDP datagram size.
    #[error("payload of {size} bytes exceeds maximum of {max}")]
    PayloadTooLarge {
        /// Offending payload length.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Destination was already assigned; it may be set exactly once.
    #[error("destination already assigned")]
    DestinationAlreadySet,
}

/// Errors raised by the wire codec.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Line is not valid JSON.
    #[error("invalid JSON frame: {0}")]
    InvalidJson(#[from] serde_json::Error),

    /// JSON parsed but does not match any recognized frame shape.
    #[error("unrecognized frame shape: {0}")]
    UnrecognizedShape(String),

    /// Payload field is not a valid hex string.
    #[error("invalid payload hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    /// Frame decoded but its packet fields are invalid.
    #[error("invalid packet fields: {0}")]
    InvalidPacket(#[from] PacketError),
}

/// Errors raised by the connection manager.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The injected connect function failed.
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// All reconnection attempts were exhausted.
    #[error("gave up after {attempts} connection attempts")]
    RetriesExhausted {
        /// Number of attempts made.
        attempts: u32,
    },

    /// I/O error on the underlying stream.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Clone for ConnectionError {
    fn clone(&self) -> Self {
        match self {
            Self::ConnectFailed(msg) => Self::ConnectFailed(msg.clone()),
            Self::RetriesExhausted { attempts } => Self::RetriesExhausted {
                attempts: *attempts,
            },
            Self::Io(e) => Self::ConnectFailed(e.to_string()),
        }
    }
}

/// Errors raised by the tunnel client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Could not establish or re-establish the server connection.
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Write on the tunnel stream failed.
    #[error("send failed: {0}")]
    SendFailed(std::io::Error),

    /// Packet construction or routing failure.
    #[error("packet error: {0}")]
    Packet(#[from] PacketError),

    /// Client has been closed.
    #[error("client closed")]
    Closed,
}

/// Errors raised by the tunnel server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind the listen address.
    #[error("bind failed: {0}")]
    BindFailed(std::io::Error),

    /// Server is already running.
    #[error("server already running")]
    AlreadyRunning,

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
