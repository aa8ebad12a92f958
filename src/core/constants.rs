//! Protocol defaults.
//!
//! These mirror the tunnel's shipped configuration; every value can be
//! overridden through the client/server builders.

use std::time::Duration;

// =============================================================================
// SERVER DEFAULTS
// =============================================================================

/// Default server listen address.
pub const DEFAULT_SERVER_HOST: &str = "127.0.0.1";

/// Default server listen port.
pub const DEFAULT_SERVER_PORT: u16 = 11223;

/// Default cap on concurrent client sessions (hard admission reject).
pub const DEFAULT_MAX_CLIENTS: usize = 100;

/// Idle time before a session sends a heartbeat frame.
///
/// Keeps intermediary NAT/firewall state alive and exercises the peer's
/// ack path.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Consecutive read/processing errors after which a session is dropped.
pub const MAX_CONSECUTIVE_ERRORS: u32 = 5;

// =============================================================================
// RECOVERY DEFAULTS
// =============================================================================

/// Default capacity of the pending-acknowledgment buffer.
pub const DEFAULT_PENDING_CAPACITY: usize = 1000;

/// Default time an entry may sit unacknowledged before retransmission.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Default per-packet retransmission ceiling; past it the packet is
/// abandoned silently.
pub const DEFAULT_CHANNEL_MAX_RETRIES: u32 = 5;

/// Interval between retransmit-loop sweeps.
pub const RETRANSMIT_INTERVAL: Duration = Duration::from_secs(1);

/// Default ceiling on reconnection attempts per loss.
pub const DEFAULT_CONNECT_MAX_RETRIES: u32 = 10;

/// Default initial reconnection backoff.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Default reconnection backoff cap.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Fraction of the backoff applied as random jitter in either direction.
pub const DEFAULT_BACKOFF_JITTER: f64 = 0.1;

/// Floor for any backoff sleep, jitter included.
pub const MIN_BACKOFF: Duration = Duration::from_millis(100);

// =============================================================================
// PACKET LIMITS
// =============================================================================

/// Largest UDP payload the tunnel carries (IPv4 maximum datagram payload).
pub const MAX_UDP_PAYLOAD: usize = 65507;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ordering() {
        assert!(MIN_BACKOFF < DEFAULT_INITIAL_BACKOFF);
        assert!(DEFAULT_INITIAL_BACKOFF < DEFAULT_MAX_BACKOFF);
        assert!(RETRANSMIT_INTERVAL < DEFAULT_ACK_TIMEOUT);
    }
}
