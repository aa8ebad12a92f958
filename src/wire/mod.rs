//! Wire protocol: newline-delimited JSON frames over a long-lived TCP
//! stream.
//!
//! - **Payload frame**: a tunneled UDP datagram with addressing fields and
//!   optional delivery metadata.
//! - **Ack frame**: `{"_ack": "<id>"}` confirming receipt of a frame.
//! - **Error frame**: `{"error": "<message>", "_meta": {...}}` replied to
//!   malformed input.
//!
//! There is no other framing: one JSON object per line, UTF-8 encoded.

mod frame;

pub use frame::*;
