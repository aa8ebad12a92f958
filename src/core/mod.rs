//! Core types: the [`Packet`] value object, shared error enums, and
//! protocol defaults.

pub mod constants;
mod error;
mod packet;

pub use error::*;
pub use packet::Packet;

pub(crate) use packet::unix_timestamp;
