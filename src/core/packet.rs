//! The UDP datagram value object.
//!
//! A [`Packet`] is created at ingress (from a local UDP receive or from wire
//! decode), may have its destination assigned exactly once during routing,
//! and is consumed on handoff. It is never mutated concurrently.

use std::net::Ipv4Addr;
use std::time::{SystemTime, UNIX_EPOCH};

use super::constants::MAX_UDP_PAYLOAD;
use super::error::PacketError;

/// Current wall-clock time as fractional unix seconds.
pub(crate) fn unix_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// A UDP datagram with addressing metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    payload: Vec<u8>,
    source_addr: Ipv4Addr,
    source_port: u16,
    dest_addr: Option<Ipv4Addr>,
    dest_port: Option<u16>,
    timestamp: f64,
}

impl Packet {
    /// Create a packet from a payload and source addressing.
    ///
    /// The source address must be a valid IPv4 dotted quad. The creation
    /// timestamp is taken from the wall clock.
    pub fn new(
        payload: impl Into<Vec<u8>>,
        source_addr: &str,
        source_port: u16,
    ) -> Result<Self, PacketError> {
        let source_addr = parse_addr(source_addr)?;
        Self::from_parts(payload.into(), source_addr, source_port)
    }

    /// Create a packet from already-typed addressing.
    pub fn from_parts(
        payload: Vec<u8>,
        source_addr: Ipv4Addr,
        source_port: u16,
    ) -> Result<Self, PacketError> {
        if payload.len() > MAX_UDP_PAYLOAD {
            return Err(PacketError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_UDP_PAYLOAD,
            });
        }
        Ok(Self {
            payload,
            source_addr,
            source_port,
            dest_addr: None,
            dest_port: None,
            timestamp: unix_timestamp(),
        })
    }

    /// Create a packet with both source and destination assigned.
    pub fn with_destination(
        payload: impl Into<Vec<u8>>,
        source: (&str, u16),
        destination: (&str, u16),
    ) -> Result<Self, PacketError> {
        let mut packet = Self::new(payload, source.0, source.1)?;
        packet.set_destination(destination.0, destination.1)?;
        Ok(packet)
    }

    /// Assign the destination. May be called exactly once.
    pub fn set_destination(&mut self, addr: &str, port: u16) -> Result<(), PacketError> {
        if self.dest_addr.is_some() {
            return Err(PacketError::DestinationAlreadySet);
        }
        self.dest_addr = Some(parse_addr(addr)?);
        self.dest_port = Some(port);
        Ok(())
    }

    pub(crate) fn set_destination_parts(
        &mut self,
        addr: Ipv4Addr,
        port: u16,
    ) -> Result<(), PacketError> {
        if self.dest_addr.is_some() {
            return Err(PacketError::DestinationAlreadySet);
        }
        self.dest_addr = Some(addr);
        self.dest_port = Some(port);
        Ok(())
    }

    pub(crate) fn set_timestamp(&mut self, timestamp: f64) {
        self.timestamp = timestamp;
    }

    /// The datagram payload.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Payload size in bytes.
    pub fn size(&self) -> usize {
        self.payload.len()
    }

    /// Source IPv4 address.
    pub fn source_addr(&self) -> Ipv4Addr {
        self.source_addr
    }

    /// Source port.
    pub fn source_port(&self) -> u16 {
        self.source_port
    }

    /// Destination IPv4 address, if assigned.
    pub fn dest_addr(&self) -> Option<Ipv4Addr> {
        self.dest_addr
    }

    /// Destination port, if assigned.
    pub fn dest_port(&self) -> Option<u16> {
        self.dest_port
    }

    /// Creation time as fractional unix seconds.
    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    /// Consume the packet, returning its payload.
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}

fn parse_addr(addr: &str) -> Result<Ipv4Addr, PacketError> {
    addr.parse()
        .map_err(|_| PacketError::InvalidAddress(addr.to_string()))
}
