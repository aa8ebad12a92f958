//! Wire frame codec.
//!
//! One frame is one newline-terminated, UTF-8 JSON object on the TCP
//! stream. The frame space is a closed tagged union: a payload frame, an
//! ack control frame, or an error frame, never a mixture. Classification
//! is by key (`_ack`, then `error`, then `payload`) and anything else is
//! rejected at the boundary.

use serde::{Deserialize, Serialize};

use crate::core::{unix_timestamp, FrameError, Packet};

/// Delivery metadata attached to frames that participate in the
/// acknowledgment protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    /// Frame id, `"<unix-seconds>:<sequence>"`.
    pub id: String,
    /// 32-bit sequence number (wraps).
    pub seq: u32,
    /// Send time as fractional unix seconds.
    pub timestamp: f64,
    /// Whether the receiver must reply with an ack frame.
    pub requires_ack: bool,
}

impl Meta {
    /// Stamp fresh metadata for the given sequence number.
    ///
    /// The id combines coarse wall-clock seconds with the sequence number;
    /// collision would need the 32-bit counter to wrap within one second
    /// and is treated as negligible.
    pub fn fresh(seq: u32, requires_ack: bool) -> Self {
        let timestamp = unix_timestamp();
        Self {
            id: format!("{}:{}", timestamp as u64, seq),
            seq,
            timestamp,
            requires_ack,
        }
    }
}

/// A tunneled UDP datagram on the wire.
///
/// `dest_addr`/`dest_port` are serialized as explicit nulls when absent,
/// matching the wire format; `timestamp` and `_meta` are omitted entirely
/// when unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadFrame {
    /// Hex-encoded datagram payload.
    pub payload: String,
    /// Source IPv4 address, dotted quad.
    pub source_addr: String,
    /// Source port.
    pub source_port: u16,
    /// Destination IPv4 address, if routed.
    #[serde(default)]
    pub dest_addr: Option<String>,
    /// Destination port, if routed.
    #[serde(default)]
    pub dest_port: Option<u16>,
    /// Send time as fractional unix seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
    /// Delivery metadata, present when the frame participates in acks.
    #[serde(rename = "_meta", default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
}

/// Acknowledgment control frame: `{"_ack": "<id>"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AckFrame {
    /// Id of the frame being acknowledged.
    #[serde(rename = "_ack")]
    pub id: String,
}

/// Structured error reply: `{"error": "<message>", "_meta": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorFrame {
    /// Human-readable error message.
    pub error: String,
    /// Metadata stamped on the reply (`requires_ack` is always false).
    #[serde(rename = "_meta", default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
}

/// One wire frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Frame {
    /// Tunneled datagram.
    Payload(PayloadFrame),
    /// Acknowledgment.
    Ack(AckFrame),
    /// Structured error reply.
    Error(ErrorFrame),
}

impl Frame {
    /// Decode one line into a frame.
    ///
    /// Classification is deterministic: a `_ack` key makes the frame an
    /// ack (and nothing else may be present), an `error` key makes it an
    /// error frame, a `payload` key makes it a payload frame. Unknown
    /// extra keys on payload frames (the original wire also carried a
    /// derived `size`) are tolerated.
    pub fn decode(line: &str) -> Result<Self, FrameError> {
        let value: serde_json::Value = serde_json::from_str(line)?;
        let Some(obj) = value.as_object() else {
            return Err(FrameError::UnrecognizedShape(
                "frame is not a JSON object".into(),
            ));
        };

        if obj.contains_key("_ack") {
            let ack: AckFrame = serde_json::from_value(value)?;
            Ok(Frame::Ack(ack))
        } else if obj.contains_key("error") {
            let err: ErrorFrame = serde_json::from_value(value)?;
            Ok(Frame::Error(err))
        } else if obj.contains_key("payload") {
            let mut obj = obj.clone();
            obj.remove("size");
            let payload: PayloadFrame = serde_json::from_value(serde_json::Value::Object(obj))?;
            Ok(Frame::Payload(payload))
        } else {
            let keys: Vec<&str> = obj.keys().map(String::as_str).collect();
            Err(FrameError::UnrecognizedShape(format!(
                "no _ack, error, or payload key in {{{}}}",
                keys.join(", ")
            )))
        }
    }

    /// Encode the frame as one JSON object, without the line terminator.
    pub fn encode(&self) -> Result<String, FrameError> {
        Ok(serde_json::to_string(self)?)
    }

    /// The frame's metadata, if any.
    pub fn meta(&self) -> Option<&Meta> {
        match self {
            Frame::Payload(f) => f.meta.as_ref(),
            Frame::Error(f) => f.meta.as_ref(),
            Frame::Ack(_) => None,
        }
    }
}

impl PayloadFrame {
    /// Build a frame from a packet, stamping the current wall-clock time.
    pub fn from_packet(packet: &Packet) -> Self {
        Self {
            payload: hex::encode(packet.payload()),
            source_addr: packet.source_addr().to_string(),
            source_port: packet.source_port(),
            dest_addr: packet.dest_addr().map(|a| a.to_string()),
            dest_port: packet.dest_port(),
            timestamp: Some(unix_timestamp()),
            meta: None,
        }
    }

    /// Decode the frame back into a packet.
    ///
    /// Payload and addressing fields round-trip byte-identically.
    pub fn to_packet(&self) -> Result<Packet, FrameError> {
        let payload = hex::decode(&self.payload)?;
        let mut packet = Packet::new(payload, &self.source_addr, self.source_port)?;
        if let (Some(addr), Some(port)) = (&self.dest_addr, self.dest_port) {
            let addr = addr
                .parse()
                .map_err(|_| crate::core::PacketError::InvalidAddress(addr.clone()))?;
            packet.set_destination_parts(addr, port)?;
        }
        if let Some(ts) = self.timestamp {
            packet.set_timestamp(ts);
        }
        Ok(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_ack() {
        let frame = Frame::decode(r#"{"_ack":"1700000000:7"}"#).unwrap();
        assert_eq!(
            frame,
            Frame::Ack(AckFrame {
                id: "1700000000:7".into()
            })
        );
    }

    #[test]
    fn test_ack_with_payload_rejected() {
        // Never both an ack and a payload frame
        let err = Frame::decode(r#"{"_ack":"1:1","payload":"00"}"#).unwrap_err();
        assert!(matches!(err, FrameError::InvalidJson(_)));
    }

    #[test]
    fn test_decode_error_frame() {
        let frame = Frame::decode(r#"{"error":"invalid JSON packet"}"#).unwrap();
        match frame {
            Frame::Error(e) => assert_eq!(e.error, "invalid JSON packet"),
            other => panic!("expected error frame, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_payload_with_meta() {
        let line = r#"{"payload":"48656c6c6f","source_addr":"127.0.0.1","source_port":5000,
                       "dest_addr":null,"dest_port":null,"timestamp":1.5,
                       "_meta":{"id":"1:0","seq":0,"timestamp":1.5,"requires_ack":true}}"#;
        let frame = Frame::decode(line).unwrap();
        match frame {
            Frame::Payload(p) => {
                assert_eq!(p.payload, "48656c6c6f");
                assert!(p.dest_addr.is_none());
                let meta = p.meta.unwrap();
                assert_eq!(meta.seq, 0);
                assert!(meta.requires_ack);
            }
            other => panic!("expected payload frame, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_tolerates_size_field() {
        let line = r#"{"payload":"00","source_addr":"10.0.0.1","source_port":1,"size":1}"#;
        assert!(matches!(Frame::decode(line), Ok(Frame::Payload(_))));
    }

    #[test]
    fn test_unrecognized_shape_rejected() {
        let err = Frame::decode(r#"{"hello":"world"}"#).unwrap_err();
        assert!(matches!(err, FrameError::UnrecognizedShape(_)));

        let err = Frame::decode("[1,2,3]").unwrap_err();
        assert!(matches!(err, FrameError::UnrecognizedShape(_)));
    }

    #[test]
    fn test_invalid_json_rejected() {
        assert!(Frame::decode("not json").is_err());
        assert!(Frame::decode("").is_err());
    }

    #[test]
    fn test_packet_roundtrip() {
        let packet = Packet::with_destination(
            &b"Hello"[..],
            ("127.0.0.1", 5000),
            ("192.168.0.9", 7001),
        )
        .unwrap();

        let frame = PayloadFrame::from_packet(&packet);
        let line = Frame::Payload(frame).encode().unwrap();
        assert!(!line.contains('\n'));

        let decoded = match Frame::decode(&line).unwrap() {
            Frame::Payload(p) => p.to_packet().unwrap(),
            other => panic!("expected payload frame, got {:?}", other),
        };
        assert_eq!(decoded.payload(), packet.payload());
        assert_eq!(decoded.source_addr(), packet.source_addr());
        assert_eq!(decoded.source_port(), packet.source_port());
        assert_eq!(decoded.dest_addr(), packet.dest_addr());
        assert_eq!(decoded.dest_port(), packet.dest_port());
    }

    #[test]
    fn test_bad_hex_rejected() {
        let frame = PayloadFrame {
            payload: "zz".into(),
            source_addr: "127.0.0.1".into(),
            source_port: 1,
            dest_addr: None,
            dest_port: None,
            timestamp: None,
            meta: None,
        };
        assert!(matches!(frame.to_packet(), Err(FrameError::InvalidHex(_))));
    }

    #[test]
    fn test_meta_fresh_id_format() {
        let meta = Meta::fresh(42, true);
        let (secs, seq) = meta.id.split_once(':').unwrap();
        assert_eq!(seq, "42");
        assert!(secs.parse::<u64>().unwrap() > 0);
        assert!(meta.requires_ack);
    }

    #[test]
    fn test_encode_null_destination() {
        let frame = PayloadFrame {
            payload: "00".into(),
            source_addr: "127.0.0.1".into(),
            source_port: 9,
            dest_addr: None,
            dest_port: None,
            timestamp: None,
            meta: None,
        };
        let line = Frame::Payload(frame).encode().unwrap();
        // Destination fields stay on the wire as explicit nulls
        assert!(line.contains(r#""dest_addr":null"#));
        assert!(line.contains(r#""dest_port":null"#));
        // Unset timestamp and meta are omitted
        assert!(!line.contains("timestamp"));
        assert!(!line.contains("_meta"));
    }
}
