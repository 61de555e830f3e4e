//! Protocol message types

use crate::metadata::Metadata;
use serde::{Deserialize, Serialize};

/// Correlates a `DialRequest` with its `DialResponse` before a connection exists
pub type DialId = u64;

/// Identifies an established logical connection on one stream
pub type ConnectId = u64;

/// Everything that travels on a physical stream
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Frame {
    /// First frame sent by the side that opened the stream
    Open { metadata: Metadata },
    /// Handshake accepted, carries the acceptor's metadata
    Accepted { metadata: Metadata },
    /// Handshake refused; the stream is closed right after
    Rejected { reason: String },
    Ping { timestamp: u64 },
    Pong { timestamp: u64 },
    Packet(Packet),
}

/// Tunnel packets multiplexed over a stream
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Packet {
    DialRequest {
        random: DialId,
        protocol: String,
        address: String,
        /// Deadline the dialer is willing to wait, informational for the agent
        timeout_hint_ms: Option<u64>,
    },
    DialResponse {
        random: DialId,
        connect_id: ConnectId,
        error: Option<String>,
    },
    /// The dial initiator gave up before a connection token existed
    DialClose { random: DialId },
    Data {
        connect_id: ConnectId,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
    CloseRequest {
        connect_id: ConnectId,
        error: Option<String>,
    },
    CloseResponse {
        connect_id: ConnectId,
        error: Option<String>,
    },
}

impl Packet {
    /// Short name used in log lines
    pub fn kind(&self) -> &'static str {
        match self {
            Packet::DialRequest { .. } => "DIAL_REQ",
            Packet::DialResponse { .. } => "DIAL_RSP",
            Packet::DialClose { .. } => "DIAL_CLS",
            Packet::Data { .. } => "DATA",
            Packet::CloseRequest { .. } => "CLOSE_REQ",
            Packet::CloseResponse { .. } => "CLOSE_RSP",
        }
    }
}

impl From<Packet> for Frame {
    fn from(packet: Packet) -> Self {
        Frame::Packet(packet)
    }
}

// Payloads are serialized as a byte string rather than a sequence of u8
mod serde_bytes {
    use serde::de::{Deserializer, SeqAccess, Visitor};
    use serde::Serializer;
    use std::fmt;

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(data)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_byte_buf(BytesVisitor)
    }

    struct BytesVisitor;

    impl<'de> Visitor<'de> for BytesVisitor {
        type Value = Vec<u8>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a byte string")
        }

        fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<Vec<u8>, E> {
            Ok(v.to_vec())
        }

        fn visit_byte_buf<E: serde::de::Error>(self, v: Vec<u8>) -> Result<Vec<u8>, E> {
            Ok(v)
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Vec<u8>, A::Error> {
            let mut data = Vec::with_capacity(seq.size_hint().unwrap_or(0));
            while let Some(byte) = seq.next_element()? {
                data.push(byte);
            }
            Ok(data)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_kind() {
        let packet = Packet::DialClose { random: 7 };
        assert_eq!(packet.kind(), "DIAL_CLS");

        let packet = Packet::CloseResponse {
            connect_id: 1,
            error: Some("boom".into()),
        };
        assert_eq!(packet.kind(), "CLOSE_RSP");
    }

    #[test]
    fn test_data_payload_bincode() {
        let frame = Frame::from(Packet::Data {
            connect_id: 9,
            data: vec![0u8; 1024],
        });

        let encoded = bincode::serialize(&frame).unwrap();
        // Byte strings keep the payload compact: one length prefix, no per-element overhead
        assert!(encoded.len() < 1024 + 32);

        let decoded: Frame = bincode::deserialize(&encoded).unwrap();
        assert_eq!(decoded, frame);
    }
}
