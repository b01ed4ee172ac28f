//! NEXUS wire protocol: header framing, core payloads, and constants.
//!
//! The protocol is designed for:
//! - Minimal overhead (8-byte header)
//! - Fast path for forwarding (magic check, then lookup)
//! - Payload-agnostic relaying of game traffic
//!
//! # Packet Format
//!
//! All packets share a common header, little-endian throughout:
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |          Magic (0x4E45)       |    Version    |     Type      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |           Sequence            |   Sender ID   |    Dest ID    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Type codes 0x01-0x0F carry protocol semantics; anything >= 0x10 is an
//! opaque game packet forwarded byte-for-byte by the relay.

#![forbid(unsafe_code)]

mod payload;

pub use payload::{Payload, RegistryEntry, RECONNECT_TOKEN_LEN};

use thiserror::Error;

/// Magic number identifying NEXUS packets ("NE").
pub const MAGIC: u16 = 0x4E45;

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Fixed header size in bytes.
pub const HEADER_SIZE: usize = 8;

/// Largest payload a single UDP datagram can carry.
pub const MAX_PAYLOAD_SIZE: usize = 65_507;

/// Maximum player/registry name length in UTF-8 bytes.
pub const MAX_NAME_LEN: usize = 64;

/// Maximum description/deny-reason length in UTF-8 bytes.
pub const MAX_DESCRIPTION_LEN: usize = 256;

/// Maximum entry count for list payloads (registry entries, ACK sequences).
pub const MAX_LIST_COUNT: u32 = 100;

/// Sender/destination id meaning "unassigned" (and broadcast as destination).
pub const UNASSIGNED_ID: u8 = 0;

/// The host always occupies client id 1.
pub const HOST_ID: u8 = 1;

/// Destination id addressing every other session participant.
pub const BROADCAST_ID: u8 = 0;

/// First client id a host may assign.
pub const MIN_CLIENT_ID: u8 = 2;

/// Last client id a host may assign.
pub const MAX_CLIENT_ID: u8 = 254;

/// First type code treated as an opaque game packet.
pub const GAME_PACKET_BASE: u8 = 0x10;

/// Core packet types (0x01-0x0F).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Client asking to join a session.
    ConnectRequest = 0x01,
    /// Host accepting a join (also used by the host to register its session).
    ConnectAccept = 0x02,
    /// Host refusing a join, with a reason.
    ConnectDeny = 0x03,
    /// Session parameters, delivered reliably.
    SessionConfig = 0x04,
    /// Advertisement of application packet types.
    PacketTypeRegistry = 0x05,
    /// Client keepalive probe.
    Ping = 0x0B,
    /// Host keepalive echo.
    Pong = 0x0C,
    /// Sender is leaving.
    DisconnectNotice = 0x0D,
    /// Acknowledgment of reliable sequences.
    Ack = 0x0E,
    /// Client asking to resume a previous identity.
    ReconnectRequest = 0x0F,
}

impl TryFrom<u8> for PacketType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::ConnectRequest),
            0x02 => Ok(Self::ConnectAccept),
            0x03 => Ok(Self::ConnectDeny),
            0x04 => Ok(Self::SessionConfig),
            0x05 => Ok(Self::PacketTypeRegistry),
            0x0B => Ok(Self::Ping),
            0x0C => Ok(Self::Pong),
            0x0D => Ok(Self::DisconnectNotice),
            0x0E => Ok(Self::Ack),
            0x0F => Ok(Self::ReconnectRequest),
            _ => Err(WireError::UnknownPacketType(value)),
        }
    }
}

/// Wire protocol errors. Every variant maps to a dropped packet; none of
/// them is ever signalled back to the peer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("packet too short: {0} bytes, minimum {1}")]
    TooShort(usize, usize),

    #[error("invalid magic: 0x{0:04x}, expected 0x{1:04x}")]
    InvalidMagic(u16, u16),

    #[error("unknown packet type: 0x{0:02x}")]
    UnknownPacketType(u8),

    #[error("payload exceeds {MAX_PAYLOAD_SIZE} bytes: {0}")]
    PayloadTooLarge(usize),

    #[error("declared length {0} exceeds maximum {1}")]
    LengthOverflow(usize, usize),

    #[error("list count {0} exceeds maximum {MAX_LIST_COUNT}")]
    CountOverflow(u32),

    #[error("name is empty after sanitization")]
    EmptyName,

    #[error("string is not valid UTF-8")]
    InvalidUtf8,

    #[error("session id must be non-zero")]
    InvalidSessionId,

    #[error("reconnect token must be {RECONNECT_TOKEN_LEN} bytes, got {0}")]
    InvalidTokenLength(usize),

    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),
}

/// Packet header (8 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Protocol version. The codec does not enforce it; version policy
    /// belongs to the recipient.
    pub version: u8,
    /// Raw type code. 0x01-0x0F are core, >= 0x10 opaque.
    pub packet_type: u8,
    /// Sender-assigned sequence number.
    pub sequence: u16,
    /// 0 = unassigned, 1 = host, 2-254 = clients.
    pub sender_id: u8,
    /// 0 = broadcast, 1 = host, 2+ = specific client.
    pub destination_id: u8,
}

impl Header {
    /// Create a header with the current protocol version.
    pub fn new(packet_type: u8, sequence: u16, sender_id: u8, destination_id: u8) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            packet_type,
            sequence,
            sender_id,
            destination_id,
        }
    }

    /// Encode the header into the front of `buf`.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, WireError> {
        if buf.len() < HEADER_SIZE {
            return Err(WireError::TooShort(buf.len(), HEADER_SIZE));
        }

        buf[0..2].copy_from_slice(&MAGIC.to_le_bytes());
        buf[2] = self.version;
        buf[3] = self.packet_type;
        buf[4..6].copy_from_slice(&self.sequence.to_le_bytes());
        buf[6] = self.sender_id;
        buf[7] = self.destination_id;

        Ok(HEADER_SIZE)
    }

    /// Decode a header from the front of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < HEADER_SIZE {
            return Err(WireError::TooShort(buf.len(), HEADER_SIZE));
        }

        let magic = u16::from_le_bytes([buf[0], buf[1]]);
        if magic != MAGIC {
            return Err(WireError::InvalidMagic(magic, MAGIC));
        }

        Ok(Self {
            version: buf[2],
            packet_type: buf[3],
            sequence: u16::from_le_bytes([buf[4], buf[5]]),
            sender_id: buf[6],
            destination_id: buf[7],
        })
    }

    /// Fast pre-check before full parsing: length and magic only.
    pub fn quick_check(buf: &[u8]) -> bool {
        buf.len() >= HEADER_SIZE && u16::from_le_bytes([buf[0], buf[1]]) == MAGIC
    }

    /// Whether the type code is an opaque game packet.
    pub fn is_game_packet(&self) -> bool {
        self.packet_type >= GAME_PACKET_BASE
    }
}

/// A fully decoded packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: Header,
    pub payload: Payload,
}

impl Packet {
    /// Build a packet, deriving the header type code from the payload.
    pub fn new(payload: Payload, sequence: u16, sender_id: u8, destination_id: u8) -> Self {
        Self {
            header: Header::new(payload.type_code(), sequence, sender_id, destination_id),
            payload,
        }
    }

    /// Decode header and payload. This is the single entry point used by
    /// every receive path.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let header = Header::decode(buf)?;
        let payload = Payload::decode(header.packet_type, &buf[HEADER_SIZE..])?;
        Ok(Self { header, payload })
    }

    /// Encode header and payload into a fresh buffer.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let body = self.payload.encode()?;
        let mut out = vec![0u8; HEADER_SIZE + body.len()];
        self.header.encode(&mut out)?;
        out[HEADER_SIZE..].copy_from_slice(&body);
        Ok(out)
    }
}

/// Wrapping sequence allocator shared by every sending component.
#[derive(Debug, Default)]
pub struct SequenceCounter {
    next: u16,
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand out the current value and advance, wrapping at u16::MAX.
    pub fn next(&mut self) -> u16 {
        let seq = self.next;
        self.next = self.next.wrapping_add(1);
        seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let header = Header::new(PacketType::Ping as u8, 42, 2, HOST_ID);
        let mut buf = [0u8; HEADER_SIZE];
        header.encode(&mut buf).unwrap();

        let decoded = Header::decode(&buf).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(&buf[0..2], &[0x45, 0x4E]);
    }

    #[test]
    fn header_rejects_short_input() {
        let err = Header::decode(&[0x45, 0x4E, 1]).unwrap_err();
        assert_eq!(err, WireError::TooShort(3, HEADER_SIZE));
    }

    #[test]
    fn header_rejects_bad_magic() {
        let mut buf = [0u8; HEADER_SIZE];
        Header::new(0x01, 0, 0, 1).encode(&mut buf).unwrap();
        buf[0] = 0xFF;
        assert!(matches!(
            Header::decode(&buf),
            Err(WireError::InvalidMagic(_, MAGIC))
        ));
    }

    #[test]
    fn version_byte_is_not_enforced_by_codec() {
        let mut buf = [0u8; HEADER_SIZE];
        Header::new(0x0B, 7, 2, 1).encode(&mut buf).unwrap();
        buf[2] = 99;
        let decoded = Header::decode(&buf).unwrap();
        assert_eq!(decoded.version, 99);
    }

    #[test]
    fn quick_check_gates_on_length_and_magic() {
        let mut buf = [0u8; HEADER_SIZE];
        Header::new(0x10, 0, 2, 0).encode(&mut buf).unwrap();
        assert!(Header::quick_check(&buf));
        assert!(!Header::quick_check(&buf[..7]));
        assert!(!Header::quick_check(&[0u8; HEADER_SIZE]));
    }

    #[test]
    fn sequence_counter_wraps() {
        let mut counter = SequenceCounter { next: u16::MAX };
        assert_eq!(counter.next(), u16::MAX);
        assert_eq!(counter.next(), 0);
    }
}
