//! Typed core payloads and their strict decoding rules.
//!
//! Every multi-byte field is little-endian. Declared lengths are validated
//! against their maxima before any allocation, strings are decoded as UTF-8
//! with control characters stripped, and a payload that leaves trailing
//! bytes is malformed.

use bytes::Bytes;

use crate::{
    PacketType, WireError, GAME_PACKET_BASE, MAX_DESCRIPTION_LEN, MAX_LIST_COUNT, MAX_NAME_LEN,
    MAX_PAYLOAD_SIZE,
};

/// Reconnect tokens are 128-bit random values.
pub const RECONNECT_TOKEN_LEN: usize = 16;

/// One advertised application packet type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    pub id: u8,
    pub name: String,
    pub description: String,
}

/// Decoded payload of a NEXUS packet.
///
/// Core types carry structured data; anything with a type code >= 0x10 is
/// an opaque [`Payload::Game`] blob the protocol never inspects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    ConnectRequest {
        client_version: u8,
        player_name: String,
        target_session_id: u32,
        game_id: u32,
    },
    ConnectAccept {
        client_id: u8,
        session_id: u32,
    },
    ConnectDeny {
        reason: String,
    },
    SessionConfig {
        version: u8,
        tick_rate: u16,
        max_packet_size: u16,
    },
    PacketTypeRegistry {
        entries: Vec<RegistryEntry>,
    },
    Ping {
        timestamp: u64,
    },
    Pong {
        original_timestamp: u64,
    },
    DisconnectNotice,
    Ack {
        sequences: Vec<u16>,
    },
    ReconnectRequest {
        previous_client_id: u8,
        token: [u8; RECONNECT_TOKEN_LEN],
    },
    Game {
        packet_type: u8,
        data: Bytes,
    },
}

impl Payload {
    /// The wire type code this payload encodes under.
    pub fn type_code(&self) -> u8 {
        match self {
            Payload::ConnectRequest { .. } => PacketType::ConnectRequest as u8,
            Payload::ConnectAccept { .. } => PacketType::ConnectAccept as u8,
            Payload::ConnectDeny { .. } => PacketType::ConnectDeny as u8,
            Payload::SessionConfig { .. } => PacketType::SessionConfig as u8,
            Payload::PacketTypeRegistry { .. } => PacketType::PacketTypeRegistry as u8,
            Payload::Ping { .. } => PacketType::Ping as u8,
            Payload::Pong { .. } => PacketType::Pong as u8,
            Payload::DisconnectNotice => PacketType::DisconnectNotice as u8,
            Payload::Ack { .. } => PacketType::Ack as u8,
            Payload::ReconnectRequest { .. } => PacketType::ReconnectRequest as u8,
            Payload::Game { packet_type, .. } => *packet_type,
        }
    }

    /// Encode the payload body (header excluded).
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut out = Vec::new();
        match self {
            Payload::ConnectRequest {
                client_version,
                player_name,
                target_session_id,
                game_id,
            } => {
                check_name(player_name)?;
                if *target_session_id == 0 {
                    return Err(WireError::InvalidSessionId);
                }
                out.push(*client_version);
                put_string_u32(&mut out, player_name);
                out.extend_from_slice(&target_session_id.to_le_bytes());
                out.extend_from_slice(&game_id.to_le_bytes());
            }
            Payload::ConnectAccept {
                client_id,
                session_id,
            } => {
                if *session_id == 0 {
                    return Err(WireError::InvalidSessionId);
                }
                out.push(*client_id);
                out.extend_from_slice(&session_id.to_le_bytes());
            }
            Payload::ConnectDeny { reason } => {
                check_len(reason.len(), MAX_DESCRIPTION_LEN)?;
                put_string_u32(&mut out, reason);
            }
            Payload::SessionConfig {
                version,
                tick_rate,
                max_packet_size,
            } => {
                out.push(*version);
                out.extend_from_slice(&tick_rate.to_le_bytes());
                out.extend_from_slice(&max_packet_size.to_le_bytes());
            }
            Payload::PacketTypeRegistry { entries } => {
                if entries.len() as u32 > MAX_LIST_COUNT {
                    return Err(WireError::CountOverflow(entries.len() as u32));
                }
                out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
                for entry in entries {
                    check_name(&entry.name)?;
                    check_len(entry.description.len(), MAX_DESCRIPTION_LEN)?;
                    out.push(entry.id);
                    out.push(entry.name.len() as u8);
                    out.extend_from_slice(entry.name.as_bytes());
                    out.push(entry.description.len() as u8);
                    out.extend_from_slice(entry.description.as_bytes());
                }
            }
            Payload::Ping { timestamp } => out.extend_from_slice(&timestamp.to_le_bytes()),
            Payload::Pong { original_timestamp } => {
                out.extend_from_slice(&original_timestamp.to_le_bytes())
            }
            Payload::DisconnectNotice => {}
            Payload::Ack { sequences } => {
                if sequences.len() as u32 > MAX_LIST_COUNT {
                    return Err(WireError::CountOverflow(sequences.len() as u32));
                }
                out.extend_from_slice(&(sequences.len() as u32).to_le_bytes());
                for seq in sequences {
                    out.extend_from_slice(&seq.to_le_bytes());
                }
            }
            Payload::ReconnectRequest {
                previous_client_id,
                token,
            } => {
                out.push(*previous_client_id);
                out.extend_from_slice(token);
            }
            Payload::Game { data, .. } => out.extend_from_slice(data),
        }

        if out.len() > MAX_PAYLOAD_SIZE {
            return Err(WireError::PayloadTooLarge(out.len()));
        }
        Ok(out)
    }

    /// Decode a payload body for the given header type code.
    pub fn decode(type_code: u8, data: &[u8]) -> Result<Self, WireError> {
        if data.len() > MAX_PAYLOAD_SIZE {
            return Err(WireError::PayloadTooLarge(data.len()));
        }

        if type_code >= GAME_PACKET_BASE {
            return Ok(Payload::Game {
                packet_type: type_code,
                data: Bytes::copy_from_slice(data),
            });
        }

        let mut r = Reader::new(data);
        let payload = match PacketType::try_from(type_code)? {
            PacketType::ConnectRequest => {
                let client_version = r.u8()?;
                let player_name = r.string_u32(MAX_NAME_LEN)?;
                let player_name = sanitize_name(&player_name)?;
                let target_session_id = r.u32()?;
                if target_session_id == 0 {
                    return Err(WireError::InvalidSessionId);
                }
                let game_id = r.u32()?;
                Payload::ConnectRequest {
                    client_version,
                    player_name,
                    target_session_id,
                    game_id,
                }
            }
            PacketType::ConnectAccept => {
                let client_id = r.u8()?;
                let session_id = r.u32()?;
                if session_id == 0 {
                    return Err(WireError::InvalidSessionId);
                }
                Payload::ConnectAccept {
                    client_id,
                    session_id,
                }
            }
            PacketType::ConnectDeny => {
                let reason = r.string_u32(MAX_DESCRIPTION_LEN)?;
                Payload::ConnectDeny {
                    reason: strip_control(&reason),
                }
            }
            PacketType::SessionConfig => Payload::SessionConfig {
                version: r.u8()?,
                tick_rate: r.u16()?,
                max_packet_size: r.u16()?,
            },
            PacketType::PacketTypeRegistry => {
                let count = r.u32()?;
                if count > MAX_LIST_COUNT {
                    return Err(WireError::CountOverflow(count));
                }
                let mut entries = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let id = r.u8()?;
                    let name_len = r.u8()? as usize;
                    check_len(name_len, MAX_NAME_LEN)?;
                    let name = sanitize_name(&r.string(name_len)?)?;
                    let desc_len = r.u8()? as usize;
                    check_len(desc_len, MAX_DESCRIPTION_LEN)?;
                    let description = strip_control(&r.string(desc_len)?);
                    entries.push(RegistryEntry {
                        id,
                        name,
                        description,
                    });
                }
                Payload::PacketTypeRegistry { entries }
            }
            PacketType::Ping => Payload::Ping {
                timestamp: r.u64()?,
            },
            PacketType::Pong => Payload::Pong {
                original_timestamp: r.u64()?,
            },
            PacketType::DisconnectNotice => Payload::DisconnectNotice,
            PacketType::Ack => {
                let count = r.u32()?;
                if count > MAX_LIST_COUNT {
                    return Err(WireError::CountOverflow(count));
                }
                let mut sequences = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    sequences.push(r.u16()?);
                }
                Payload::Ack { sequences }
            }
            PacketType::ReconnectRequest => {
                let previous_client_id = r.u8()?;
                let remaining = r.remaining();
                if remaining != RECONNECT_TOKEN_LEN {
                    return Err(WireError::InvalidTokenLength(remaining));
                }
                let mut token = [0u8; RECONNECT_TOKEN_LEN];
                token.copy_from_slice(r.bytes(RECONNECT_TOKEN_LEN)?);
                Payload::ReconnectRequest {
                    previous_client_id,
                    token,
                }
            }
        };

        r.finish()?;
        Ok(payload)
    }
}

/// Remove Unicode control characters except tab, CR, and LF.
fn strip_control(input: &str) -> String {
    input
        .chars()
        .filter(|c| !c.is_control() || matches!(c, '\t' | '\r' | '\n'))
        .collect()
}

/// Sanitize a name and reject empty results.
fn sanitize_name(input: &str) -> Result<String, WireError> {
    let cleaned = strip_control(input);
    if cleaned.is_empty() {
        return Err(WireError::EmptyName);
    }
    Ok(cleaned)
}

fn check_len(len: usize, max: usize) -> Result<(), WireError> {
    if len > max {
        return Err(WireError::LengthOverflow(len, max));
    }
    Ok(())
}

fn check_name(name: &str) -> Result<(), WireError> {
    check_len(name.len(), MAX_NAME_LEN)?;
    if strip_control(name).is_empty() {
        return Err(WireError::EmptyName);
    }
    Ok(())
}

fn put_string_u32(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

/// Bounds-checked sequential reader over a payload body.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < len {
            return Err(WireError::TooShort(self.data.len(), self.pos + len));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, WireError> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, WireError> {
        let b = self.bytes(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    /// Read a u32 length prefix, validate it against `max` before
    /// allocating, then read that many bytes as UTF-8.
    fn string_u32(&mut self, max: usize) -> Result<String, WireError> {
        let len = self.u32()? as usize;
        check_len(len, max)?;
        self.string(len)
    }

    fn string(&mut self, len: usize) -> Result<String, WireError> {
        let bytes = self.bytes(len)?;
        std::str::from_utf8(bytes)
            .map(|s| s.to_owned())
            .map_err(|_| WireError::InvalidUtf8)
    }

    /// Trailing bytes after a fully decoded payload are malformed.
    fn finish(&self) -> Result<(), WireError> {
        let rest = self.remaining();
        if rest != 0 {
            return Err(WireError::TrailingBytes(rest));
        }
        Ok(())
    }
}
