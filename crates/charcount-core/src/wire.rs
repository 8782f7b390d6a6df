//! Wire codec for GATT characteristic payloads
//!
//! Every payload is a two byte header followed by a bincode body:
//!
//! ```text
//! +---------+------+---------------------------------------+
//! | version | kind | bincode body (varint ints, no trailer) |
//! +---------+------+---------------------------------------+
//! ```
//!
//! Game info travels in a single characteristic read and player info in a
//! single write without response, so a payload never exceeds the configured
//! maximum. Oversized values are rejected, never truncated.

use bincode::Options;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::errors::CodecError;
use crate::game::GameInfo;
use crate::player::PlayerInfo;

/// Current wire format version
pub const WIRE_VERSION: u8 = 1;

/// Largest value an ATT attribute can hold
pub const DEFAULT_MAX_PAYLOAD_LEN: usize = 512;

const HEADER_LEN: usize = 2;

// ----------------------------------------------------------------------------
// Payload Kinds
// ----------------------------------------------------------------------------

/// Discriminates the value carried by a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PayloadKind {
    GameInfo = 0x01,
    PlayerInfo = 0x02,
}

// ----------------------------------------------------------------------------
// Codec
// ----------------------------------------------------------------------------

/// Encodes and decodes game and player payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireCodec {
    max_payload_len: usize,
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD_LEN)
    }
}

impl WireCodec {
    /// Create a codec that refuses payloads longer than `max_payload_len`
    pub fn new(max_payload_len: usize) -> Self {
        Self {
            max_payload_len: max_payload_len.max(HEADER_LEN),
        }
    }

    pub fn max_payload_len(&self) -> usize {
        self.max_payload_len
    }

    pub fn encode_game(&self, game: &GameInfo) -> Result<Vec<u8>, CodecError> {
        self.encode(PayloadKind::GameInfo, game)
    }

    pub fn decode_game(&self, data: &[u8]) -> Result<GameInfo, CodecError> {
        self.decode(PayloadKind::GameInfo, data)
    }

    pub fn encode_player(&self, player: &PlayerInfo) -> Result<Vec<u8>, CodecError> {
        self.encode(PayloadKind::PlayerInfo, player)
    }

    pub fn decode_player(&self, data: &[u8]) -> Result<PlayerInfo, CodecError> {
        self.decode(PayloadKind::PlayerInfo, data)
    }

    fn encode<T: Serialize>(&self, kind: PayloadKind, value: &T) -> Result<Vec<u8>, CodecError> {
        let body = bincode::DefaultOptions::new().serialize(value)?;
        let size = HEADER_LEN + body.len();
        if size > self.max_payload_len {
            return Err(CodecError::PayloadTooLarge {
                size,
                max: self.max_payload_len,
            });
        }

        let mut payload = Vec::with_capacity(size);
        payload.push(WIRE_VERSION);
        payload.push(kind as u8);
        payload.extend_from_slice(&body);
        Ok(payload)
    }

    fn decode<T: DeserializeOwned>(&self, kind: PayloadKind, data: &[u8]) -> Result<T, CodecError> {
        if data.len() < HEADER_LEN {
            return Err(CodecError::Truncated {
                len: data.len(),
                min: HEADER_LEN,
            });
        }
        if data.len() > self.max_payload_len {
            return Err(CodecError::PayloadTooLarge {
                size: data.len(),
                max: self.max_payload_len,
            });
        }
        if data[0] != WIRE_VERSION {
            return Err(CodecError::UnsupportedVersion {
                found: data[0],
                expected: WIRE_VERSION,
            });
        }
        if data[1] != kind as u8 {
            return Err(CodecError::UnexpectedKind {
                found: data[1],
                expected: kind as u8,
            });
        }

        let value = bincode::DefaultOptions::new()
            .with_limit(self.max_payload_len as u64)
            .reject_trailing_bytes()
            .deserialize(&data[HEADER_LEN..])?;
        Ok(value)
    }
}
