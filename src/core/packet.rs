//! Binary packet format.
//!
//! ```text
//! [Magic(4)] [Version(1)] [Flags(1)] [Length(4, BE)] [Payload(N)]
//! ```

use crate::config::{MAGIC_BYTES, MAX_PAYLOAD_SIZE, PROTOCOL_VERSION};
use crate::error::{Fault, Result};
use crate::error::constants::ERR_INVALID_HEADER;

/// Size of the fixed packet header in bytes.
pub const HEADER_SIZE: usize = 10;

/// Payload is compressed with the connection's compression kind.
pub const FLAG_COMPRESSED: u8 = 0x01;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub version: u8,
    pub flags: u8,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            flags: 0,
            payload,
        }
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        self.write_header(&mut out);
        out.extend_from_slice(&self.payload);
        out
    }

    pub(crate) fn write_header(&self, out: &mut impl Extend<u8>) {
        out.extend(MAGIC_BYTES);
        out.extend([self.version, self.flags]);
        out.extend((self.payload.len() as u32).to_be_bytes());
    }

    /// Parse one complete packet from the front of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let length = Self::peek_length(bytes)?.ok_or_else(invalid_header)?;
        let payload = bytes
            .get(HEADER_SIZE..HEADER_SIZE + length)
            .ok_or_else(invalid_header)?;
        Ok(Self {
            version: bytes[4],
            flags: bytes[5],
            payload: payload.to_vec(),
        })
    }

    /// Validate the header at the front of `bytes` and return the payload
    /// length, or `None` if the header is not complete yet.
    pub fn peek_length(bytes: &[u8]) -> Result<Option<usize>> {
        if bytes.len() < HEADER_SIZE {
            return Ok(None);
        }
        if bytes[0..4] != MAGIC_BYTES {
            return Err(invalid_header());
        }
        if bytes[4] != PROTOCOL_VERSION {
            return Err(Fault::Protocol(format!(
                "Unsupported protocol version: {}",
                bytes[4]
            )));
        }
        let length = u32::from_be_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]) as usize;
        if length > MAX_PAYLOAD_SIZE {
            return Err(Fault::Protocol(format!("Packet too large: {length} bytes")));
        }
        Ok(Some(length))
    }
}

fn invalid_header() -> Fault {
    Fault::Protocol(ERR_INVALID_HEADER.to_string())
}
