//! Payload compression for large messages.
//!
//! Decompression is bounded by [`MAX_PAYLOAD_SIZE`] so a hostile peer cannot
//! inflate a small frame into an unbounded allocation.

use std::io::Read;

use serde::{Deserialize, Serialize};

use crate::config::MAX_PAYLOAD_SIZE;
use crate::error::{Fault, Result};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionKind {
    Lz4,
    Zstd,
}

const MAX_DECOMPRESSION_SIZE: usize = MAX_PAYLOAD_SIZE;

const ERR_COMPRESSION: &str = "payload compression failed";
const ERR_DECOMPRESSION: &str = "payload decompression failed";

fn decompression_failure() -> Fault {
    Fault::Protocol(ERR_DECOMPRESSION.to_string())
}

pub fn compress(data: &[u8], kind: CompressionKind) -> Result<Vec<u8>> {
    match kind {
        CompressionKind::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
        CompressionKind::Zstd => {
            let mut out = Vec::new();
            zstd::stream::copy_encode(data, &mut out, 1)
                .map_err(|_| Fault::Protocol(ERR_COMPRESSION.to_string()))?;
            Ok(out)
        }
    }
}

pub fn decompress(data: &[u8], kind: CompressionKind) -> Result<Vec<u8>> {
    match kind {
        CompressionKind::Lz4 => {
            // lz4_flex prepends the decompressed size as u32 LE
            let claimed = data
                .get(0..4)
                .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize)
                .ok_or_else(decompression_failure)?;
            if claimed > MAX_DECOMPRESSION_SIZE {
                return Err(decompression_failure());
            }
            lz4_flex::decompress_size_prepended(data).map_err(|_| decompression_failure())
        }
        CompressionKind::Zstd => {
            let mut reader =
                zstd::stream::Decoder::new(data).map_err(|_| decompression_failure())?;
            let mut out = Vec::new();
            let mut chunk = [0u8; 8192];
            loop {
                match reader.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => {
                        out.extend_from_slice(&chunk[..n]);
                        if out.len() > MAX_DECOMPRESSION_SIZE {
                            return Err(decompression_failure());
                        }
                    }
                    Err(_) => return Err(decompression_failure()),
                }
            }
            Ok(out)
        }
    }
}

/// Compress `data` when it reaches `threshold_bytes` and compression actually
/// shrinks it. Returns the bytes to send and whether they are compressed.
pub fn maybe_compress(
    data: Vec<u8>,
    kind: CompressionKind,
    threshold_bytes: usize,
) -> Result<(Vec<u8>, bool)> {
    if data.len() < threshold_bytes {
        return Ok((data, false));
    }
    let compressed = compress(&data, kind)?;
    if compressed.len() < data.len() {
        Ok((compressed, true))
    } else {
        Ok((data, false))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_both_kinds() {
        let original = b"print('hello from the remote side') ".repeat(20);
        for kind in [CompressionKind::Lz4, CompressionKind::Zstd] {
            let compressed = compress(&original, kind).unwrap();
            assert_eq!(decompress(&compressed, kind).unwrap(), original);
        }
    }

    #[test]
    fn test_lz4_rejects_oversized_claim() {
        let mut hostile = ((MAX_DECOMPRESSION_SIZE + 1) as u32).to_le_bytes().to_vec();
        hostile.extend_from_slice(&[0u8; 16]);
        assert!(decompress(&hostile, CompressionKind::Lz4).is_err());
        assert!(decompress(&[0x2b, 0x60], CompressionKind::Lz4).is_err());
    }

    #[test]
    fn test_threshold_and_benefit() {
        let (out, compressed) = maybe_compress(b"tiny".to_vec(), CompressionKind::Lz4, 512).unwrap();
        assert!(!compressed);
        assert_eq!(out, b"tiny");

        let (out, compressed) = maybe_compress(vec![1u8; 4096], CompressionKind::Lz4, 512).unwrap();
        assert!(compressed);
        assert!(out.len() < 4096);
    }
}
