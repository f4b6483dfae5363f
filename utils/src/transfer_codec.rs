//! Chunked base64 codec for moving binary payloads through text-only
//! sandbox calls.
//!
//! Both directions walk the input in fixed-size slices and append to a
//! single output buffer, so no individual encode/decode call ever scales
//! with the total payload size.

use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD, Engine};

/// Raw bytes encoded per step. A multiple of 3, so every slice except the
/// last encodes without padding and the pieces concatenate cleanly.
pub const ENCODE_CHUNK_BYTES: usize = 24 * 1024;

/// Encoded characters decoded per step (32 KiB). A multiple of 4, so every
/// slice is a complete run of base64 quanta.
pub const DECODE_CHUNK_CHARS: usize = ENCODE_CHUNK_BYTES / 3 * 4;

/// Encode arbitrary bytes to standard padded base64.
pub fn encode_chunked(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len().div_ceil(3) * 4);
    for chunk in bytes.chunks(ENCODE_CHUNK_BYTES) {
        STANDARD.encode_string(chunk, &mut out);
    }
    out
}

/// Decode standard padded base64 produced by [`encode_chunked`] or by the
/// `base64` coreutil. ASCII whitespace (line wrapping, trailing newline) is
/// ignored.
pub fn decode_chunked(encoded: &str) -> Result<Vec<u8>> {
    let cleaned;
    let input = if encoded.bytes().any(|b| b.is_ascii_whitespace()) {
        cleaned = encoded
            .bytes()
            .filter(|b| !b.is_ascii_whitespace())
            .collect::<Vec<u8>>();
        cleaned.as_slice()
    } else {
        encoded.as_bytes()
    };

    if input.len() % 4 != 0 {
        return Err(anyhow!(
            "invalid base64 payload: length {} is not a multiple of 4",
            input.len()
        ));
    }

    let mut out = Vec::with_capacity(input.len() / 4 * 3);
    for (index, chunk) in input.chunks(DECODE_CHUNK_CHARS).enumerate() {
        STANDARD
            .decode_vec(chunk, &mut out)
            .map_err(|e| anyhow!("invalid base64 payload in chunk {}: {}", index, e))?;
    }
    Ok(out)
}
