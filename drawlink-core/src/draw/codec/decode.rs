//! Reference decoder for compressed tiles.
//!
//! This is what the remote draw device does with a compressed load: expand
//! the token stream, then either overwrite the target rectangle (direct) or
//! composite the expanded pixels through their alpha byte (delta).

use super::token::Token;
use crate::draw::codec::OPAQUE;
use crate::draw::types::BYTES_PER_PIXEL;
use crate::error::DrawError;

/// Expand a token stream into exactly `expected_len` bytes.
pub fn decode(stream: &[u8], expected_len: usize) -> Result<Vec<u8>, DrawError> {
    let (out, used) = decode_prefix(stream, expected_len)?;
    if used != stream.len() {
        return Err(DrawError::ProtocolViolation("trailing bytes after tile stream"));
    }
    Ok(out)
}

/// Expand tokens from the front of `stream` until `expected_len` bytes
/// have been produced. Returns the pixels and the stream bytes consumed.
///
/// Compressed loads carry no payload length on the wire, so this is how a
/// command parser finds where the next command starts.
pub fn decode_prefix(stream: &[u8], expected_len: usize) -> Result<(Vec<u8>, usize), DrawError> {
    let mut out = Vec::with_capacity(expected_len);
    let mut used = 0;

    while out.len() < expected_len {
        if used == stream.len() {
            return Err(DrawError::ProtocolViolation("stream shorter than tile size"));
        }
        let (tok, len) = Token::read(&stream[used..])?;
        used += len;
        match tok {
            Token::Literal(bytes) => out.extend_from_slice(bytes),
            Token::Match { length, offset } => {
                if offset > out.len() {
                    return Err(DrawError::ProtocolViolation("match reaches before stream start"));
                }
                let start = out.len() - offset;
                // Byte by byte: source and destination may overlap.
                for i in 0..length {
                    let b = out[start + i];
                    out.push(b);
                }
            }
        }
        if out.len() > expected_len {
            return Err(DrawError::ProtocolViolation("stream expands past tile size"));
        }
    }
    Ok((out, used))
}

/// Apply an expanded alpha-delta payload over `base` (both tightly packed).
///
/// Pixels whose alpha byte is opaque replace the base colour; transparent
/// pixels leave the base untouched.
pub fn composite_delta(base: &mut [u8], delta: &[u8]) -> Result<(), DrawError> {
    if base.len() != delta.len() || base.len() % BYTES_PER_PIXEL != 0 {
        return Err(DrawError::ProtocolViolation("delta payload size mismatch"));
    }
    for (dst, src) in base
        .chunks_exact_mut(BYTES_PER_PIXEL)
        .zip(delta.chunks_exact(BYTES_PER_PIXEL))
    {
        if src[3] == OPAQUE {
            dst[..3].copy_from_slice(&src[..3]);
        }
    }
    Ok(())
}
