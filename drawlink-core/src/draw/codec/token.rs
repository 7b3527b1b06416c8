//! Token grammar of the compressed tile stream.
//!
//! ```text
//! literal run:  1ccccccc  <c+1 raw bytes>          (1..=128 bytes)
//! match:        0llllloo oooooooo                   length l+3, offset o+1
//! ```
//!
//! A match copies `length` bytes starting `offset` bytes back from the
//! current output position. The source may overlap the destination, in
//! which case the copy proceeds byte by byte.

use crate::error::DrawError;

/// Longest literal run a single marker can carry.
pub const MAX_LITERAL: usize = 128;
/// Shortest match worth a token.
pub const MIN_MATCH: usize = 3;
/// Longest match a single token can carry (5-bit field, biased by 3).
pub const MAX_MATCH: usize = MIN_MATCH + 0x1F;
/// Furthest back a match may reach (10-bit field, biased by 1).
pub const MAX_OFFSET: usize = 1 << 10;
/// Encoded size of a match token.
pub const MATCH_LEN: usize = 2;

const LITERAL_MARKER: u8 = 0x80;

/// One element of the compressed stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token<'a> {
    /// Raw bytes copied verbatim.
    Literal(&'a [u8]),
    /// Back-reference into the already decoded output.
    Match { length: usize, offset: usize },
}

impl<'a> Token<'a> {
    /// Bytes this token occupies in the stream.
    pub fn encoded_len(&self) -> usize {
        match self {
            Token::Literal(bytes) => 1 + bytes.len(),
            Token::Match { .. } => MATCH_LEN,
        }
    }

    /// Bytes this token expands to.
    pub fn expanded_len(&self) -> usize {
        match self {
            Token::Literal(bytes) => bytes.len(),
            Token::Match { length, .. } => *length,
        }
    }

    /// Append the token to `out`.
    ///
    /// # Panics
    ///
    /// Panics if the token's fields are outside the encodable range. The
    /// encoder only constructs tokens within range.
    pub fn write(&self, out: &mut Vec<u8>) {
        match *self {
            Token::Literal(bytes) => {
                assert!(
                    (1..=MAX_LITERAL).contains(&bytes.len()),
                    "literal run of {} bytes",
                    bytes.len()
                );
                out.push(LITERAL_MARKER | (bytes.len() - 1) as u8);
                out.extend_from_slice(bytes);
            }
            Token::Match { length, offset } => {
                assert!((MIN_MATCH..=MAX_MATCH).contains(&length), "match length {length}");
                assert!((1..=MAX_OFFSET).contains(&offset), "match offset {offset}");
                let o = offset - 1;
                let head = (((length - MIN_MATCH) << 2) | (o >> 8)) as u8;
                debug_assert_eq!(head & LITERAL_MARKER, 0, "match head {head:#04x} reads as a literal");
                out.push(head);
                out.push((o & 0xFF) as u8);
            }
        }
    }

    /// Parse the token at the start of `input`, returning it together with
    /// the number of stream bytes it consumed.
    pub fn read(input: &'a [u8]) -> Result<(Self, usize), DrawError> {
        let &head = input
            .first()
            .ok_or(DrawError::ProtocolViolation("empty token"))?;
        if head & LITERAL_MARKER != 0 {
            let count = (head & !LITERAL_MARKER) as usize + 1;
            let bytes = input
                .get(1..1 + count)
                .ok_or(DrawError::ProtocolViolation("truncated literal run"))?;
            Ok((Token::Literal(bytes), 1 + count))
        } else {
            let &low = input
                .get(1)
                .ok_or(DrawError::ProtocolViolation("truncated match token"))?;
            let length = (head >> 2) as usize + MIN_MATCH;
            let offset = ((((head & 0x03) as usize) << 8) | low as usize) + 1;
            Ok((Token::Match { length, offset }, MATCH_LEN))
        }
    }
}

/// Iterate the tokens of a stream.
pub fn tokens(mut input: &[u8]) -> impl Iterator<Item = Result<Token<'_>, DrawError>> {
    std::iter::from_fn(move || {
        if input.is_empty() {
            return None;
        }
        match Token::read(input) {
            Ok((tok, used)) => {
                input = &input[used..];
                Some(Ok(tok))
            }
            Err(e) => {
                input = &[];
                Some(Err(e))
            }
        }
    })
}

/// Emit `bytes` as one or more literal runs.
pub fn write_literals(bytes: &[u8], out: &mut Vec<u8>) {
    for run in bytes.chunks(MAX_LITERAL) {
        Token::Literal(run).write(out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn match_bit_layout() {
        let mut out = Vec::new();
        Token::Match {
            length: 34,
            offset: 1024,
        }
        .write(&mut out);
        assert_eq!(out, vec![(31 << 2) | 0x03, 0xFF]);

        out.clear();
        Token::Match {
            length: 3,
            offset: 1,
        }
        .write(&mut out);
        assert_eq!(out, vec![0x00, 0x00]);
    }

    #[test]
    fn longest_match_reads_back_as_a_match() {
        assert_eq!(MAX_MATCH, 34);
        let longest = Token::Match {
            length: MAX_MATCH,
            offset: MAX_OFFSET,
        };
        let mut out = Vec::new();
        longest.write(&mut out);
        assert_eq!(out[0] & LITERAL_MARKER, 0);
        assert_eq!(Token::read(&out).unwrap(), (longest, MATCH_LEN));
    }

    #[test]
    #[should_panic(expected = "match length")]
    fn overlong_match_is_refused() {
        Token::Match {
            length: MAX_MATCH + 1,
            offset: 1,
        }
        .write(&mut Vec::new());
    }

    #[test]
    fn literal_marker_carries_count() {
        let mut out = Vec::new();
        Token::Literal(&[7, 8, 9]).write(&mut out);
        assert_eq!(out, vec![0x82, 7, 8, 9]);
    }

    #[test]
    fn long_literals_split_at_128() {
        let bytes = vec![1u8; 300];
        let mut out = Vec::new();
        write_literals(&bytes, &mut out);
        assert_eq!(out.len(), 303);
        let runs: Vec<usize> = tokens(&out).map(|t| t.unwrap().expanded_len()).collect();
        assert_eq!(runs, vec![128, 128, 44]);
    }

    #[test]
    fn read_parses_what_write_emits() {
        let mut out = Vec::new();
        Token::Match {
            length: 17,
            offset: 300,
        }
        .write(&mut out);
        let (tok, used) = Token::read(&out).unwrap();
        assert_eq!(used, 2);
        assert_eq!(
            tok,
            Token::Match {
                length: 17,
                offset: 300
            }
        );
    }

    #[test]
    fn truncated_streams_are_rejected() {
        assert!(Token::read(&[0x83, 1, 2]).is_err());
        assert!(Token::read(&[0x04]).is_err());
        assert!(Token::read(&[]).is_err());
    }
}
