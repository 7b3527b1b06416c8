//! Row-aware match finder.
//!
//! The hash table maps a hash of three consecutive bytes to the most recent
//! position they were seen at. It is never cleared between tiles: every
//! compression bumps `generation`, and a slot only counts when its stored
//! generation is the current one. One `MatchFinder` lives in each worker's
//! scratch, so the table is reused across every tile that worker encodes.

use super::token::{self, MAX_MATCH, MIN_MATCH, Token};
use crate::draw::types::{BYTES_PER_PIXEL, TILE_BYTES};

const HASH_BITS: u32 = 12;
const HASH_SIZE: usize = 1 << HASH_BITS;

/// Hash candidates further back than this are ignored.
const MATCH_WINDOW: usize = 256;

/// Narrowest row (in bytes) the closed-form solid encoding can describe:
/// each of its two row pieces must be a legal match of at least 3 bytes.
const SOLID_MIN_ROW: usize = 3 * BYTES_PER_PIXEL;

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    pos: u16,
    generation: u32,
}

/// Per-worker compression state.
pub struct MatchFinder {
    table: Box<[Slot]>,
    generation: u32,
    /// Tightly packed copy of the tile being encoded.
    pub(crate) packed: Vec<u8>,
    /// Alpha-delta mask of the tile being encoded.
    pub(crate) masked: Vec<u8>,
}

impl MatchFinder {
    pub fn new() -> Self {
        Self {
            table: vec![Slot::default(); HASH_SIZE].into_boxed_slice(),
            generation: 0,
            packed: Vec::with_capacity(TILE_BYTES),
            masked: Vec::with_capacity(TILE_BYTES),
        }
    }

    /// Current generation (advances once per compression).
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Compress `src`, laid out as rows of `row_bytes`, appending the token
    /// stream to `out`.
    ///
    /// Returns `false` (with `out` in an unspecified state) as soon as the
    /// stream is certain to exceed `limit` bytes.
    pub fn compress(&mut self, src: &[u8], row_bytes: usize, limit: usize, out: &mut Vec<u8>) -> bool {
        out.clear();
        if src.is_empty() {
            return true;
        }
        if row_bytes >= SOLID_MIN_ROW && is_solid(src) {
            write_solid(src, row_bytes, out);
        } else {
            self.advance_generation();
            if !self.compress_generic(src, row_bytes, limit, out) {
                return false;
            }
        }
        out.len() <= limit
    }

    // ── Internal ─────────────────────────────────────────────────

    fn advance_generation(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        if self.generation == 0 {
            // Wrapped: stale slots could alias the new generation.
            self.table.fill(Slot::default());
            self.generation = 1;
        }
    }

    fn insert(&mut self, src: &[u8], pos: usize) -> Option<usize> {
        let h = hash3(&src[pos..pos + MIN_MATCH]);
        let slot = self.table[h];
        self.table[h] = Slot {
            pos: pos as u16,
            generation: self.generation,
        };
        (slot.generation == self.generation).then_some(slot.pos as usize)
    }

    fn compress_generic(&mut self, src: &[u8], row_bytes: usize, limit: usize, out: &mut Vec<u8>) -> bool {
        let n = src.len();
        let mut pos = 0;
        let mut lit = 0;

        while pos < n {
            // Pending literals cost at least their own length.
            if out.len() + (pos - lit) > limit {
                return false;
            }

            let mut best_len = 0;
            let mut best_off = 0;

            if pos + MIN_MATCH <= n {
                if let Some(cand) = self.insert(src, pos) {
                    let off = pos - cand;
                    if off > 0 && off <= MATCH_WINDOW {
                        best_len = match_len(src, cand, pos);
                        best_off = off;
                    }
                }
            }

            // Same column, previous row.
            if pos >= row_bytes {
                let len = match_len(src, pos - row_bytes, pos);
                if len > best_len {
                    best_len = len;
                    best_off = row_bytes;
                }
            }

            if best_len < MIN_MATCH {
                pos += 1;
                continue;
            }

            token::write_literals(&src[lit..pos], out);
            Token::Match {
                length: best_len,
                offset: best_off,
            }
            .write(out);

            let end = (pos + best_len).min(n.saturating_sub(MIN_MATCH - 1));
            for p in pos + 1..end {
                self.insert(src, p);
            }
            pos += best_len;
            lit = pos;
        }

        token::write_literals(&src[lit..], out);
        true
    }
}

impl Default for MatchFinder {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether every pixel equals the first one.
pub fn is_solid(src: &[u8]) -> bool {
    let mut words = src.chunks_exact(BYTES_PER_PIXEL).map(|p| u32::from_ne_bytes([p[0], p[1], p[2], p[3]]));
    match words.next() {
        Some(first) => words.all(|w| w == first),
        None => true,
    }
}

/// Closed-form encoding of a single-colour tile: the pixel as a literal,
/// two references replicating it across the first row, then two references
/// per row copying the row above. Always `5 + 4 * rows` bytes.
fn write_solid(src: &[u8], row_bytes: usize, out: &mut Vec<u8>) {
    let rows = src.len() / row_bytes;

    Token::Literal(&src[..BYTES_PER_PIXEL]).write(out);
    let rest = row_bytes - BYTES_PER_PIXEL;
    let half = rest / 2;
    write_match(half, BYTES_PER_PIXEL, out);
    write_match(rest - half, BYTES_PER_PIXEL, out);

    let half = row_bytes / 2;
    for _ in 1..rows {
        write_match(half, row_bytes, out);
        write_match(row_bytes - half, row_bytes, out);
    }
}

fn write_match(length: usize, offset: usize, out: &mut Vec<u8>) {
    Token::Match { length, offset }.write(out);
}

fn hash3(b: &[u8]) -> usize {
    let v = b[0] as u32 | (b[1] as u32) << 8 | (b[2] as u32) << 16;
    (v.wrapping_mul(0x9E37_79B1) >> (32 - HASH_BITS)) as usize
}

/// Length of the match between `src[cand..]` and `src[pos..]`, capped at
/// [`MAX_MATCH`]. The two ranges may overlap.
fn match_len(src: &[u8], cand: usize, pos: usize) -> usize {
    let max = (src.len() - pos).min(MAX_MATCH);
    let mut n = 0;
    while n < max && src[cand + n] == src[pos + n] {
        n += 1;
    }
    n
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::draw::codec::decode::decode;

    fn compress(src: &[u8], row_bytes: usize) -> Option<Vec<u8>> {
        let mut mf = MatchFinder::new();
        let mut out = Vec::new();
        mf.compress(src, row_bytes, usize::MAX, &mut out).then_some(out)
    }

    #[test]
    fn solid_stream_has_closed_form_size() {
        for w in 3..=16usize {
            for h in 1..=16usize {
                let src = [0x11, 0x22, 0x33, 0x00].repeat(w * h);
                let out = compress(&src, w * 4).unwrap();
                assert_eq!(out.len(), 5 + 4 * h, "w={w} h={h}");
                assert_eq!(decode(&out, src.len()).unwrap(), src);
            }
        }
    }

    #[test]
    fn narrow_solid_tiles_take_the_generic_path() {
        let src = [9u8, 9, 9, 9].repeat(16);
        let out = compress(&src, 4).unwrap();
        assert_eq!(decode(&out, src.len()).unwrap(), src);
    }

    #[test]
    fn repeated_rows_become_row_references() {
        let row: Vec<u8> = (0..64u8).collect();
        let src = row.repeat(4);
        let out = compress(&src, 64).unwrap();
        // First row as literals, the rest as maximal back-references.
        assert_eq!(out.len(), 65 + 3 * 2 * MATCH_TOKEN);
        assert_eq!(decode(&out, src.len()).unwrap(), src);
    }

    const MATCH_TOKEN: usize = token::MATCH_LEN;

    #[test]
    fn long_runs_split_into_legal_matches() {
        let mut src = vec![0x5Au8; 200];
        src.extend(0..56u8);
        let out = compress(&src, src.len()).unwrap();
        let toks: Vec<Token<'_>> = token::tokens(&out).map(|t| t.unwrap()).collect();
        assert!(toks.iter().all(|t| match *t {
            Token::Match { length, .. } => (MIN_MATCH..=MAX_MATCH).contains(&length),
            Token::Literal(_) => true,
        }));
        assert!(toks.iter().filter(|t| matches!(t, Token::Match { .. })).count() >= 200 / MAX_MATCH);
        assert_eq!(decode(&out, src.len()).unwrap(), src);
    }

    #[test]
    fn limit_aborts_incompressible_input() {
        let mut state = 0x1234_5678u32;
        let src: Vec<u8> = (0..1024)
            .map(|_| {
                state = state.wrapping_mul(1_103_515_245).wrapping_add(12345);
                (state >> 16) as u8
            })
            .collect();
        let mut mf = MatchFinder::new();
        let mut out = Vec::new();
        assert!(!mf.compress(&src, 64, 768, &mut out));
    }

    #[test]
    fn generation_advances_without_clearing() {
        let mut mf = MatchFinder::new();
        let mut out = Vec::new();
        let src: Vec<u8> = (0..=255u8).cycle().take(512).collect();
        mf.compress(&src, 64, usize::MAX, &mut out);
        let first = out.clone();
        let g = mf.generation();
        mf.compress(&src, 64, usize::MAX, &mut out);
        assert_eq!(mf.generation(), g + 1);
        assert_eq!(out, first);
    }

    #[test]
    fn generation_wrap_resets_table() {
        let mut mf = MatchFinder::new();
        mf.generation = u32::MAX;
        mf.advance_generation();
        assert_eq!(mf.generation(), 1);
    }
}
