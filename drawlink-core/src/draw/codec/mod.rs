//! Tile compressor.
//!
//! Encodes one tile (at most [`TILE_SIZE`] pixels on each edge), optionally
//! against the tile last sent for the same position:
//!
//! - **Solid**: a single-colour tile has a closed-form encoding.
//! - **Direct**: row-aware LZ77-style matching over the raw pixels.
//! - **Alpha-delta**: only the changed pixels, marked opaque, over a
//!   transparent background. The remote composites it over what it already
//!   shows, which costs one extra draw command.
//!
//! An encoding is only returned when it saves at least a quarter of the raw
//! size; otherwise the caller sends the tile raw.

pub mod decode;
pub mod matcher;
pub mod token;

pub use decode::{composite_delta, decode, decode_prefix};
pub use matcher::MatchFinder;
pub use token::Token;

use crate::draw::command::{DRAW_LEN, LOAD_HEADER_LEN};
use crate::draw::types::{BYTES_PER_PIXEL, TILE_SIZE, TileView};
use crate::error::DrawError;

/// Alpha marker for a changed pixel in a delta payload.
pub const OPAQUE: u8 = 0xFF;

/// Extra wire cost of the delta path: the draw command that composites the
/// delta image over the back buffer.
pub const DELTA_OVERHEAD: usize = DRAW_LEN;

// ── CompressedTile ───────────────────────────────────────────────

/// A compressed tile payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedTile {
    /// Token stream.
    pub bytes: Vec<u8>,
    /// `true` when the stream is an alpha-delta to be composited, `false`
    /// when it overwrites the tile directly.
    pub is_delta: bool,
}

/// Largest compressed size accepted for a tile of `raw` bytes.
pub const fn size_limit(raw: usize) -> usize {
    raw * 3 / 4
}

/// Encode `tile`, optionally as a delta against `previous`.
///
/// Returns `Ok(None)` when no encoding beats the raw tile by at least 25 %.
/// The result depends only on the pixels: the match finder's table is
/// scoped to one call by its generation counter.
pub fn encode(
    finder: &mut MatchFinder,
    tile: &TileView<'_>,
    previous: Option<&TileView<'_>>,
) -> Result<Option<CompressedTile>, DrawError> {
    if tile.width > TILE_SIZE || tile.height > TILE_SIZE {
        return Err(DrawError::TileTooLarge {
            width: tile.width,
            height: tile.height,
            max: TILE_SIZE,
        });
    }
    let raw = tile.byte_len();
    if raw == 0 {
        return Ok(None);
    }
    let limit = size_limit(raw);
    let row_bytes = tile.row_bytes();

    let mut packed = std::mem::take(&mut finder.packed);
    tile.pack_into(&mut packed);
    let mut direct = Vec::new();
    let direct_ok = finder.compress(&packed, row_bytes, limit, &mut direct);
    finder.packed = packed;

    let delta = match previous {
        Some(prev) => encode_delta(finder, tile, prev, limit)?,
        None => None,
    };

    let direct_cost = if direct_ok { direct.len() } else { raw };
    Ok(match delta {
        Some(bytes) if bytes.len() + DELTA_OVERHEAD < direct_cost => Some(CompressedTile {
            bytes,
            is_delta: true,
        }),
        _ if direct_ok => Some(CompressedTile {
            bytes: direct,
            is_delta: false,
        }),
        _ => None,
    })
}

/// Build the alpha-delta mask of `tile` against `previous` into `out`.
///
/// The unused byte is ignored when comparing. Returns the changed-pixel
/// count, or `None` when delta encoding is not worth attempting: nothing
/// changed, or more than three quarters of the pixels did.
pub fn alpha_mask(tile: &TileView<'_>, previous: &TileView<'_>, out: &mut Vec<u8>) -> Option<usize> {
    if tile.width != previous.width || tile.height != previous.height {
        return None;
    }
    out.clear();
    let mut changed = 0;
    for (cur, prev) in tile.rows().zip(previous.rows()) {
        for (c, p) in cur
            .chunks_exact(BYTES_PER_PIXEL)
            .zip(prev.chunks_exact(BYTES_PER_PIXEL))
        {
            if c[..3] != p[..3] {
                out.extend_from_slice(&[c[0], c[1], c[2], OPAQUE]);
                changed += 1;
            } else {
                out.extend_from_slice(&[0; BYTES_PER_PIXEL]);
            }
        }
    }
    let total = tile.width as usize * tile.height as usize;
    (changed > 0 && changed * 4 <= total * 3).then_some(changed)
}

fn encode_delta(
    finder: &mut MatchFinder,
    tile: &TileView<'_>,
    previous: &TileView<'_>,
    limit: usize,
) -> Result<Option<Vec<u8>>, DrawError> {
    if previous.width > TILE_SIZE || previous.height > TILE_SIZE {
        return Err(DrawError::TileTooLarge {
            width: previous.width,
            height: previous.height,
            max: TILE_SIZE,
        });
    }
    let mut masked = std::mem::take(&mut finder.masked);
    let mut out = Vec::new();
    let ok = alpha_mask(tile, previous, &mut masked).is_some()
        && finder.compress(&masked, tile.row_bytes(), limit, &mut out);
    finder.masked = masked;
    Ok(ok.then_some(out))
}

/// Wire bytes needed to bring the remote tile from `reference` to `tile`.
///
/// Zero when the pixels already match; otherwise one load command with the
/// cheapest payload, plus the composite draw when the delta path wins. A
/// `reference` of `None` means the remote content is unknown.
pub fn transmission_cost(
    finder: &mut MatchFinder,
    tile: &TileView<'_>,
    reference: Option<&TileView<'_>>,
    allow_delta: bool,
) -> usize {
    if reference.is_some_and(|r| tile.same_pixels(r)) {
        return 0;
    }
    let base = if allow_delta { reference } else { None };
    match encode(finder, tile, base) {
        Ok(Some(c)) if c.is_delta => LOAD_HEADER_LEN + c.bytes.len() + DELTA_OVERHEAD,
        Ok(Some(c)) => LOAD_HEADER_LEN + c.bytes.len(),
        _ => LOAD_HEADER_LEN + tile.byte_len(),
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::draw::types::{Frame, Rect};

    fn noise(seed: u32, len: usize) -> Vec<u8> {
        let mut state = seed;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                (state >> 24) as u8
            })
            .collect()
    }

    fn tile_frame(w: u32, h: u32, data: Vec<u8>) -> Frame {
        Frame::from_raw(w, h, w * 4, data).unwrap()
    }

    fn full(f: &Frame) -> TileView<'_> {
        f.view(Rect::new(0, 0, f.width, f.height))
    }

    #[test]
    fn uniform_tiles_encode_to_five_plus_four_per_row() {
        let mut mf = MatchFinder::new();
        for &px in &[0u32, 0x00FF_FFFF, 0x0012_3456] {
            for w in 3..=16 {
                for h in 2..=16 {
                    let mut f = Frame::new(w, h);
                    f.fill_rect(Rect::new(0, 0, w, h), px);
                    let c = encode(&mut mf, &full(&f), None).unwrap();
                    match c {
                        Some(c) => {
                            assert!(!c.is_delta);
                            assert_eq!(c.bytes.len(), 5 + 4 * h as usize, "w={w} h={h}");
                        }
                        // Only tiles too small for the closed form to pay off.
                        None => assert!(5 + 4 * h as usize > size_limit((w * h * 4) as usize)),
                    }
                }
            }
        }
    }

    #[test]
    fn random_content_is_left_raw() {
        let mut mf = MatchFinder::new();
        let f = tile_frame(16, 16, noise(7, 1024));
        assert_eq!(encode(&mut mf, &full(&f), None).unwrap(), None);
    }

    #[test]
    fn results_never_exceed_three_quarters_of_raw() {
        let mut mf = MatchFinder::new();
        for seed in 0..64u32 {
            // Mix of noise and flat runs so some tiles compress and some don't.
            let mut data = noise(seed, 1024);
            let flat = (seed as usize * 13) % 1024;
            data[..flat].fill(0x40);
            let f = tile_frame(16, 16, data);
            let prev = tile_frame(16, 16, noise(seed + 1000, 1024));
            if let Some(c) = encode(&mut mf, &full(&f), Some(&full(&prev))).unwrap() {
                assert!(c.bytes.len() <= 768);
            }
        }
    }

    #[test]
    fn decoded_output_matches_input() {
        let mut mf = MatchFinder::new();
        for seed in 0..32u32 {
            let mut data = noise(seed, 1024);
            // Repeat a row band so there is something to match.
            let band = data[..256].to_vec();
            data[512..768].copy_from_slice(&band);
            data[768..1024].copy_from_slice(&band);
            let f = tile_frame(16, 16, data.clone());
            let mut out = Vec::new();
            assert!(mf.compress(&data, 64, usize::MAX, &mut out));
            assert_eq!(decode(&out, 1024).unwrap(), data);
            if let Some(c) = encode(&mut mf, &full(&f), None).unwrap() {
                assert_eq!(decode(&c.bytes, 1024).unwrap(), data);
            }
        }
    }

    #[test]
    fn unchanged_tile_is_never_delta() {
        let mut mf = MatchFinder::new();
        let f = tile_frame(16, 16, noise(3, 1024));
        let mut mask = Vec::new();
        assert_eq!(alpha_mask(&full(&f), &full(&f), &mut mask), None);
        let c = encode(&mut mf, &full(&f), Some(&full(&f))).unwrap();
        assert!(c.is_none_or(|c| !c.is_delta));
    }

    #[test]
    fn mostly_changed_tile_is_never_delta() {
        let mut mf = MatchFinder::new();
        let prev = Frame::new(16, 16);
        let mut cur = Frame::new(16, 16);
        // 193 of 256 pixels changed: just over three quarters.
        for i in 0..193u32 {
            cur.set_pixel(i % 16, i / 16, 0x0000_00FF);
        }
        let mut mask = Vec::new();
        assert_eq!(alpha_mask(&full(&cur), &full(&prev), &mut mask), None);
        let c = encode(&mut mf, &full(&cur), Some(&full(&prev))).unwrap();
        assert!(c.is_none_or(|c| !c.is_delta));
    }

    #[test]
    fn sparse_change_over_busy_tile_prefers_delta() {
        let mut mf = MatchFinder::new();
        let prev = tile_frame(16, 16, noise(11, 1024));
        let mut cur = prev.clone();
        for x in [5, 6] {
            // Keep the unused byte: the composite never touches it.
            let keep = prev.pixel(x, 5) & 0xFF00_0000;
            cur.set_pixel(x, 5, keep | 0x00FF_0000);
        }
        let c = encode(&mut mf, &full(&cur), Some(&full(&prev)))
            .unwrap()
            .expect("delta should pay off");
        assert!(c.is_delta);

        let expanded = decode(&c.bytes, 1024).unwrap();
        let mut base = prev.data.clone();
        composite_delta(&mut base, &expanded).unwrap();
        assert_eq!(base, cur.data);
    }

    #[test]
    fn unused_byte_changes_are_ignored_by_delta() {
        let prev = Frame::new(4, 4);
        let mut cur = Frame::new(4, 4);
        cur.set_pixel(0, 0, 0xFF00_0000);
        let mut mask = Vec::new();
        assert_eq!(alpha_mask(&full(&cur), &full(&prev), &mut mask), None);
    }

    #[test]
    fn encoding_is_idempotent() {
        let mut mf = MatchFinder::new();
        let prev = tile_frame(16, 16, noise(21, 1024));
        let mut cur = prev.clone();
        cur.fill_rect(Rect::new(2, 2, 6, 3), 0x0033_6699);
        let a = encode(&mut mf, &full(&cur), Some(&full(&prev))).unwrap();
        let b = encode(&mut mf, &full(&cur), Some(&full(&prev))).unwrap();
        assert_eq!(a, b);
        let mut fresh = MatchFinder::new();
        assert_eq!(encode(&mut fresh, &full(&cur), Some(&full(&prev))).unwrap(), a);
    }

    #[test]
    fn oversized_tiles_are_a_caller_error() {
        let mut mf = MatchFinder::new();
        let f = Frame::new(32, 16);
        assert!(matches!(
            encode(&mut mf, &full(&f), None),
            Err(DrawError::TileTooLarge { .. })
        ));
    }

    #[test]
    fn cost_is_zero_for_identical_reference() {
        let mut mf = MatchFinder::new();
        let f = tile_frame(16, 16, noise(5, 1024));
        assert_eq!(transmission_cost(&mut mf, &full(&f), Some(&full(&f)), true), 0);
        assert_eq!(
            transmission_cost(&mut mf, &full(&f), None, true),
            LOAD_HEADER_LEN + 1024
        );
    }
}
