//! Draw-device command encoders.
//!
//! Every field is fixed width and little-endian. Rectangles travel as
//! `min.x, min.y, max.x, max.y` (`i32` each), points as `x, y`.
//!
//! ```text
//! load raw        'y' id[4] r[16] pixels
//! load compressed 'Y' id[4] r[16] token stream
//! draw            'd' dst[4] src[4] mask[4] r[16] sp[8] mp[8]   (45 bytes)
//! free            'f' id[4]                                     (5 bytes)
//! flush           'v'                                           (1 byte)
//! name lookup     'n' id[4] len[1] name[len]
//! ```

use bytes::BufMut;
use serde::{Deserialize, Serialize};

use crate::draw::codec::CompressedTile;
use crate::draw::types::Rect;
use crate::error::DrawError;

pub const TAG_LOAD_RAW: u8 = b'y';
pub const TAG_LOAD_COMPRESSED: u8 = b'Y';
pub const TAG_DRAW: u8 = b'd';
pub const TAG_FREE: u8 = b'f';
pub const TAG_FLUSH: u8 = b'v';
pub const TAG_NAME: u8 = b'n';

/// Header of either load command.
pub const LOAD_HEADER_LEN: usize = 1 + 4 + 16;
/// Draw command.
pub const DRAW_LEN: usize = 1 + 3 * 4 + 16 + 2 * 8;
/// Free command.
pub const FREE_LEN: usize = 1 + 4;
/// Flush command.
pub const FLUSH_LEN: usize = 1;

/// Longest name a lookup command can carry.
pub const MAX_NAME_LEN: usize = u8::MAX as usize;

// ── ImageIds ─────────────────────────────────────────────────────

/// Remote image ids the engine draws through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageIds {
    /// Frame-sized offscreen image that tiles are loaded into.
    pub back: u32,
    /// Frame-sized alpha image that delta tiles are loaded into.
    pub delta: u32,
    /// Replicated opaque 1×1 image used as a full mask.
    pub opaque: u32,
}

impl Default for ImageIds {
    fn default() -> Self {
        Self {
            back: 1,
            delta: 2,
            opaque: 3,
        }
    }
}

// ── Point ────────────────────────────────────────────────────────

/// A signed point in remote coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const ZERO: Point = Point { x: 0, y: 0 };

    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

// ── Encoders ─────────────────────────────────────────────────────

fn put_rect(out: &mut Vec<u8>, r: Rect, origin: Point) {
    out.put_i32_le(origin.x + r.x as i32);
    out.put_i32_le(origin.y + r.y as i32);
    out.put_i32_le(origin.x + r.x2() as i32);
    out.put_i32_le(origin.y + r.y2() as i32);
}

fn put_point(out: &mut Vec<u8>, p: Point) {
    out.put_i32_le(p.x);
    out.put_i32_le(p.y);
}

/// Raw load of `pixels` (tightly packed) into `rect` of image `id`.
pub fn load_raw(out: &mut Vec<u8>, id: u32, rect: Rect, pixels: &[u8]) {
    out.reserve(LOAD_HEADER_LEN + pixels.len());
    out.put_u8(TAG_LOAD_RAW);
    out.put_u32_le(id);
    put_rect(out, rect, Point::ZERO);
    out.extend_from_slice(pixels);
}

/// Compressed load of a token stream into `rect` of image `id`.
pub fn load_compressed(out: &mut Vec<u8>, id: u32, rect: Rect, stream: &[u8]) {
    out.reserve(LOAD_HEADER_LEN + stream.len());
    out.put_u8(TAG_LOAD_COMPRESSED);
    out.put_u32_le(id);
    put_rect(out, rect, Point::ZERO);
    out.extend_from_slice(stream);
}

/// The parameters of one draw command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Draw {
    pub dst: u32,
    pub src: u32,
    pub mask: u32,
    /// Destination rectangle.
    pub rect: Rect,
    /// Offset added to `rect` on the wire (e.g. the window origin).
    pub origin: Point,
    /// Source point aligned with `rect.min`.
    pub sp: Point,
    /// Mask point aligned with `rect.min`.
    pub mp: Point,
}

impl Draw {
    pub fn write(&self, out: &mut Vec<u8>) {
        out.reserve(DRAW_LEN);
        out.put_u8(TAG_DRAW);
        out.put_u32_le(self.dst);
        out.put_u32_le(self.src);
        out.put_u32_le(self.mask);
        put_rect(out, self.rect, self.origin);
        put_point(out, self.sp);
        put_point(out, self.mp);
    }
}

/// Release image `id` on the remote.
pub fn free(out: &mut Vec<u8>, id: u32) {
    out.put_u8(TAG_FREE);
    out.put_u32_le(id);
}

/// Make everything drawn so far visible.
pub fn flush(out: &mut Vec<u8>) {
    out.put_u8(TAG_FLUSH);
}

/// Bind `id` to the remote's published image called `name`.
pub fn name_lookup(out: &mut Vec<u8>, id: u32, name: &str) -> Result<(), DrawError> {
    let bytes = name.as_bytes();
    if bytes.len() > MAX_NAME_LEN {
        return Err(DrawError::CapacityExceeded {
            what: "image name",
            size: bytes.len(),
            max: MAX_NAME_LEN,
        });
    }
    out.put_u8(TAG_NAME);
    out.put_u32_le(id);
    out.put_u8(bytes.len() as u8);
    out.extend_from_slice(bytes);
    Ok(())
}

// ── Engine-level commands ────────────────────────────────────────

/// Commands that bring one tile of the back image up to date.
///
/// `compressed` is `None` for a raw load, in which case `pixels` must be
/// the tightly packed tile.
pub fn tile_update(out: &mut Vec<u8>, ids: &ImageIds, rect: Rect, compressed: Option<&CompressedTile>, pixels: &[u8]) {
    match compressed {
        None => load_raw(out, ids.back, rect, pixels),
        Some(c) if !c.is_delta => load_compressed(out, ids.back, rect, &c.bytes),
        Some(c) => {
            load_compressed(out, ids.delta, rect, &c.bytes);
            let at = Point::new(rect.x as i32, rect.y as i32);
            Draw {
                dst: ids.back,
                src: ids.delta,
                mask: ids.delta,
                rect,
                origin: Point::ZERO,
                sp: at,
                mp: at,
            }
            .write(out);
        }
    }
}

/// Copy within the back image: the content of `region` moves by `(dx, dy)`.
///
/// Only the part of `region` that receives shifted pixels is drawn.
pub fn scroll_copy(out: &mut Vec<u8>, ids: &ImageIds, region: Rect, dx: i32, dy: i32) {
    let x1 = region.x as i32 + dx.max(0);
    let y1 = region.y as i32 + dy.max(0);
    let x2 = region.x2() as i32 + dx.min(0);
    let y2 = region.y2() as i32 + dy.min(0);
    if x2 <= x1 || y2 <= y1 {
        return;
    }
    let rect = Rect::new(x1 as u32, y1 as u32, (x2 - x1) as u32, (y2 - y1) as u32);
    Draw {
        dst: ids.back,
        src: ids.back,
        mask: ids.opaque,
        rect,
        origin: Point::ZERO,
        sp: Point::new(x1 - dx, y1 - dy),
        mp: Point::ZERO,
    }
    .write(out);
}

/// Copy the back image onto the screen image at `origin`.
pub fn screen_copy(out: &mut Vec<u8>, ids: &ImageIds, screen: u32, frame: Rect, origin: Point) {
    Draw {
        dst: screen,
        src: ids.back,
        mask: ids.opaque,
        rect: frame,
        origin,
        sp: Point::new(frame.x as i32, frame.y as i32),
        mp: Point::ZERO,
    }
    .write(out);
}
