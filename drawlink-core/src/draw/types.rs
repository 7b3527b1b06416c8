//! Shared frame / tile types used across the encoding pipeline.
//!
//! A [`Frame`] is a fixed-stride grid of 32-bit pixels laid out as
//! blue, green, red, and an unused byte. Tiles are never allocated on
//! their own: a [`TileView`] borrows a rectangle out of a frame (or out
//! of the mirror) and the codec reads rows through it.

use crate::error::DrawError;

/// Edge length of a tile in pixels.
pub const TILE_SIZE: u32 = 16;

/// Bytes per pixel (B, G, R, X).
pub const BYTES_PER_PIXEL: usize = 4;

/// Raw byte size of a full tile.
pub const TILE_BYTES: usize = (TILE_SIZE * TILE_SIZE) as usize * BYTES_PER_PIXEL;

// ── Rect ─────────────────────────────────────────────────────────

/// An axis-aligned rectangle in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rect {
    /// Left edge in pixels.
    pub x: u32,
    /// Top edge in pixels.
    pub y: u32,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Rect {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Exclusive right edge.
    pub const fn x2(&self) -> u32 {
        self.x + self.width
    }

    /// Exclusive bottom edge.
    pub const fn y2(&self) -> u32 {
        self.y + self.height
    }

    pub const fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Pixel area.
    pub const fn area(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Raw byte size of the pixels covered by this rectangle.
    pub const fn byte_len(&self) -> usize {
        self.area() * BYTES_PER_PIXEL
    }

    /// Whether the two rectangles share at least one pixel.
    pub fn intersects(&self, other: &Rect) -> bool {
        self.x < other.x2() && other.x < self.x2() && self.y < other.y2() && other.y < self.y2()
    }

    /// Whether `other` lies entirely inside `self`.
    pub fn contains(&self, other: &Rect) -> bool {
        other.x >= self.x && other.y >= self.y && other.x2() <= self.x2() && other.y2() <= self.y2()
    }
}

// ── TileGrid ─────────────────────────────────────────────────────

/// The tile partition of a `width × height` frame.
///
/// Tiles start on multiples of [`TILE_SIZE`]; the last column and row are
/// truncated at the frame boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGrid {
    pub width: u32,
    pub height: u32,
    pub tiles_x: u32,
    pub tiles_y: u32,
}

impl TileGrid {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            tiles_x: width.div_ceil(TILE_SIZE),
            tiles_y: height.div_ceil(TILE_SIZE),
        }
    }

    /// Total number of tiles.
    pub fn len(&self) -> usize {
        self.tiles_x as usize * self.tiles_y as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Row-major tile index of tile column `tx`, row `ty`.
    pub fn index(&self, tx: u32, ty: u32) -> usize {
        ty as usize * self.tiles_x as usize + tx as usize
    }

    /// Pixel rectangle of tile column `tx`, row `ty`.
    pub fn rect(&self, tx: u32, ty: u32) -> Rect {
        let x = tx * TILE_SIZE;
        let y = ty * TILE_SIZE;
        Rect::new(
            x,
            y,
            TILE_SIZE.min(self.width - x),
            TILE_SIZE.min(self.height - y),
        )
    }

    /// Pixel rectangle of the tile at row-major index `i`.
    pub fn rect_at(&self, i: usize) -> Rect {
        let tx = (i % self.tiles_x as usize) as u32;
        let ty = (i / self.tiles_x as usize) as u32;
        self.rect(tx, ty)
    }

    /// Tiles in scan order (row by row, left to right).
    pub fn tiles(&self) -> impl Iterator<Item = Rect> + '_ {
        (0..self.tiles_y).flat_map(move |ty| (0..self.tiles_x).map(move |tx| self.rect(tx, ty)))
    }

    /// Row-major indices of every tile overlapping `area`.
    pub fn covering(&self, area: &Rect) -> impl Iterator<Item = usize> + '_ {
        let tx0 = area.x / TILE_SIZE;
        let ty0 = area.y / TILE_SIZE;
        let tx1 = area.x2().min(self.width).div_ceil(TILE_SIZE);
        let ty1 = area.y2().min(self.height).div_ceil(TILE_SIZE);
        (ty0..ty1).flat_map(move |ty| (tx0..tx1).map(move |tx| self.index(tx, ty)))
    }
}

// ── Frame ────────────────────────────────────────────────────────

/// A rendered framebuffer.
///
/// The `data` buffer holds `height` rows of `stride` bytes each.
/// `stride` may exceed `width * 4` when the producer pads rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Row pitch in **bytes**.
    pub stride: u32,
    /// Raw pixel data, `stride * height` bytes.
    pub data: Vec<u8>,
}

impl Frame {
    /// Allocate a zeroed (black) frame with tightly packed rows.
    pub fn new(width: u32, height: u32) -> Self {
        let stride = width * BYTES_PER_PIXEL as u32;
        Self {
            width,
            height,
            stride,
            data: vec![0; stride as usize * height as usize],
        }
    }

    /// Wrap an existing buffer, validating its size.
    pub fn from_raw(width: u32, height: u32, stride: u32, data: Vec<u8>) -> Result<Self, DrawError> {
        if (stride as usize) < width as usize * BYTES_PER_PIXEL {
            return Err(DrawError::InvalidGeometry(format!(
                "stride {stride} shorter than a {width}px row"
            )));
        }
        let needed = stride as usize * height as usize;
        if data.len() < needed {
            return Err(DrawError::InvalidGeometry(format!(
                "frame buffer holds {} bytes, {needed} required",
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            stride,
            data,
        })
    }

    /// Total byte size the bitmap occupies.
    pub fn byte_len(&self) -> usize {
        self.stride as usize * self.height as usize
    }

    /// The tile partition of this frame.
    pub fn grid(&self) -> TileGrid {
        TileGrid::new(self.width, self.height)
    }

    /// Pixel bytes of row `y` (without padding).
    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.stride as usize;
        &self.data[start..start + self.width as usize * BYTES_PER_PIXEL]
    }

    /// Mutable pixel bytes of row `y` (without padding).
    pub fn row_mut(&mut self, y: u32) -> &mut [u8] {
        let start = y as usize * self.stride as usize;
        let len = self.width as usize * BYTES_PER_PIXEL;
        &mut self.data[start..start + len]
    }

    /// Pixel at `(x, y)` as a little-endian `0xXXRRGGBB` word.
    pub fn pixel(&self, x: u32, y: u32) -> u32 {
        let offset = y as usize * self.stride as usize + x as usize * BYTES_PER_PIXEL;
        u32::from_le_bytes([
            self.data[offset],
            self.data[offset + 1],
            self.data[offset + 2],
            self.data[offset + 3],
        ])
    }

    /// Overwrite the pixel at `(x, y)`.
    pub fn set_pixel(&mut self, x: u32, y: u32, value: u32) {
        let offset = y as usize * self.stride as usize + x as usize * BYTES_PER_PIXEL;
        self.data[offset..offset + BYTES_PER_PIXEL].copy_from_slice(&value.to_le_bytes());
    }

    /// Fill a rectangle with one pixel value.
    pub fn fill_rect(&mut self, rect: Rect, value: u32) {
        let px = value.to_le_bytes();
        for y in rect.y..rect.y2().min(self.height) {
            let row = self.row_mut(y);
            let x2 = rect.x2().min(row.len() as u32 / BYTES_PER_PIXEL as u32);
            for x in rect.x..x2 {
                let o = x as usize * BYTES_PER_PIXEL;
                row[o..o + BYTES_PER_PIXEL].copy_from_slice(&px);
            }
        }
    }

    /// Borrow a rectangle as a tile view.
    pub fn view(&self, rect: Rect) -> TileView<'_> {
        TileView::new(&self.data, self.stride as usize, rect)
    }
}

// ── TileView ─────────────────────────────────────────────────────

/// A borrowed rectangle of pixels inside a larger buffer.
#[derive(Debug, Clone, Copy)]
pub struct TileView<'a> {
    data: &'a [u8],
    stride: usize,
    offset: usize,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl<'a> TileView<'a> {
    /// View `rect` of a buffer with the given row pitch.
    ///
    /// # Panics
    ///
    /// Panics if `rect` reaches past the end of `data`.
    pub fn new(data: &'a [u8], stride: usize, rect: Rect) -> Self {
        let offset = rect.y as usize * stride + rect.x as usize * BYTES_PER_PIXEL;
        if !rect.is_empty() {
            let last = offset + (rect.height as usize - 1) * stride + rect.width as usize * BYTES_PER_PIXEL;
            assert!(last <= data.len(), "tile view out of bounds");
        }
        Self {
            data,
            stride,
            offset,
            width: rect.width,
            height: rect.height,
        }
    }

    /// Bytes per tile row.
    pub fn row_bytes(&self) -> usize {
        self.width as usize * BYTES_PER_PIXEL
    }

    /// Raw byte size of the tile.
    pub fn byte_len(&self) -> usize {
        self.row_bytes() * self.height as usize
    }

    /// Pixel bytes of tile row `r`.
    pub fn row(&self, r: u32) -> &'a [u8] {
        let start = self.offset + r as usize * self.stride;
        &self.data[start..start + self.row_bytes()]
    }

    pub fn rows(&self) -> impl Iterator<Item = &'a [u8]> + '_ {
        (0..self.height).map(move |r| self.row(r))
    }

    /// Copy the tile into `out` with tightly packed rows.
    pub fn pack_into(&self, out: &mut Vec<u8>) {
        out.clear();
        for row in self.rows() {
            out.extend_from_slice(row);
        }
    }

    /// Byte-exact comparison with another view of the same size.
    pub fn same_pixels(&self, other: &TileView<'_>) -> bool {
        self.width == other.width
            && self.height == other.height
            && self.rows().zip(other.rows()).all(|(a, b)| a == b)
    }
}

// ── DamageMap ────────────────────────────────────────────────────

/// Producer-supplied per-tile change flags (one byte per tile,
/// nonzero = changed), valid only for the frame it accompanies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DamageMap {
    pub tiles_x: u32,
    pub tiles_y: u32,
    pub flags: Vec<u8>,
}

impl DamageMap {
    /// An all-clean map for the given grid.
    pub fn clean(grid: &TileGrid) -> Self {
        Self {
            tiles_x: grid.tiles_x,
            tiles_y: grid.tiles_y,
            flags: vec![0; grid.len()],
        }
    }

    /// Mark every tile overlapping `area` as damaged.
    pub fn mark(&mut self, grid: &TileGrid, area: Rect) {
        for i in grid.covering(&area) {
            self.flags[i] = 1;
        }
    }

    pub fn is_damaged(&self, index: usize) -> bool {
        self.flags.get(index).is_some_and(|&f| f != 0)
    }

    /// Whether this map describes the given grid.
    pub fn matches(&self, grid: &TileGrid) -> bool {
        self.tiles_x == grid.tiles_x && self.tiles_y == grid.tiles_y && self.flags.len() == grid.len()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_truncates_edge_tiles() {
        let grid = TileGrid::new(40, 20);
        assert_eq!(grid.tiles_x, 3);
        assert_eq!(grid.tiles_y, 2);
        assert_eq!(grid.rect(2, 1), Rect::new(32, 16, 8, 4));
        assert_eq!(grid.rect_at(5), Rect::new(32, 16, 8, 4));
        assert_eq!(grid.tiles().count(), 6);
    }

    #[test]
    fn covering_includes_partial_overlap() {
        let grid = TileGrid::new(64, 64);
        let hit: Vec<usize> = grid.covering(&Rect::new(8, 8, 16, 4)).collect();
        assert_eq!(hit, vec![0, 1]);
    }

    #[test]
    fn frame_pixels_roundtrip() {
        let mut f = Frame::new(8, 8);
        f.set_pixel(3, 4, 0x00FF_0000);
        assert_eq!(f.pixel(3, 4), 0x00FF_0000);
        assert_eq!(f.row(4)[12..16], [0x00, 0x00, 0xFF, 0x00]);
    }

    #[test]
    fn from_raw_rejects_short_buffers() {
        assert!(Frame::from_raw(4, 4, 16, vec![0; 63]).is_err());
        assert!(Frame::from_raw(4, 4, 8, vec![0; 64]).is_err());
        assert!(Frame::from_raw(4, 4, 20, vec![0; 80]).is_ok());
    }

    #[test]
    fn view_respects_stride() {
        let mut f = Frame::from_raw(4, 2, 20, vec![0; 40]).unwrap();
        f.set_pixel(1, 1, 0x0102_0304);
        let v = f.view(Rect::new(1, 1, 2, 1));
        assert_eq!(v.row(0), &[4, 3, 2, 1, 0, 0, 0, 0]);
        let mut packed = Vec::new();
        v.pack_into(&mut packed);
        assert_eq!(packed.len(), 8);
    }

    #[test]
    fn damage_map_marks_tiles() {
        let grid = TileGrid::new(64, 32);
        let mut dmg = DamageMap::clean(&grid);
        dmg.mark(&grid, Rect::new(20, 20, 1, 1));
        assert!(dmg.is_damaged(grid.index(1, 1)));
        assert!(!dmg.is_damaged(0));
        assert!(dmg.matches(&grid));
    }
}
