//! The previous-frame mirror.
//!
//! Records the pixels last known to be applied on the remote side, tile by
//! tile. Each tile also carries a validity flag: an invalid tile's pixels
//! mean nothing (never sent, exposed by a scroll, or the remote state was
//! lost) and the tile is unconditionally dirty.

use crate::draw::types::{BYTES_PER_PIXEL, Frame, Rect, TILE_SIZE, TileGrid, TileView};

/// Orchestrator-owned record of the remote back image.
pub struct Mirror {
    grid: TileGrid,
    stride: usize,
    data: Vec<u8>,
    valid: Vec<bool>,
}

impl Mirror {
    /// A mirror for a `width × height` frame with every tile invalid.
    pub fn new(width: u32, height: u32) -> Self {
        let grid = TileGrid::new(width, height);
        let stride = width as usize * BYTES_PER_PIXEL;
        Self {
            grid,
            stride,
            data: vec![0; stride * height as usize],
            valid: vec![false; grid.len()],
        }
    }

    pub fn width(&self) -> u32 {
        self.grid.width
    }

    pub fn height(&self) -> u32 {
        self.grid.height
    }

    pub fn grid(&self) -> &TileGrid {
        &self.grid
    }

    /// Whether the mirror describes frames of this size.
    pub fn fits(&self, frame: &Frame) -> bool {
        frame.width == self.grid.width && frame.height == self.grid.height
    }

    /// Forget everything: all tiles become dirty.
    pub fn invalidate_all(&mut self) {
        self.valid.fill(false);
    }

    pub fn valid_count(&self) -> usize {
        self.valid.iter().filter(|&&v| v).count()
    }

    /// Whether tile `index` holds known remote content.
    pub fn is_valid(&self, index: usize) -> bool {
        self.valid[index]
    }

    /// Whether every tile overlapping `area` holds known remote content.
    pub fn area_valid(&self, area: &Rect) -> bool {
        self.grid.covering(area).all(|i| self.valid[i])
    }

    /// View any rectangle of the mirror.
    pub fn view(&self, rect: Rect) -> TileView<'_> {
        TileView::new(&self.data, self.stride, rect)
    }

    /// The mirror tile at `index`, if it is valid.
    pub fn tile(&self, index: usize) -> Option<TileView<'_>> {
        self.valid[index].then(|| self.view(self.grid.rect_at(index)))
    }

    /// Whether tile `index` of `frame` must be sent.
    pub fn tile_dirty(&self, frame: &Frame, index: usize) -> bool {
        match self.tile(index) {
            Some(known) => !frame.view(self.grid.rect_at(index)).same_pixels(&known),
            None => true,
        }
    }

    /// Record that tile `index` of `frame` has been handed to the remote.
    pub fn store_tile(&mut self, frame: &Frame, index: usize) {
        let rect = self.grid.rect_at(index);
        let left = rect.x as usize * BYTES_PER_PIXEL;
        let len = rect.width as usize * BYTES_PER_PIXEL;
        for y in rect.y..rect.y2() {
            let src = &frame.row(y)[left..left + len];
            let start = y as usize * self.stride + left;
            self.data[start..start + len].copy_from_slice(src);
        }
        self.valid[index] = true;
    }

    /// Shift the content of `region` by `(dx, dy)`, as the remote does when
    /// it executes the matching scroll copy.
    ///
    /// Rows are copied in an order that never reads an already overwritten
    /// row; `copy_within` handles the overlap inside a row. Tiles touching
    /// the exposed strip become invalid, as do tiles whose source pixels
    /// came from invalid tiles.
    pub fn apply_scroll(&mut self, region: Rect, dx: i32, dy: i32) {
        let w = region.width as i32;
        let h = region.height as i32;
        if dx.abs() >= w || dy.abs() >= h {
            for i in self.grid.covering(&region).collect::<Vec<_>>() {
                self.valid[i] = false;
            }
            return;
        }

        let before = self.valid.clone();

        let copy_w = (w - dx.abs()) as usize * BYTES_PER_PIXEL;
        let src_x = region.x as usize + (-dx).max(0) as usize;
        let dst_x = region.x as usize + dx.max(0) as usize;
        let rows = (h - dy.abs()) as u32;
        let row_at = |i: u32| -> (u32, u32) {
            // (source row, destination row)
            if dy > 0 {
                let dst = region.y2() - 1 - i;
                (dst - dy as u32, dst)
            } else {
                let dst = region.y + i;
                (dst + (-dy) as u32, dst)
            }
        };
        for i in 0..rows {
            let (sy, ty) = row_at(i);
            let src = sy as usize * self.stride + src_x * BYTES_PER_PIXEL;
            let dst = ty as usize * self.stride + dst_x * BYTES_PER_PIXEL;
            self.data.copy_within(src..src + copy_w, dst);
        }

        let exposed = exposed_strips(region, dx, dy);
        for index in self.grid.covering(&region).collect::<Vec<_>>() {
            let rect = self.grid.rect_at(index);
            let touches_strip = exposed.iter().any(|s| !s.is_empty() && s.intersects(&rect));
            self.valid[index] = !touches_strip && {
                let src = Rect::new(
                    (rect.x as i32 - dx) as u32,
                    (rect.y as i32 - dy) as u32,
                    rect.width,
                    rect.height,
                );
                self.grid.covering(&src).all(|i| before[i])
            };
        }
    }
}

/// The strips of `region` left without source pixels after shifting its
/// content by `(dx, dy)`: one horizontal band and one vertical band.
pub fn exposed_strips(region: Rect, dx: i32, dy: i32) -> [Rect; 2] {
    let ady = dy.unsigned_abs().min(region.height);
    let adx = dx.unsigned_abs().min(region.width);
    let band_y = if dy > 0 { region.y } else { region.y2() - ady };
    let band_x = if dx > 0 { region.x } else { region.x2() - adx };
    [
        Rect::new(region.x, band_y, region.width, ady),
        Rect::new(band_x, region.y, adx, region.height),
    ]
}
