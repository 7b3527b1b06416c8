//! Scroll / motion detection.
//!
//! The frame is cut into a grid of regions (roughly 256 px cells, aligned
//! to tiles, inset by a margin). For each region, phase correlation against
//! the mirror proposes a translation; the proposal is only accepted when
//! sending the region *with* the shift applied is strictly cheaper than
//! sending it without.

pub mod correlate;

pub use correlate::{CorrelationScratch, Correlator, WINDOW};

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::draw::codec::{MatchFinder, transmission_cost};
use crate::draw::command::DRAW_LEN;
use crate::draw::mirror::Mirror;
use crate::draw::scratch::{DrawPool, WorkerScratch};
use crate::draw::types::{Frame, Rect, TILE_SIZE};

/// Target edge length of a region.
pub const REGION_CELL: u32 = 256;
/// Border left out of every region.
pub const REGION_MARGIN: u32 = TILE_SIZE;
/// Below this inner extent no regions are produced.
pub const MIN_REGION: u32 = 64;

// ── ScrollRegion ─────────────────────────────────────────────────

/// One cell of the scroll grid and the verdict for the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrollRegion {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
    /// Whether a verified shift was found this frame.
    pub detected: bool,
    pub dx: i32,
    pub dy: i32,
}

impl ScrollRegion {
    pub fn new(x1: u32, y1: u32, x2: u32, y2: u32) -> Self {
        Self {
            x1,
            y1,
            x2,
            y2,
            detected: false,
            dx: 0,
            dy: 0,
        }
    }

    pub fn rect(&self) -> Rect {
        Rect::new(self.x1, self.y1, self.x2 - self.x1, self.y2 - self.y1)
    }

    /// Clear the verdict.
    pub fn reset(&mut self) {
        self.detected = false;
        self.dx = 0;
        self.dy = 0;
    }

    /// Whether a shift stays strictly below half the region on both axes.
    /// Peaks at or beyond that are aliasing-prone and never trusted.
    pub fn shift_in_bounds(&self, dx: i32, dy: i32) -> bool {
        let half_w = ((self.x2 - self.x1) / 2) as i32;
        let half_h = ((self.y2 - self.y1) / 2) as i32;
        dx.abs() < half_w && dy.abs() < half_h
    }
}

/// Split a `length`-pixel axis (after margins) into tile-aligned cells of
/// at most [`REGION_CELL`] pixels.
fn cells(length: u32) -> Vec<(u32, u32)> {
    let start = REGION_MARGIN;
    let end = length.saturating_sub(REGION_MARGIN) / TILE_SIZE * TILE_SIZE;
    if end < start + MIN_REGION {
        return Vec::new();
    }
    let extent = end - start;
    let count = extent.div_ceil(REGION_CELL);
    let cell = extent.div_ceil(count).div_ceil(TILE_SIZE) * TILE_SIZE;
    let mut out = Vec::new();
    let mut a = start;
    while a < end {
        let b = (a + cell).min(end);
        out.push((a, b));
        a = b;
    }
    out
}

/// The region grid for a `width × height` frame.
pub fn regions(width: u32, height: u32) -> Vec<ScrollRegion> {
    let xs = cells(width);
    let ys = cells(height);
    ys.iter()
        .flat_map(|&(y1, y2)| xs.iter().map(move |&(x1, x2)| ScrollRegion::new(x1, y1, x2, y2)))
        .collect()
}

// ── ScrollConfig ─────────────────────────────────────────────────

/// Scroll detection tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrollConfig {
    /// Largest shift searched, in pixels. Further capped at half the
    /// region's smaller edge.
    pub max_shift: u32,
}

impl Default for ScrollConfig {
    fn default() -> Self {
        Self { max_shift: 64 }
    }
}

// ── ScrollDetector ───────────────────────────────────────────────

/// Proposes and verifies per-region translations.
pub struct ScrollDetector {
    correlator: Correlator,
    config: ScrollConfig,
}

impl ScrollDetector {
    pub fn new(config: ScrollConfig) -> Self {
        Self {
            correlator: Correlator::new(),
            config,
        }
    }

    pub fn config(&self) -> &ScrollConfig {
        &self.config
    }

    /// Decide every region in parallel, updating each in place.
    ///
    /// `allow_delta` says whether the tile phase may use alpha-delta
    /// encoding; cost estimates follow the same rule.
    pub fn detect(
        &self,
        pool: &DrawPool,
        frame: &Frame,
        mirror: &Mirror,
        regions: &mut [ScrollRegion],
        allow_delta: bool,
    ) {
        let decided = {
            let snapshot: &[ScrollRegion] = regions;
            pool.map(snapshot.len(), |scratch, i| {
                let mut region = snapshot[i];
                self.detect_region(scratch, frame, mirror, &mut region, allow_delta);
                region
            })
        };
        regions.copy_from_slice(&decided);
    }

    /// Decide one region.
    pub fn detect_region(
        &self,
        scratch: &mut WorkerScratch,
        frame: &Frame,
        mirror: &Mirror,
        region: &mut ScrollRegion,
        allow_delta: bool,
    ) {
        region.reset();
        let rect = region.rect();
        if rect.is_empty() || !mirror.fits(frame) || !mirror.area_valid(&rect) {
            return;
        }
        let current = frame.view(rect);
        let previous = mirror.view(rect);
        if current.same_pixels(&previous) {
            return;
        }

        // Search bound in region pixels, then in window units.
        let cap = self.config.max_shift.min(rect.width.min(rect.height) / 2);
        let to_window = |len: u32| (cap as usize * WINDOW).div_ceil(len as usize);
        let (px, py) = self.correlator.correlate(
            &mut scratch.correlation,
            &current,
            &previous,
            to_window(rect.width),
            to_window(rect.height),
        );
        if (px, py) == (0, 0) {
            return;
        }

        let scaled = rect.width as usize != WINDOW || rect.height as usize != WINDOW;
        let back = |p: i32, len: u32| (p as f32 * len as f32 / WINDOW as f32).round() as i32;
        let (cx, cy) = (back(px, rect.width), back(py, rect.height));
        let spread = if scaled { 1 } else { 0 };

        let unshifted = region_cost(&mut scratch.finder, frame, mirror, rect, 0, 0, allow_delta, usize::MAX);
        let mut best: Option<(usize, i32, i32)> = None;
        for dy in cy - spread..=cy + spread {
            for dx in cx - spread..=cx + spread {
                if (dx, dy) == (0, 0) || !region.shift_in_bounds(dx, dy) {
                    continue;
                }
                let budget = best.map_or(unshifted, |(c, _, _)| c);
                let cost = DRAW_LEN
                    + region_cost(&mut scratch.finder, frame, mirror, rect, dx, dy, allow_delta, budget);
                if cost < budget {
                    best = Some((cost, dx, dy));
                }
            }
        }

        match best {
            Some((cost, dx, dy)) => {
                trace!(x = rect.x, y = rect.y, dx, dy, cost, unshifted, "scroll accepted");
                region.detected = true;
                region.dx = dx;
                region.dy = dy;
            }
            None => {
                trace!(x = rect.x, y = rect.y, px, py, unshifted, "scroll rejected");
            }
        }
    }
}

/// Bytes needed to bring every tile of `region` up to date, assuming the
/// remote first shifts the region's content by `(dx, dy)`.
///
/// Tiles whose shifted source falls outside the region (the exposed strip)
/// are costed against the mirror content they currently hold. Summation
/// stops early once `budget` is reached.
#[allow(clippy::too_many_arguments)]
fn region_cost(
    finder: &mut MatchFinder,
    frame: &Frame,
    mirror: &Mirror,
    region: Rect,
    dx: i32,
    dy: i32,
    allow_delta: bool,
    budget: usize,
) -> usize {
    let grid = *mirror.grid();
    let mut total = 0usize;
    for index in grid.covering(&region) {
        let rect = grid.rect_at(index);
        let current = frame.view(rect);
        let source = shifted_source(&region, &rect, dx, dy);
        let reference = match source {
            Some(src) if mirror.area_valid(&src) => Some(mirror.view(src)),
            _ => mirror.tile(index),
        };
        total += transmission_cost(finder, &current, reference.as_ref(), allow_delta);
        if total >= budget {
            break;
        }
    }
    total
}

/// Where the pixels of `tile` come from after shifting by `(dx, dy)`, when
/// that lies wholly inside `region`.
fn shifted_source(region: &Rect, tile: &Rect, dx: i32, dy: i32) -> Option<Rect> {
    let x = tile.x as i64 - dx as i64;
    let y = tile.y as i64 - dy as i64;
    if x < 0 || y < 0 {
        return None;
    }
    let src = Rect::new(x as u32, y as u32, tile.width, tile.height);
    region.contains(&src).then_some(src)
}

// ── Tests ────────────────────────────────────────────────────────
