//! Phase correlation over a fixed square window.
//!
//! Both images are reduced to luma, weighted with a separable Hann window
//! and transformed; the normalised cross-power spectrum transforms back to
//! a surface whose peak sits at the translation between them.

use std::sync::Arc;

use rustfft::num_complex::Complex32;
use rustfft::{Fft, FftPlanner};

use crate::draw::types::{BYTES_PER_PIXEL, TileView};

/// Edge length of the correlation window.
pub const WINDOW: usize = 256;

/// Cross-power terms weaker than this carry no phase information.
const EPSILON: f32 = 1e-6;

/// Per-worker transform buffers, allocated on first use and then reused.
#[derive(Default)]
pub struct CorrelationScratch {
    current: Vec<Complex32>,
    previous: Vec<Complex32>,
    fft: Vec<Complex32>,
}

impl CorrelationScratch {
    fn ensure(&mut self, fft_len: usize) {
        let n = WINDOW * WINDOW;
        if self.current.len() != n {
            self.current = vec![Complex32::default(); n];
            self.previous = vec![Complex32::default(); n];
        }
        if self.fft.len() < fft_len {
            self.fft = vec![Complex32::default(); fft_len];
        }
    }

    /// Whether the buffers have been allocated.
    pub fn is_allocated(&self) -> bool {
        !self.current.is_empty()
    }
}

/// Shared, read-only transform plans and window weights.
pub struct Correlator {
    forward: Arc<dyn Fft<f32>>,
    inverse: Arc<dyn Fft<f32>>,
    hann: Vec<f32>,
}

impl Correlator {
    pub fn new() -> Self {
        let mut planner = FftPlanner::new();
        let forward = planner.plan_fft_forward(WINDOW);
        let inverse = planner.plan_fft_inverse(WINDOW);
        let hann = (0..WINDOW)
            .map(|n| {
                let phase = 2.0 * std::f32::consts::PI * n as f32 / (WINDOW - 1) as f32;
                0.5 - 0.5 * phase.cos()
            })
            .collect();
        Self {
            forward,
            inverse,
            hann,
        }
    }

    /// Estimate how far `current` is translated relative to `previous`,
    /// in window units, searching `|dx| <= max_x`, `|dy| <= max_y`.
    ///
    /// Views smaller than the window are scaled up to fill it with
    /// nearest-neighbour sampling. Ties resolve towards no motion.
    pub fn correlate(
        &self,
        scratch: &mut CorrelationScratch,
        current: &TileView<'_>,
        previous: &TileView<'_>,
        max_x: usize,
        max_y: usize,
    ) -> (i32, i32) {
        let fft_len = self
            .forward
            .get_inplace_scratch_len()
            .max(self.inverse.get_inplace_scratch_len());
        scratch.ensure(fft_len);
        let CorrelationScratch {
            current: a,
            previous: b,
            fft,
        } = scratch;

        self.load(current, a);
        self.load(previous, b);
        transform(self.forward.as_ref(), a, fft);
        transform(self.forward.as_ref(), b, fft);

        for (x, y) in a.iter_mut().zip(b.iter()) {
            let p = *x * y.conj();
            let m = p.norm();
            *x = if m < EPSILON { Complex32::default() } else { p / m };
        }
        transform(self.inverse.as_ref(), a, fft);

        let max_x = max_x.min(WINDOW / 2 - 1) as i32;
        let max_y = max_y.min(WINDOW / 2 - 1) as i32;
        let n = WINDOW as i32;
        let mut best = (0, 0);
        let mut best_val = a[0].re;
        for dy in -max_y..=max_y {
            let row = ((dy + n) % n) as usize * WINDOW;
            for dx in -max_x..=max_x {
                let v = a[row + ((dx + n) % n) as usize].re;
                if v > best_val {
                    best_val = v;
                    best = (dx, dy);
                }
            }
        }
        best
    }

    /// Fill `out` with the windowed luma of `view`.
    fn load(&self, view: &TileView<'_>, out: &mut [Complex32]) {
        let w = view.width as usize;
        let h = view.height as usize;
        for wy in 0..WINDOW {
            let row = view.row((wy * h / WINDOW) as u32);
            let wy_weight = self.hann[wy];
            let line = &mut out[wy * WINDOW..(wy + 1) * WINDOW];
            for (wx, cell) in line.iter_mut().enumerate() {
                let o = (wx * w / WINDOW) * BYTES_PER_PIXEL;
                let luma = 0.114 * row[o] as f32 + 0.587 * row[o + 1] as f32 + 0.299 * row[o + 2] as f32;
                *cell = Complex32::new(luma * self.hann[wx] * wy_weight, 0.0);
            }
        }
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

/// 2D transform as row passes around a transpose. A forward pass leaves the
/// spectrum transposed; the inverse pass undoes the transposition.
fn transform(fft: &dyn Fft<f32>, buf: &mut [Complex32], scratch: &mut [Complex32]) {
    fft.process_with_scratch(buf, scratch);
    transpose(buf);
    fft.process_with_scratch(buf, scratch);
}

fn transpose(buf: &mut [Complex32]) {
    for y in 0..WINDOW {
        for x in y + 1..WINDOW {
            buf.swap(y * WINDOW + x, x * WINDOW + y);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::draw::types::{Frame, Rect};

    fn textured(w: u32, h: u32, seed: u32) -> Frame {
        let mut f = Frame::new(w, h);
        for y in 0..h {
            for x in 0..w {
                let mut v = (x.wrapping_mul(73_856_093) ^ y.wrapping_mul(19_349_663)).wrapping_add(seed);
                v ^= v >> 13;
                v = v.wrapping_mul(0x5bd1_e995);
                v ^= v >> 15;
                f.set_pixel(x, y, v & 0x00FF_FFFF);
            }
        }
        f
    }

    fn shifted(src: &Frame, dx: i32, dy: i32) -> Frame {
        let mut out = Frame::new(src.width, src.height);
        for y in 0..src.height as i32 {
            for x in 0..src.width as i32 {
                let (sx, sy) = (x - dx, y - dy);
                if sx >= 0 && sy >= 0 && sx < src.width as i32 && sy < src.height as i32 {
                    out.set_pixel(x as u32, y as u32, src.pixel(sx as u32, sy as u32));
                }
            }
        }
        out
    }

    #[test]
    fn finds_pure_translation() {
        let c = Correlator::new();
        let mut scratch = CorrelationScratch::default();
        let prev = textured(256, 256, 1);
        for &(dx, dy) in &[(0, 8), (0, -12), (5, 0), (-3, 7)] {
            let cur = shifted(&prev, dx, dy);
            let full = Rect::new(0, 0, 256, 256);
            let got = c.correlate(&mut scratch, &cur.view(full), &prev.view(full), 64, 64);
            assert_eq!(got, (dx, dy));
        }
        assert!(scratch.is_allocated());
    }

    #[test]
    fn identical_images_report_no_motion() {
        let c = Correlator::new();
        let mut scratch = CorrelationScratch::default();
        let f = textured(256, 256, 9);
        let full = Rect::new(0, 0, 256, 256);
        assert_eq!(c.correlate(&mut scratch, &f.view(full), &f.view(full), 32, 32), (0, 0));
    }

    #[test]
    fn flat_images_report_no_motion() {
        let c = Correlator::new();
        let mut scratch = CorrelationScratch::default();
        let a = Frame::new(128, 128);
        let full = Rect::new(0, 0, 128, 128);
        assert_eq!(c.correlate(&mut scratch, &a.view(full), &a.view(full), 16, 16), (0, 0));
    }

    #[test]
    fn hann_window_is_zero_at_edges() {
        let c = Correlator::new();
        assert!(c.hann[0].abs() < 1e-6);
        assert!(c.hann[WINDOW - 1].abs() < 1e-6);
        assert!((c.hann[WINDOW / 2] - 1.0).abs() < 1e-3);
    }
}
