//! Synthetic frame source.
//!
//! Renders a page of pseudo-text that scrolls for a while, then holds still
//! with a blinking caret. That covers both of the engine's paths: scrolled
//! regions and isolated tile changes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use drawlink_core::{Frame, FrameHandoff, Rect};

const PAPER: u32 = 0x00F4_F1EA;
const INK: u32 = 0x0022_2A33;
const CARET: u32 = 0x00D0_3020;

/// Height of one text line in pixels.
const LINE: u32 = 20;
/// Width of one character cell in pixels.
const CELL: u32 = 8;

/// Frames spent scrolling, then frames spent still, per cycle.
const SCROLL_FRAMES: u64 = 90;
const HOLD_FRAMES: u64 = 60;
/// The caret toggles every this many frames.
const BLINK_FRAMES: u64 = 15;

fn mix(mut v: u32) -> u32 {
    v ^= v >> 16;
    v = v.wrapping_mul(0x7feb_352d);
    v ^= v >> 15;
    v = v.wrapping_mul(0x846c_a68b);
    v ^ (v >> 16)
}

/// A scrolling page of pseudo-text.
#[derive(Debug, Clone)]
pub struct DocumentProducer {
    step: u32,
    offset: u32,
    frame: u64,
}

impl DocumentProducer {
    /// `step` is how many pixels the page moves up per scrolling frame.
    pub fn new(step: u32) -> Self {
        Self {
            step,
            offset: 0,
            frame: 0,
        }
    }

    /// Document row shown at the top of the next frame.
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Where the caret sits (top-left of the frame).
    pub fn caret() -> Rect {
        Rect::new(CELL, 4, 2, LINE - 8)
    }

    fn document_pixel(x: u32, yd: u32) -> u32 {
        let line = yd / LINE;
        let r = yd % LINE;
        if !(5..15).contains(&r) {
            return PAPER;
        }
        let col = x / CELL;
        // Ragged right margin.
        if col >= 24 + mix(line) % 120 {
            return PAPER;
        }
        let glyph = mix(line.wrapping_mul(4099) ^ col);
        // Word gaps.
        if glyph % 6 == 0 || x % CELL == CELL - 1 {
            return PAPER;
        }
        let bit = ((x % CELL) + (r - 5) * CELL) % 31;
        if glyph >> bit & 1 == 1 { INK } else { PAPER }
    }

    /// Draw the next frame into `frame` and advance.
    pub fn render(&mut self, frame: &mut Frame) {
        let width = frame.width;
        for y in 0..frame.height {
            let yd = self.offset.wrapping_add(y);
            let row = frame.row_mut(y);
            for (x, px) in row.chunks_exact_mut(4).enumerate() {
                px.copy_from_slice(&Self::document_pixel(x as u32, yd).to_le_bytes());
            }
        }
        let phase = self.frame % (SCROLL_FRAMES + HOLD_FRAMES);
        if phase >= SCROLL_FRAMES && (self.frame / BLINK_FRAMES) % 2 == 0 && width > 16 {
            frame.fill_rect(Self::caret(), CARET);
        }
        if phase < SCROLL_FRAMES {
            self.offset = self.offset.wrapping_add(self.step);
        }
        self.frame += 1;
    }

    /// Render and publish at `fps` until `running` clears or the handoff
    /// shuts down.
    pub fn spawn(
        mut self,
        handoff: Arc<FrameHandoff>,
        mut frame: Frame,
        fps: u32,
        running: Arc<AtomicBool>,
    ) -> std::io::Result<JoinHandle<()>> {
        let period = Duration::from_secs(1) / fps.max(1);
        thread::Builder::new().name("frame-producer".into()).spawn(move || {
            info!("producer rendering {}x{} at {fps} fps", frame.width, frame.height);
            let mut next = Instant::now();
            while running.load(Ordering::SeqCst) && !handoff.is_shut_down() {
                self.render(&mut frame);
                frame = handoff.publish(frame, None);
                next += period;
                let now = Instant::now();
                if next > now {
                    thread::sleep(next - now);
                } else {
                    next = now;
                }
            }
            debug!("producer stopped after {} frames", self.frame);
        })
    }
}

// ── Tests ────────────────────────────────────────────────────────
