//! The frame orchestrator.
//!
//! Single coordinating loop between the producer's handoff and the wire.
//! Per frame it:
//!
//! 1. resets the mirror if the transport flagged an error since last frame,
//! 2. detects and applies scrolls (incremental frames only),
//! 3. finds the changed tiles and encodes them on the worker pool,
//! 4. queues scroll copies, tile loads and the footer, in that order,
//! 5. records every queued tile in the mirror.
//!
//! Alpha-delta encoding stays off until a full frame has been acknowledged
//! end to end, since before that the remote has no trusted base to
//! composite over.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::draw::channel::DrawChannel;
use crate::draw::codec::{self, CompressedTile};
use crate::draw::command::{self, ImageIds};
use crate::draw::handoff::{FrameHandoff, HandoffEvent};
use crate::draw::mirror::Mirror;
use crate::draw::pipeline::{PipelineConfig, PipelineStats, TransmissionPipeline};
use crate::draw::pool::default_workers;
use crate::draw::scratch::{DrawPool, draw_pool};
use crate::draw::scroll::{self, ScrollConfig, ScrollDetector, ScrollRegion};
use crate::draw::target::DisplayTarget;
use crate::draw::types::{DamageMap, Frame, Rect};
use crate::error::DrawError;

// ── Configuration ────────────────────────────────────────────────

/// Orchestrator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Allow alpha-delta tile encoding.
    pub tile_delta: bool,
    /// Run scroll detection on incremental frames.
    pub scroll_detection: bool,
    pub scroll: ScrollConfig,
    /// Worker threads; 0 picks half the logical cores.
    pub workers: usize,
    /// Idle time after which a lone flush is sent to check the link.
    pub probe_interval_ms: u64,
    /// How long the loop waits for a frame before probing.
    pub frame_wait_ms: u64,
    /// Limit on draining the pipeline before out-of-band work.
    pub pause_timeout_ms: u64,
    pub ids: ImageIds,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            tile_delta: true,
            scroll_detection: true,
            scroll: ScrollConfig::default(),
            workers: 0,
            probe_interval_ms: 2_000,
            frame_wait_ms: 250,
            pause_timeout_ms: 5_000,
            ids: ImageIds::default(),
        }
    }
}

impl OrchestratorConfig {
    fn worker_count(&self) -> usize {
        if self.workers == 0 {
            default_workers()
        } else {
            self.workers
        }
    }
}

// ── Telemetry ────────────────────────────────────────────────────

/// What one frame cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameReport {
    pub frame: u64,
    /// Sent as a full resend.
    pub full: bool,
    pub scrolls: usize,
    pub tiles_raw: usize,
    pub tiles_direct: usize,
    pub tiles_delta: usize,
    /// Command bytes queued, footer included.
    pub bytes: usize,
}

impl FrameReport {
    pub fn tiles(&self) -> usize {
        self.tiles_raw + self.tiles_direct + self.tiles_delta
    }
}

/// Totals since start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EncoderStats {
    pub frames: u64,
    pub full_frames: u64,
    pub scrolls: u64,
    pub tiles_raw: u64,
    pub tiles_direct: u64,
    pub tiles_delta: u64,
    pub bytes: u64,
    pub probes: u64,
    pub recoveries: u64,
}

impl EncoderStats {
    fn add(&mut self, r: &FrameReport) {
        self.frames += 1;
        self.full_frames += r.full as u64;
        self.scrolls += r.scrolls as u64;
        self.tiles_raw += r.tiles_raw as u64;
        self.tiles_direct += r.tiles_direct as u64;
        self.tiles_delta += r.tiles_delta as u64;
        self.bytes += r.bytes as u64;
    }
}

/// Pipeline position when the last full frame finished queueing.
#[derive(Debug, Clone, Copy)]
struct FullFrameMark {
    batches: u64,
    errors: u64,
}

// ── FrameOrchestrator ────────────────────────────────────────────

pub struct FrameOrchestrator {
    config: OrchestratorConfig,
    pool: DrawPool,
    detector: ScrollDetector,
    pipeline: TransmissionPipeline,
    target: Box<dyn DisplayTarget>,
    mirror: Mirror,
    regions: Vec<ScrollRegion>,
    force_full: bool,
    delta_enabled: bool,
    full_mark: Option<FullFrameMark>,
    last_send: Instant,
    frame_number: u64,
    stats: EncoderStats,
    /// Reused command buffer.
    cmd: Vec<u8>,
    /// Reused raw tile buffer.
    pixels: Vec<u8>,
}

impl FrameOrchestrator {
    /// Build the engine for `width × height` frames sent over `channel`.
    pub fn new(
        config: OrchestratorConfig,
        pipeline: PipelineConfig,
        channel: Arc<dyn DrawChannel>,
        target: Box<dyn DisplayTarget>,
        width: u32,
        height: u32,
    ) -> Result<Self, DrawError> {
        if width == 0 || height == 0 {
            return Err(DrawError::InvalidGeometry(format!("empty frame {width}x{height}")));
        }
        let pipeline = TransmissionPipeline::new(channel, pipeline)?;
        Ok(Self {
            pool: draw_pool(config.worker_count()),
            detector: ScrollDetector::new(config.scroll),
            pipeline,
            target,
            mirror: Mirror::new(width, height),
            regions: scroll::regions(width, height),
            force_full: true,
            delta_enabled: false,
            full_mark: None,
            last_send: Instant::now(),
            frame_number: 0,
            stats: EncoderStats::default(),
            cmd: Vec::with_capacity(4096),
            pixels: Vec::new(),
            config,
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn mirror(&self) -> &Mirror {
        &self.mirror
    }

    pub fn regions(&self) -> &[ScrollRegion] {
        &self.regions
    }

    pub fn delta_enabled(&self) -> bool {
        self.delta_enabled
    }

    /// Whether the next frame will be a full resend.
    pub fn full_frame_pending(&self) -> bool {
        self.force_full
    }

    pub fn stats(&self) -> EncoderStats {
        self.stats
    }

    pub fn pipeline_stats(&self) -> PipelineStats {
        self.pipeline.stats()
    }

    /// Wait until every queued write has been answered, then re-evaluate
    /// error and delta state.
    pub fn wait_idle(&mut self, timeout: Duration) -> Result<(), DrawError> {
        self.pipeline.wait_idle(timeout)?;
        self.poll_remote_state();
        Ok(())
    }

    /// Forget the remote state: the next frame is a full, non-delta,
    /// unscrolled resend.
    pub fn invalidate(&mut self, reason: &str) {
        if !self.force_full {
            info!("remote state lost ({reason}); next frame is a full resend");
            self.stats.recoveries += 1;
        }
        self.mirror.invalidate_all();
        self.force_full = true;
        self.delta_enabled = false;
        self.full_mark = None;
    }

    /// Pick up transport errors and decide whether delta may be used.
    fn poll_remote_state(&mut self) {
        let flags = self.pipeline.channel().take_error_flags();
        if self.pipeline.take_error_signal() || !flags.is_empty() {
            self.invalidate(&format!("transport error {flags:?}"));
            return;
        }
        if let Some(mark) = self.full_mark {
            if self.pipeline.errors() != mark.errors {
                self.invalidate("error during full frame");
            } else if self.pipeline.acknowledged() >= mark.batches {
                debug!("full frame acknowledged; delta tiles enabled");
                self.delta_enabled = true;
                self.full_mark = None;
            }
        }
    }

    fn resize(&mut self, width: u32, height: u32) {
        info!("frame size now {width}x{height}");
        self.mirror = Mirror::new(width, height);
        self.regions = scroll::regions(width, height);
        self.invalidate("resize");
    }

    /// Encode and queue one frame.
    ///
    /// On error the remote state is invalidated before returning, so the
    /// caller may simply continue with the next frame.
    pub fn process_frame(&mut self, frame: &Frame, damage: Option<&DamageMap>) -> Result<FrameReport, DrawError> {
        if frame.width == 0 || frame.height == 0 {
            return Err(DrawError::InvalidGeometry(format!(
                "empty frame {}x{}",
                frame.width, frame.height
            )));
        }
        self.poll_remote_state();
        if !self.mirror.fits(frame) {
            self.resize(frame.width, frame.height);
        }
        self.frame_number += 1;

        match self.send_frame(frame, damage) {
            Ok(report) => {
                self.stats.add(&report);
                self.last_send = Instant::now();
                debug!(
                    frame = report.frame,
                    full = report.full,
                    scrolls = report.scrolls,
                    raw = report.tiles_raw,
                    direct = report.tiles_direct,
                    delta = report.tiles_delta,
                    bytes = report.bytes,
                    "frame queued"
                );
                Ok(report)
            }
            Err(e) => {
                warn!("frame {} failed: {e}", self.frame_number);
                self.pipeline.discard_pending();
                self.invalidate("send failed");
                Err(e)
            }
        }
    }

    fn send_frame(&mut self, frame: &Frame, damage: Option<&DamageMap>) -> Result<FrameReport, DrawError> {
        let full = self.force_full;
        self.force_full = false;
        let allow_delta = self.config.tile_delta && self.delta_enabled && !full;
        let ids = self.config.ids;
        let grid = *self.mirror.grid();
        let mut report = FrameReport {
            frame: self.frame_number,
            full,
            ..Default::default()
        };

        // Scrolls: the mirror is shifted before any tile is compared.
        let mut scrolled = false;
        if !full && self.config.scroll_detection && !self.regions.is_empty() {
            self.detector
                .detect(&self.pool, frame, &self.mirror, &mut self.regions, allow_delta);
            for region in self.regions.iter().filter(|r| r.detected) {
                let rect = region.rect();
                self.mirror.apply_scroll(rect, region.dx, region.dy);
                self.cmd.clear();
                command::scroll_copy(&mut self.cmd, &ids, rect, region.dx, region.dy);
                self.pipeline.push(&self.cmd)?;
                report.bytes += self.cmd.len();
                report.scrolls += 1;
                scrolled = true;
            }
        }

        // Changed tiles.
        let damage = damage.filter(|d| !full && !scrolled && d.matches(&grid));
        let changed: Vec<usize> = match damage {
            Some(d) => (0..grid.len())
                .filter(|&i| d.is_damaged(i) || !self.mirror.is_valid(i))
                .collect(),
            None => {
                let mirror = &self.mirror;
                let dirty = self.pool.map(grid.len(), |_, i| mirror.tile_dirty(frame, i));
                (0..grid.len()).filter(|&i| dirty[i]).collect()
            }
        };

        // Encode on the pool, then queue in scan order.
        let encoded: Vec<Result<Option<CompressedTile>, DrawError>> = {
            let mirror = &self.mirror;
            let changed = &changed;
            self.pool.map(changed.len(), |scratch, k| {
                let index = changed[k];
                let tile = frame.view(grid.rect_at(index));
                let previous = if allow_delta { mirror.tile(index) } else { None };
                codec::encode(&mut scratch.finder, &tile, previous.as_ref())
            })
        };
        for (&index, result) in changed.iter().zip(encoded) {
            let rect = grid.rect_at(index);
            let compressed = result?;
            match &compressed {
                None => {
                    frame.view(rect).pack_into(&mut self.pixels);
                    report.tiles_raw += 1;
                }
                Some(c) if c.is_delta => report.tiles_delta += 1,
                Some(_) => report.tiles_direct += 1,
            }
            self.cmd.clear();
            command::tile_update(&mut self.cmd, &ids, rect, compressed.as_ref(), &self.pixels);
            self.pipeline.push(&self.cmd)?;
            report.bytes += self.cmd.len();
            self.mirror.store_tile(frame, index);
        }

        // Footer.
        let frame_rect = Rect::new(0, 0, frame.width, frame.height);
        let (screen, origin) = self.target.screen();
        self.cmd.clear();
        command::screen_copy(&mut self.cmd, &ids, screen, frame_rect, origin);
        self.target.decorate(&ids, frame_rect, &mut self.cmd);
        command::flush(&mut self.cmd);
        self.pipeline.push(&self.cmd)?;
        report.bytes += self.cmd.len();
        self.pipeline.end_frame()?;

        if full {
            self.full_mark = Some(FullFrameMark {
                batches: self.pipeline.batches_sent(),
                errors: self.pipeline.errors(),
            });
        }
        Ok(report)
    }

    /// Pause the pipeline, let the target re-bind, and adopt the new size.
    ///
    /// Returns whether the frame size changed.
    pub fn handle_geometry_change(&mut self, size: Option<(u32, u32)>) -> Result<bool, DrawError> {
        let timeout = Duration::from_millis(self.config.pause_timeout_ms);
        self.pipeline.flush()?;
        let relooked = self
            .pipeline
            .pause(timeout)
            .and_then(|()| self.target.relookup(self.pipeline.channel()));
        self.pipeline.resume();
        if let Err(e) = relooked {
            self.invalidate("relookup failed");
            return Err(e);
        }
        match size {
            Some((w, h)) if w > 0 && h > 0 && (w != self.mirror.width() || h != self.mirror.height()) => {
                self.resize(w, h);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Send a lone flush if nothing went out for a while.
    pub fn probe(&mut self) -> Result<bool, DrawError> {
        self.poll_remote_state();
        let interval = Duration::from_millis(self.config.probe_interval_ms);
        if self.last_send.elapsed() < interval {
            return Ok(false);
        }
        self.cmd.clear();
        command::flush(&mut self.cmd);
        let sent = self.pipeline.push(&self.cmd).and_then(|()| self.pipeline.end_frame());
        self.last_send = Instant::now();
        if let Err(e) = sent {
            self.invalidate("probe failed");
            return Err(e);
        }
        self.stats.probes += 1;
        debug!("liveness probe sent");
        Ok(true)
    }

    /// Serve frames from `handoff` until it shuts down or `running` clears.
    ///
    /// Transport errors are absorbed (the next frame is a full resend); only
    /// a closed channel ends the loop with an error.
    pub fn run(&mut self, handoff: &FrameHandoff, running: &AtomicBool) -> Result<(), DrawError> {
        info!(
            "frame orchestrator running ({}x{}, {} workers)",
            self.mirror.width(),
            self.mirror.height(),
            self.pool.workers()
        );
        let wait = Duration::from_millis(self.config.frame_wait_ms);
        while running.load(Ordering::SeqCst) {
            let result = match handoff.next(wait) {
                HandoffEvent::Shutdown => break,
                HandoffEvent::Timeout => self.probe().map(drop),
                HandoffEvent::GeometryChanged(size) => self.handle_geometry_change(size).map(|resized| {
                    if resized {
                        debug!("resized; waiting for a frame at the new size");
                    }
                }),
                HandoffEvent::Frame(pending) => {
                    let result = self.process_frame(&pending.frame, pending.damage.as_ref()).map(drop);
                    handoff.recycle(pending.frame);
                    result
                }
            };
            match result {
                Err(DrawError::ChannelClosed) => return Err(DrawError::ChannelClosed),
                Err(e) => warn!("recovering from: {e}"),
                Ok(()) => {}
            }
        }
        let timeout = Duration::from_millis(self.config.pause_timeout_ms);
        if let Err(e) = self.pipeline.flush().and_then(|()| self.pipeline.wait_idle(timeout)) {
            warn!("pipeline did not drain on shutdown: {e}");
        }
        info!("frame orchestrator stopped after {} frames", self.stats.frames);
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::draw::command::{Point, TAG_DRAW, TAG_FLUSH};
    use crate::flags::ErrorFlags;
    use std::sync::Mutex;

    /// Answers every write in full, immediately.
    #[derive(Default)]
    struct Loopback {
        writes: Mutex<Vec<Vec<u8>>>,
        pending: Mutex<std::collections::VecDeque<usize>>,
        flags: Mutex<ErrorFlags>,
    }

    impl DrawChannel for Loopback {
        fn write_pipelined(&self, bytes: &[u8]) -> Result<usize, DrawError> {
            self.writes.lock().unwrap().push(bytes.to_vec());
            self.pending.lock().unwrap().push_back(bytes.len());
            Ok(bytes.len())
        }
        fn receive_one_response(&self) -> Result<usize, DrawError> {
            self.pending
                .lock()
                .unwrap()
                .pop_front()
                .ok_or(DrawError::ProtocolViolation("no outstanding write"))
        }
        fn take_error_flags(&self) -> ErrorFlags {
            std::mem::take(&mut *self.flags.lock().unwrap())
        }
    }

    struct Screen;

    impl DisplayTarget for Screen {
        fn screen(&self) -> (u32, Point) {
            (0, Point::ZERO)
        }
        fn relookup(&mut self, _: &dyn DrawChannel) -> Result<(), DrawError> {
            Ok(())
        }
    }

    fn engine(w: u32, h: u32) -> (FrameOrchestrator, Arc<Loopback>) {
        let chan = Arc::new(Loopback::default());
        let config = OrchestratorConfig {
            workers: 2,
            ..Default::default()
        };
        let o = FrameOrchestrator::new(
            config,
            PipelineConfig::default(),
            chan.clone(),
            Box::new(Screen),
            w,
            h,
        )
        .unwrap();
        (o, chan)
    }

    #[test]
    fn first_frame_is_full_and_enables_delta_once_acknowledged() {
        let (mut o, _chan) = engine(48, 32);
        let r = o.process_frame(&Frame::new(48, 32), None).unwrap();
        assert!(r.full);
        assert_eq!(r.tiles(), 6);
        assert!(!o.delta_enabled());
        o.wait_idle(Duration::from_secs(5)).unwrap();
        assert!(o.delta_enabled());
    }

    #[test]
    fn footer_is_last_and_ends_with_flush() {
        let (mut o, chan) = engine(32, 32);
        o.process_frame(&Frame::new(32, 32), None).unwrap();
        o.wait_idle(Duration::from_secs(5)).unwrap();
        let bytes = chan.writes.lock().unwrap().concat();
        let n = bytes.len();
        assert_eq!(bytes[n - 1], TAG_FLUSH);
        assert_eq!(bytes[n - 1 - command::DRAW_LEN], TAG_DRAW);
    }

    #[test]
    fn error_flag_forces_full_resend() {
        let (mut o, chan) = engine(32, 32);
        let f = Frame::new(32, 32);
        o.process_frame(&f, None).unwrap();
        o.wait_idle(Duration::from_secs(5)).unwrap();
        assert_eq!(o.process_frame(&f, None).unwrap().tiles(), 0);

        *chan.flags.lock().unwrap() = ErrorFlags::SHORT_WRITE;
        let r = o.process_frame(&f, None).unwrap();
        assert!(r.full);
        assert_eq!(r.tiles(), 4);
        assert!(!o.delta_enabled());
        assert_eq!(o.stats().recoveries, 1);
    }

    #[test]
    fn damage_map_limits_comparison() {
        let (mut o, _chan) = engine(64, 64);
        let mut f = Frame::new(64, 64);
        o.process_frame(&f, None).unwrap();
        o.wait_idle(Duration::from_secs(5)).unwrap();

        f.set_pixel(40, 40, 0x00FF_0000);
        let grid = f.grid();
        let mut damage = DamageMap::clean(&grid);
        damage.mark(&grid, Rect::new(0, 0, 16, 16));
        // Only the damaged tile is considered, even though another changed.
        let r = o.process_frame(&f, Some(&damage)).unwrap();
        assert_eq!(r.tiles(), 1);
        assert!(o.mirror().tile_dirty(&f, grid.index(2, 2)));
    }

    #[test]
    fn resize_restarts_with_full_frame() {
        let (mut o, _chan) = engine(32, 32);
        o.process_frame(&Frame::new(32, 32), None).unwrap();
        o.wait_idle(Duration::from_secs(5)).unwrap();
        assert!(o.handle_geometry_change(Some((48, 48))).unwrap());
        assert!(o.full_frame_pending());
        let r = o.process_frame(&Frame::new(48, 48), None).unwrap();
        assert!(r.full);
        assert_eq!(r.tiles(), 9);
        assert!(!o.handle_geometry_change(None).unwrap());
    }

    #[test]
    fn probe_waits_for_idle_interval() {
        let (mut o, chan) = engine(32, 32);
        o.config.probe_interval_ms = 0;
        assert!(o.probe().unwrap());
        o.wait_idle(Duration::from_secs(5)).unwrap();
        assert_eq!(chan.writes.lock().unwrap().last().unwrap(), &vec![TAG_FLUSH]);

        o.config.probe_interval_ms = 60_000;
        assert!(!o.probe().unwrap());
    }
}
