//! Bridge service core logic.
//!
//! Wires a frame producer, the encoding engine and the TCP transport
//! together and runs them until stopped.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{info, warn};

use drawlink_core::draw::target::Border;
use drawlink_core::{DrawError, FrameHandoff, FrameOrchestrator, NamedWindow};

use crate::config::BridgeConfig;
use crate::producer::DocumentProducer;
use crate::tcp::TcpDrawChannel;

// ── BridgeService ────────────────────────────────────────────────

/// The top-level bridge service.
///
/// Owns the configuration and a running flag shared with the producer
/// thread and the orchestrator loop.
pub struct BridgeService {
    config: BridgeConfig,
    running: Arc<AtomicBool>,
}

impl BridgeService {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle that stops the service when cleared.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Build the display target described by the screen section.
    pub fn window(&self) -> NamedWindow {
        let screen = &self.config.screen;
        let window = NamedWindow::new(screen.window_name.clone(), screen.window_id);
        if screen.border_width > 0 {
            window.with_border(Border {
                image: screen.border_image,
                width: screen.border_width,
            })
        } else {
            window
        }
    }

    /// Run the service until stopped. Blocks the calling thread.
    ///
    /// 1. Connects to the draw device.
    /// 2. Binds the target window by name.
    /// 3. Starts the producer thread.
    /// 4. Runs the orchestrator loop until `running` clears.
    pub fn run(&self) -> Result<(), DrawError> {
        self.running.store(true, Ordering::SeqCst);
        let result = self.serve();
        self.running.store(false, Ordering::SeqCst);
        result
    }

    fn serve(&self) -> Result<(), DrawError> {
        let net = &self.config.network;
        let screen = &self.config.screen;

        let channel = TcpDrawChannel::connect(
            &net.remote,
            Duration::from_millis(net.connect_timeout_ms),
            Duration::from_millis(net.response_timeout_ms),
        )?
        .with_max_write(self.config.pipeline.max_write);

        let mut engine = FrameOrchestrator::new(
            self.config.to_orchestrator_config(),
            self.config.to_pipeline_config(),
            Arc::new(channel),
            Box::new(self.window()),
            screen.width,
            screen.height,
        )?;
        engine.handle_geometry_change(None)?;
        info!("bound window '{}'", screen.window_name);

        let (handoff, first) = FrameHandoff::new(screen.width, screen.height);
        let handoff = Arc::new(handoff);
        let producer = DocumentProducer::new(screen.scroll_step).spawn(
            Arc::clone(&handoff),
            first,
            screen.fps,
            Arc::clone(&self.running),
        )?;

        let result = engine.run(&handoff, &self.running);

        self.running.store(false, Ordering::SeqCst);
        handoff.shutdown();
        if producer.join().is_err() {
            warn!("producer thread panicked");
        }

        let stats = engine.stats();
        let link = engine.pipeline_stats();
        info!(
            "sent {} frames ({} full, {} scrolls, {} tiles), {} bytes in {} batches, {} recoveries",
            stats.frames,
            stats.full_frames,
            stats.scrolls,
            stats.tiles_raw + stats.tiles_direct + stats.tiles_delta,
            stats.bytes,
            link.batches_sent,
            stats.recoveries,
        );
        result
    }

    /// Signal the service to stop.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

// ── Tests ────────────────────────────────────────────────────────
