//! # drawlink-core
//!
//! Encoding and transmission engine for a remote display bridge.
//!
//! This crate contains:
//! - **Tile codec**: solid, LZ77-style and alpha-delta tile compression
//! - **Scroll detection**: FFT phase correlation with cost verification
//! - **Worker pool**: persistent threads with per-thread scratch state
//! - **Transmission**: batched, pipelined writes with a response drainer
//! - **Orchestration**: the per-frame loop and the previous-frame mirror
//! - **Error**: `DrawError`, a typed, `thiserror`-based error hierarchy

pub mod draw;
pub mod error;
pub mod flags;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use draw::{
    DamageMap, DepthPolicy, DisplayTarget, DrawChannel, Frame, FrameHandoff, FrameOrchestrator,
    FrameReport, HandoffEvent, ImageIds, NamedWindow, OrchestratorConfig, PipelineConfig, Rect,
    ScrollConfig,
};
pub use error::DrawError;
pub use flags::ErrorFlags;
