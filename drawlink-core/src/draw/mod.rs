//! # draw: frame encoding for a remote draw device
//!
//! Turns a sequence of rendered frames into a minimal stream of draw
//! commands, written pipelined over an ordered request/response channel.
//!
//! ## Architecture
//!
//! ```text
//! producer ──► FrameHandoff ──► FrameOrchestrator
//!                                 │  ScrollDetector ─┐
//!                                 │  tile codec ─────┼─► WorkerPool
//!                                 │  Mirror          │
//!                                 ▼                  │
//!                          TransmissionPipeline ◄────┘
//!                                 │ write_pipelined     ▲ receive_one_response
//!                                 ▼                     │ (drain thread)
//!                              DrawChannel ─────────────┘
//! ```
//!
//! ## Sub-modules
//!
//! | Module         | Purpose                                               |
//! |----------------|-------------------------------------------------------|
//! | `types`        | Frames, tile grid, borrowed tile views, damage maps    |
//! | `codec`        | Solid / direct / alpha-delta tile compression          |
//! | `command`      | Little-endian draw command encoders                    |
//! | `mirror`       | Record of the remote back image, with tile validity    |
//! | `pool`         | Fixed worker pool with per-thread scratch              |
//! | `scratch`      | The per-worker scratch the engine uses                 |
//! | `scroll`       | Phase-correlation scroll detection, cost-verified      |
//! | `channel`      | The wire boundary trait                                |
//! | `estimator`    | Throughput and round-trip estimation                   |
//! | `pipeline`     | Bounded batches, pipelined writes, response draining   |
//! | `handoff`      | Triple-buffered producer handoff                       |
//! | `target`       | Screen image placement and relookup                    |
//! | `orchestrator` | The per-frame loop                                     |

pub mod channel;
pub mod codec;
pub mod command;
pub mod estimator;
pub mod handoff;
pub mod mirror;
pub mod orchestrator;
pub mod pipeline;
pub mod pool;
pub mod scratch;
pub mod scroll;
pub mod target;
pub mod types;

// ── Re-exports ───────────────────────────────────────────────────

pub use channel::DrawChannel;
pub use codec::{CompressedTile, MatchFinder};
pub use command::{ImageIds, Point};
pub use estimator::LinkEstimator;
pub use handoff::{FrameHandoff, HandoffEvent, PendingFrame};
pub use mirror::Mirror;
pub use orchestrator::{EncoderStats, FrameOrchestrator, FrameReport, OrchestratorConfig};
pub use pipeline::{DepthPolicy, PipelineConfig, PipelineStats, TransmissionPipeline};
pub use pool::WorkerPool;
pub use scratch::{DrawPool, WorkerScratch};
pub use scroll::{ScrollConfig, ScrollDetector, ScrollRegion};
pub use target::{Border, DisplayTarget, NamedWindow};
pub use types::{DamageMap, Frame, Rect, TILE_SIZE, TileGrid, TileView};
