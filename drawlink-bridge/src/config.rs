//! Configuration for the drawlink bridge.

use std::path::Path;

use serde::{Deserialize, Serialize};

use drawlink_core::draw::pipeline::MIN_WRITE;
use drawlink_core::{DepthPolicy, ImageIds, OrchestratorConfig, PipelineConfig, ScrollConfig};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Where the remote draw device lives.
    pub network: NetworkConfig,
    /// Frame source and display window.
    pub screen: ScreenConfig,
    /// Tile and scroll encoding.
    pub encoder: EncoderConfig,
    /// Write batching and pipelining.
    pub pipeline: PipelineSection,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address of the remote draw device.
    pub remote: String,
    /// Address the loopback sink listens on (`--sink`).
    pub sink_listen: String,
    /// TCP connect timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// How long to wait for one response before declaring the link dead.
    pub response_timeout_ms: u64,
}

/// Frame source and display configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScreenConfig {
    pub width: u32,
    pub height: u32,
    /// Frames per second the synthetic producer renders.
    pub fps: u32,
    /// Name the remote publishes the target window under.
    pub window_name: String,
    /// Image id the window is bound to.
    pub window_id: u32,
    /// Border drawn around the frame, in pixels (0 = none).
    pub border_width: u32,
    /// Image id of the border colour.
    pub border_image: u32,
    /// Pixels the synthetic document scrolls per frame.
    pub scroll_step: u32,
}

/// Encoder configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Allow alpha-delta tiles.
    pub tile_delta: bool,
    /// Detect scrolled regions.
    pub scroll_detection: bool,
    /// Largest scroll searched, in pixels.
    pub max_shift: u32,
    /// Worker threads (0 = half the logical cores).
    pub workers: usize,
    /// Idle time before a liveness probe, in milliseconds.
    pub probe_interval_ms: u64,
}

/// Pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSection {
    /// Largest single write in bytes.
    pub max_write: usize,
    /// "fixed" or "adaptive".
    pub depth_policy: String,
    /// Fixed depth, or the starting depth when adaptive.
    pub depth: usize,
    pub min_depth: usize,
    pub max_depth: usize,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            remote: "127.0.0.1:7440".into(),
            sink_listen: "127.0.0.1:7440".into(),
            connect_timeout_ms: 3_000,
            response_timeout_ms: 10_000,
        }
    }
}

impl Default for ScreenConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            fps: 30,
            window_name: "drawlink".into(),
            window_id: 16,
            border_width: 0,
            border_image: 17,
            scroll_step: 8,
        }
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            tile_delta: true,
            scroll_detection: true,
            max_shift: 64,
            workers: 0,
            probe_interval_ms: 2_000,
        }
    }
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            max_write: 64 * 1024,
            depth_policy: "fixed".into(),
            depth: 64,
            min_depth: 4,
            max_depth: 256,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".into() }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl BridgeConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Write the default configuration to a file (for bootstrapping).
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(&Self::default()).map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }

    /// Encoder settings for the orchestrator.
    pub fn to_orchestrator_config(&self) -> OrchestratorConfig {
        let frame_wait_ms = (1_000 / self.screen.fps.clamp(1, 240) as u64).max(10) * 4;
        OrchestratorConfig {
            tile_delta: self.encoder.tile_delta,
            scroll_detection: self.encoder.scroll_detection,
            scroll: ScrollConfig {
                max_shift: self.encoder.max_shift.clamp(1, 127),
            },
            workers: self.encoder.workers.min(drawlink_core::draw::pool::MAX_WORKERS),
            probe_interval_ms: self.encoder.probe_interval_ms.max(100),
            frame_wait_ms,
            pause_timeout_ms: self.network.response_timeout_ms,
            ids: ImageIds::default(),
        }
    }

    /// Batching settings for the pipeline.
    pub fn to_pipeline_config(&self) -> PipelineConfig {
        let p = &self.pipeline;
        let depth_policy = match p.depth_policy.as_str() {
            "adaptive" => {
                let min = p.min_depth.max(1);
                let max = p.max_depth.max(min);
                DepthPolicy::Adaptive {
                    initial: p.depth.clamp(min, max),
                    min,
                    max,
                }
            }
            other => {
                if other != "fixed" {
                    tracing::warn!("unknown depth policy '{other}'; using fixed");
                }
                DepthPolicy::Fixed { depth: p.depth.max(1) }
            }
        };
        PipelineConfig {
            max_write: p.max_write.max(MIN_WRITE),
            depth_policy,
            send_timeout_ms: self.network.response_timeout_ms.max(1),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let text = toml::to_string_pretty(&BridgeConfig::default()).unwrap();
        assert!(text.contains("[network]"));
        assert!(text.contains("max_write"));
        assert!(text.contains("window_name"));
    }

    #[test]
    fn roundtrip_config() {
        let text = toml::to_string_pretty(&BridgeConfig::default()).unwrap();
        let parsed: BridgeConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.network.remote, "127.0.0.1:7440");
        assert_eq!(parsed.screen.fps, 30);
        assert_eq!(parsed.pipeline.depth, 64);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let parsed: BridgeConfig = toml::from_str("[screen]\nwidth = 800\n").unwrap();
        assert_eq!(parsed.screen.width, 800);
        assert_eq!(parsed.screen.height, 720);
        assert_eq!(parsed.logging.level, "info");
    }

    #[test]
    fn pipeline_values_are_clamped() {
        let mut cfg = BridgeConfig::default();
        cfg.pipeline.max_write = 100;
        cfg.pipeline.depth = 0;
        let p = cfg.to_pipeline_config();
        assert_eq!(p.max_write, MIN_WRITE);
        assert_eq!(p.depth_policy, DepthPolicy::Fixed { depth: 1 });
        assert_eq!(p.send_timeout_ms, 10_000);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn adaptive_policy_is_ordered() {
        let mut cfg = BridgeConfig::default();
        cfg.pipeline.depth_policy = "adaptive".into();
        cfg.pipeline.min_depth = 16;
        cfg.pipeline.max_depth = 8;
        cfg.pipeline.depth = 100;
        assert_eq!(
            cfg.to_pipeline_config().depth_policy,
            DepthPolicy::Adaptive { initial: 16, min: 16, max: 16 }
        );
    }

    #[test]
    fn orchestrator_config_clamps() {
        let mut cfg = BridgeConfig::default();
        cfg.encoder.max_shift = 1_000;
        cfg.encoder.workers = 64;
        cfg.screen.fps = 0;
        let o = cfg.to_orchestrator_config();
        assert_eq!(o.scroll.max_shift, 127);
        assert_eq!(o.workers, 8);
        assert_eq!(o.frame_wait_ms, 4_000);
    }
}
