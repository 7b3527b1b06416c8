//! drawlink bridge entry point.
//!
//! ```text
//! drawlink-bridge                  Stream frames to the configured remote
//! drawlink-bridge --sink           Run a loopback draw device instead
//! drawlink-bridge --config <path>  Load a custom config TOML
//! drawlink-bridge --gen-config     Write default config to stdout
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use drawlink_bridge::config::BridgeConfig;
use drawlink_bridge::service::BridgeService;
use drawlink_bridge::sink::{self, SinkStats};

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "drawlink-bridge", about = "Stream rendered frames to a remote draw device")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "drawlink-bridge.toml")]
    config: PathBuf,

    /// Run as a loopback draw device on `network.sink_listen`.
    #[arg(long)]
    sink: bool,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        let text = toml::to_string_pretty(&BridgeConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let config = BridgeConfig::load(&cli.config);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("drawlink-bridge v{}", env!("CARGO_PKG_VERSION"));

    if cli.sink {
        return run_sink(&config).await;
    }

    info!("remote: {}", config.network.remote);
    info!(
        "screen: {}x{} @ {} fps, window '{}'",
        config.screen.width, config.screen.height, config.screen.fps, config.screen.window_name
    );

    let service = BridgeService::new(config);
    let stop = service.stop_handle();

    // Ctrl-C handler.
    let stop_clone = Arc::clone(&stop);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
        stop_clone.store(false, Ordering::SeqCst);
    });

    // The engine is thread-based; keep it off the async workers.
    match tokio::task::spawn_blocking(move || service.run()).await? {
        Ok(()) => Ok(()),
        Err(e) => {
            error!("bridge failed: {e}");
            Err(e.into())
        }
    }
}

async fn run_sink(config: &BridgeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let listener = tokio::net::TcpListener::bind(&config.network.sink_listen).await?;
    let ids = config.to_orchestrator_config().ids;
    let mut preallocated = vec![ids.back, ids.delta, ids.opaque];
    if config.screen.border_width > 0 {
        preallocated.push(config.screen.border_image);
    }

    let stats = Arc::new(SinkStats::default());
    let running = Arc::new(AtomicBool::new(true));

    let stop = Arc::clone(&running);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
        stop.store(false, Ordering::SeqCst);
    });

    sink::serve(listener, preallocated, Arc::clone(&stats), running).await?;
    info!(
        "sink handled {} writes ({} bytes, {} flushes, {} rejected)",
        stats.writes.load(Ordering::Relaxed),
        stats.bytes.load(Ordering::Relaxed),
        stats.flushes.load(Ordering::Relaxed),
        stats.rejected.load(Ordering::Relaxed),
    );
    Ok(())
}
