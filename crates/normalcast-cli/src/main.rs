//! `normalcast` – runs the Normal Augmenter behind a WebSocket bridge.
//!
//! 1. Initialises logging (and OTLP export when configured).
//! 2. Loads `normalcast.toml` (path from the first argument or
//!    `NORMALCAST_CONFIG`).
//! 3. Initialises the augmenter; exits non-zero if that fails.
//! 4. Serves the bridge and spins the augmenter until Ctrl-C or SIGTERM.

mod config;

use std::process::ExitCode;
use std::sync::Arc;

use tokio::sync::Notify;
use tracing::{error, info, warn};

use normalcast_middleware::{EventBus, WsBridge};
use normalcast_node::augmenter::{INPUT_TOPIC, OUTPUT_TOPIC};
use normalcast_node::{NodeContext, NormalAugmenter, init_tracing};
use normalcast_types::NormalsError;

fn main() -> ExitCode {
    // Held until exit so pending spans are flushed.
    let _telemetry = init_tracing("normalcast");

    let path = config::config_path(std::env::args().nth(1));
    let cfg = match config::load(&path) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(path = %path.display(), error = %e, "config error");
            return ExitCode::FAILURE;
        }
    };
    info!(path = %path.display(), namespace = %cfg.node.namespace, "configuration loaded");

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start async runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cfg)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "normalcast stopped");
            ExitCode::FAILURE
        }
    }
}

async fn run(cfg: config::Config) -> Result<(), NormalsError> {
    let bus = EventBus::new();
    let ctx = NodeContext::new(&cfg.node.namespace, bus.clone(), cfg.parameter_store());

    let mut augmenter = NormalAugmenter::initialize(&ctx)?;
    let bridge = WsBridge::new(bus, ctx.namespace(), INPUT_TOPIC, OUTPUT_TOPIC)?;

    // ── Ctrl-C / SIGTERM ──────────────────────────────────────────────────
    let shutdown = Arc::new(Notify::new());
    let shutdown_signal = Arc::clone(&shutdown);
    if let Err(e) = ctrlc::set_handler(move || shutdown_signal.notify_one()) {
        warn!(error = %e, "Failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available");
    }

    let node = augmenter.name().to_string();
    let listen_addr = cfg.bridge.listen_addr;
    tokio::select! {
        res = bridge.run(listen_addr) => res,
        res = augmenter.spin() => res,
        _ = shutdown.notified() => {
            info!(node = %node, "shutdown requested");
            Ok(())
        }
    }
}
