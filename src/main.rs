//! mx-serve entry point.
//!
//! Bootstraps logging (stderr), loads configuration from the optional
//! `--config <path>` file plus the environment, and serves line-framed
//! JSON-RPC 2.0 over stdio until stdin closes or a shutdown request
//! arrives.

use std::path::PathBuf;
use std::sync::Arc;

use mx_serve::engine::UnconfiguredProvider;
use mx_serve::ipc::run_stdio;
use mx_serve::telemetry::{init_logging, LogConfig, LogFormat};
use mx_serve::{config, Runtime};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let log_config = LogConfig {
        format: match std::env::var("MX_SERVE_LOG_FORMAT").as_deref() {
            Ok("compact") => LogFormat::Compact,
            _ => LogFormat::Json,
        },
        level: std::env::var("MX_SERVE_LOG").unwrap_or_else(|_| "info".to_string()),
    };
    init_logging(&log_config)?;

    let config_path = parse_config_arg();
    let runtime_config = config::load(config_path.as_deref())?;
    tracing::info!(
        scheduler_enabled = runtime_config.scheduler.enabled,
        batch_size = runtime_config.scheduler.max_batch_size,
        max_buffer = runtime_config.bridge.max_buffer_size,
        "mx-serve starting"
    );

    // The tensor backend is linked by the embedder; a bare binary serves
    // the protocol surface and rejects loads.
    let (runtime, line_rx) = Runtime::new(runtime_config, Arc::new(UnconfiguredProvider));
    runtime.start().await;

    tokio::select! {
        result = run_stdio(runtime.clone(), line_rx) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received, shutting down");
            runtime.shutdown().await;
        }
    }

    Ok(())
}

fn parse_config_arg() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(PathBuf::from(path));
        }
    }
    None
}
