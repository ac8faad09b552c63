// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vatgate_server::{
    build_router, metadata_handler, validate_startup_config, AppState, CommandSource,
    ServerConfig,
};

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => {}
                    _ = sigint.recv() => {}
                }
            }
            _ => {
                warn!("signal handlers unavailable; falling back to ctrl-c");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

const USAGE: &str = "usage: vatgate-server [warm-exports [--capture] <path>...]";

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Serve,
    /// Render the given request paths against the newest bundle and write
    /// their static exports, then exit.
    WarmExports { capture: bool, targets: Vec<String> },
}

fn parse_command(mut args: impl Iterator<Item = String>) -> Result<Command, String> {
    match args.next().as_deref() {
        None => Ok(Command::Serve),
        Some("warm-exports") => {
            let mut capture = false;
            let mut targets = Vec::new();
            for arg in args {
                if arg == "--capture" {
                    capture = true;
                } else if arg.starts_with("--") {
                    return Err(format!("unknown flag {arg}\n{USAGE}"));
                } else {
                    targets.push(arg);
                }
            }
            if targets.is_empty() {
                return Err(format!("warm-exports needs at least one path\n{USAGE}"));
            }
            Ok(Command::WarmExports { capture, targets })
        }
        Some(other) => Err(format!("unknown command {other}\n{USAGE}")),
    }
}

fn api_routes() -> Router<AppState<CommandSource>> {
    Router::new().route("/api/metadata", get(metadata_handler))
}

async fn warm_exports(
    state: AppState<CommandSource>,
    capture: bool,
    targets: &[String],
) -> Result<(), String> {
    let version = if capture {
        state
            .lifecycle
            .capture_cycle()
            .await
            .map_err(|e| e.to_string())?
    } else {
        state
            .lifecycle
            .sync_to_newest()
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| "no complete snapshot bundle on disk; rerun with --capture".to_string())?
    };
    info!(version = %version, targets = targets.len(), "writing static exports");
    let app = api_routes().with_state(state.clone());
    let report = state
        .coordinator
        .warm_exports(&state.dataset, app, targets)
        .await;
    if report.is_complete() {
        Ok(())
    } else {
        Err(format!(
            "{} of {} static exports failed",
            report.failed.len(),
            targets.len()
        ))
    }
}

fn init_tracing(log_json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<(), String> {
    let command = parse_command(std::env::args().skip(1))?;
    let cfg = ServerConfig::from_env();
    init_tracing(cfg.log_json);
    validate_startup_config(&cfg)?;

    let capture_command = cfg
        .capture_command
        .as_deref()
        .ok_or_else(|| "VATGATE_CAPTURE_COMMAND is required".to_string())?;
    let source = CommandSource::from_command_line(capture_command, cfg.required_members.clone())
        .map_err(|e| e.to_string())?;
    for root in [
        &cfg.storage.snapshot_root,
        &cfg.storage.cache_root,
        &cfg.storage.export_root,
    ] {
        std::fs::create_dir_all(root)
            .map_err(|e| format!("create {}: {e}", root.display()))?;
    }

    let state = AppState::new(&cfg, Arc::new(source));
    if let Command::WarmExports { capture, targets } = command {
        return warm_exports(state, capture, &targets).await;
    }
    let app = build_router(state.clone(), api_routes());

    // The listener comes up first; requests get 503 until bootstrap publishes a dataset.
    let lifecycle = Arc::clone(&state.lifecycle);
    tokio::spawn(async move {
        match lifecycle.bootstrap().await {
            Ok(version) => info!(version = %version, "bootstrap complete"),
            Err(e) => error!("bootstrap failed: {e}"),
        }
        lifecycle.spawn_background_tasks();
    });

    let listener = TcpListener::bind(&cfg.bind_addr)
        .await
        .map_err(|e| format!("bind {} failed: {e}", cfg.bind_addr))?;
    info!(bind = %cfg.bind_addr, "vatgate-server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown_signal())
        .await
        .map_err(|e| format!("server failed: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Command, String> {
        parse_command(args.iter().map(ToString::to_string))
    }

    #[test]
    fn no_arguments_serves() {
        assert_eq!(parse(&[]), Ok(Command::Serve));
    }

    #[test]
    fn warm_exports_collects_paths_and_the_capture_flag() {
        assert_eq!(
            parse(&["warm-exports", "/api/a?x=1", "--capture", "/api/b"]),
            Ok(Command::WarmExports {
                capture: true,
                targets: vec!["/api/a?x=1".to_string(), "/api/b".to_string()],
            })
        );
        assert!(parse(&["warm-exports"]).is_err());
        assert!(parse(&["warm-exports", "--force", "/api/a"]).is_err());
        assert!(parse(&["serve-ish"]).is_err());
    }
}
