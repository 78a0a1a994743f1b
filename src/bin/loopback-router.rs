//! Loopback Router daemon
//!
//! Runs the routing engine against the local sound server and takes line
//! commands on stdin. Optionally serves the HTTP control surface.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use loopback_router::{
    config::AppConfig,
    gateway::PactlGateway,
    intent::Intent,
    protocol::{Direction, Route, RouteConfig, RouteKey, TopologyView},
    EngineHandle, RoutingEngine,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Loopback Router");

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = AppConfig::load(config_path.as_deref()).context("Failed to load configuration")?;

    let gateway = Arc::new(PactlGateway::new(config.gateway.clone()));
    let engine = Arc::new(RoutingEngine::start(&config, gateway));

    let (ui_shutdown, ui_shutdown_rx) = watch::channel(false);
    let ui_task = start_ui(&config, engine.clone(), ui_shutdown_rx);

    println!("Commands: list | link <source> <sink> [latency_ms] | unlink <source> <sink>");
    println!("          volume <source> <sink> <percent> | mute|unmute <source> <sink>");
    println!("          unlink-source <source> | refresh | pause | resume");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received Ctrl+C");
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => handle_line(&engine, &line),
                Ok(None) => {
                    // stdin closed: keep routing until interrupted
                    tokio::signal::ctrl_c().await?;
                    break;
                }
                Err(e) => {
                    tracing::error!("Failed to read stdin: {}", e);
                    break;
                }
            }
        }
    }

    ui_shutdown.send_replace(true);
    if let Some(task) = ui_task {
        let _ = task.await;
    }
    engine.shutdown().await;

    tracing::info!("Shutdown complete");
    Ok(())
}

#[cfg(feature = "ui")]
fn start_ui(
    config: &AppConfig,
    engine: Arc<EngineHandle>,
    shutdown: watch::Receiver<bool>,
) -> Option<tokio::task::JoinHandle<()>> {
    if !config.ui.enabled {
        return None;
    }
    let server = loopback_router::ui::WebServer::new(config.ui.clone(), engine);
    Some(server.start_background(shutdown))
}

#[cfg(not(feature = "ui"))]
fn start_ui(
    config: &AppConfig,
    _engine: Arc<EngineHandle>,
    _shutdown: watch::Receiver<bool>,
) -> Option<tokio::task::JoinHandle<()>> {
    if config.ui.enabled {
        tracing::warn!("Control surface requested but built without the `ui` feature");
    }
    None
}

/// A parsed stdin command
#[derive(Debug, PartialEq, Eq)]
enum Command {
    List,
    Link {
        source: String,
        sink: String,
        latency_ms: Option<u32>,
    },
    Unlink(RouteKey),
    Volume(RouteKey, u16),
    Mute(RouteKey, bool),
    UnlinkSource(String),
    Refresh,
    Pause,
    Resume,
}

fn parse_command(line: &str) -> std::result::Result<Command, String> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let key = |words: &[&str]| match words {
        [source, sink] => Ok(RouteKey::new(*source, *sink)),
        _ => Err("expected <source> <sink>".to_string()),
    };

    match words.as_slice() {
        ["list"] => Ok(Command::List),
        ["link", source, sink] => Ok(Command::Link {
            source: source.to_string(),
            sink: sink.to_string(),
            latency_ms: None,
        }),
        ["link", source, sink, latency] => Ok(Command::Link {
            source: source.to_string(),
            sink: sink.to_string(),
            latency_ms: Some(
                latency
                    .parse()
                    .map_err(|_| format!("invalid latency: {}", latency))?,
            ),
        }),
        ["unlink", rest @ ..] => key(rest).map(Command::Unlink),
        ["volume", source, sink, percent] => {
            let percent = percent.trim_end_matches('%');
            let percent = percent
                .parse()
                .map_err(|_| format!("invalid volume: {}", percent))?;
            Ok(Command::Volume(RouteKey::new(*source, *sink), percent))
        }
        ["mute", rest @ ..] => key(rest).map(|k| Command::Mute(k, true)),
        ["unmute", rest @ ..] => key(rest).map(|k| Command::Mute(k, false)),
        ["unlink-source", source] => Ok(Command::UnlinkSource(source.to_string())),
        ["refresh"] => Ok(Command::Refresh),
        ["pause"] => Ok(Command::Pause),
        ["resume"] => Ok(Command::Resume),
        [] => Err("empty command".to_string()),
        [other, ..] => Err(format!("unknown command or arguments: {}", other)),
    }
}

fn handle_line(engine: &EngineHandle, line: &str) {
    if line.trim().is_empty() {
        return;
    }
    let command = match parse_command(line) {
        Ok(command) => command,
        Err(e) => {
            println!("error: {}", e);
            return;
        }
    };

    let intent = match command {
        Command::List => {
            print_view(&engine.view());
            return;
        }
        Command::Refresh => {
            engine.refresh();
            return;
        }
        Command::Pause => {
            engine.pause_polling();
            return;
        }
        Command::Resume => {
            engine.resume_polling();
            return;
        }
        Command::Link {
            source,
            sink,
            latency_ms,
        } => Intent::AddRoute(Route::new(source, sink, engine.route_config(latency_ms))),
        Command::Unlink(key) => Intent::RemoveRoute(key),
        Command::UnlinkSource(source) => Intent::RemoveAllFrom { source },
        Command::Volume(key, volume_percent) => match engine.desired().get(&key) {
            Some(route) => Intent::SetConfig {
                config: RouteConfig {
                    volume_percent,
                    ..route.config
                },
                key,
            },
            None => {
                println!("error: {} is not linked", key);
                return;
            }
        },
        Command::Mute(key, muted) => match engine.desired().get(&key) {
            Some(route) => Intent::SetConfig {
                config: RouteConfig {
                    muted,
                    ..route.config
                },
                key,
            },
            None => {
                println!("error: {} is not linked", key);
                return;
            }
        },
    };

    match engine.submit(intent) {
        Ok(outcome) => {
            if let Some(warning) = outcome.warning {
                println!("warning: {}", warning);
            }
            if !outcome.changed {
                println!("nothing to change");
            }
        }
        Err(e) => println!("error: {}", e),
    }
}

fn print_view(view: &TopologyView) {
    let connection = if view.connected { "connected" } else { "disconnected" };
    println!("\n=== Sound server: {} ===", connection);
    if let Some(error) = &view.last_error {
        println!("  last error: {}", error);
    }

    for direction in [Direction::Source, Direction::Sink] {
        println!("\n=== {:?}s ===", direction);
        for endpoint in view.snapshot.endpoints.iter().filter(|e| e.direction == direction) {
            println!("  {} [{}]", endpoint.id, endpoint.index);
            if endpoint.name != endpoint.id {
                println!("    {}", endpoint.name);
            }
        }
    }

    println!("\n=== Routes (desired version {}) ===", view.desired_version);
    for status in &view.routes {
        let config = status.desired.or(status.observed).unwrap_or_default();
        let handle = status
            .handle
            .map_or_else(|| "-".to_string(), |h| h.to_string());
        println!(
            "  {}  {:?}  {}ms {}%{}  module {}",
            status.key,
            status.state,
            config.latency_ms,
            config.volume_percent,
            if config.muted { " muted" } else { "" },
            handle
        );
        if status.unsatisfiable {
            println!("    unsatisfiable");
        }
        if let Some(error) = &status.last_error {
            println!("    last error: {} (attempts: {})", error, status.attempts);
        }
    }
    println!();
}
