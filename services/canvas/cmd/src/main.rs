//! Canvas collaboration server binary.
//!
//! Accepts whiteboard clients over TCP, negotiates protocol versions, assigns
//! session IDs and streams large payloads on request.

use canvas_session::{
    listen_tcp, AdapterEvent, AdapterRegistry, LoggingDispatcher, Server, ServerConfig,
    SettingsHandle,
};
use clap::Parser;
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::CanvasConfig;
use logging::CanvasLogFormatter;

/// Multi-client collaboration server
#[derive(Parser, Debug)]
#[command(name = "canvas", version, about = "Multi-client whiteboard collaboration server")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "canvas.yaml")]
    config: PathBuf,

    /// Listen address, e.g. 0.0.0.0:12345 (defaults to the configured port)
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Idle timeout, e.g. 2m (overrides the configuration)
    #[arg(long)]
    idle_timeout: Option<humantime::Duration>,

    /// Interval between connected-session reports, e.g. 30s
    #[arg(long)]
    status_interval: Option<humantime::Duration>,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("canvas={}", args.log_level).parse()?)
        .add_directive(format!("canvas_session={}", args.log_level).parse()?)
        .add_directive(format!("canvas_wire={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(true)
        .event_format(CanvasLogFormatter::new("canvas".to_string()))
        .init();

    info!("Starting canvas server v{}", env!("CARGO_PKG_VERSION"));

    let canvas_config = CanvasConfig::load_from_file(&args.config)?;

    let listen = args
        .listen
        .unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), canvas_config.port));
    let idle_timeout = args
        .idle_timeout
        .map(Duration::from)
        .unwrap_or_else(|| canvas_config.idle_timeout());
    let status_interval = args
        .status_interval
        .map(Duration::from)
        .unwrap_or_else(|| canvas_config.status_interval());

    let server_config = ServerConfig {
        idle_timeout,
        ..ServerConfig::default()
    };
    info!(
        "Server config: listen={}, idle_timeout={:?}, status_interval={:?}, max_frame_size={}",
        listen, server_config.idle_timeout, status_interval, canvas_config.max_frame_size
    );

    let registry = Arc::new(AdapterRegistry::with_max_frame_size(canvas_config.max_frame_size));
    let settings = Arc::new(SettingsHandle::new(canvas_config.server_settings()));
    let server = Arc::new(Server::new(
        server_config,
        registry.clone(),
        settings,
        Arc::new(LoggingDispatcher),
    ));

    // Lifecycle listener
    let mut events = registry.subscribe();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                AdapterEvent::Created {
                    connection,
                    session_id,
                    ..
                } => {
                    crate::component_info!(
                        "registry",
                        "Adapter created for {} (session {})",
                        connection,
                        session_id
                    );
                }
                AdapterEvent::Destroyed {
                    connection,
                    session_id,
                } => {
                    crate::component_info!(
                        "registry",
                        "Adapter destroyed for {} (session {:?})",
                        connection,
                        session_id
                    );
                }
            }
        }
    });

    let listener = listen_tcp(listen).await?;
    let mut serve_task = tokio::spawn(server.clone().serve(listener));

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to install SIGTERM handler: {}", e))?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("Failed to install SIGINT handler: {}", e))?;

    // A zero period would make the interval panic
    let mut status = tokio::time::interval(status_interval.max(Duration::from_secs(1)));
    // The first tick completes immediately
    status.tick().await;

    info!("Canvas server started. Waiting for clients...");

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM signal, shutting down");
                break;
            }

            _ = sigint.recv() => {
                info!("Received SIGINT signal, shutting down");
                break;
            }

            result = &mut serve_task => {
                match result {
                    Ok(Ok(())) => info!("Listener stopped"),
                    Ok(Err(e)) => error!("Listener failed: {:#}", e),
                    Err(e) => error!("Listener task panicked: {}", e),
                }
                break;
            }

            _ = status.tick() => {
                let sessions = server.sessions();
                crate::component_info!(
                    "status",
                    "{} connected session(s): {:?}",
                    sessions.len(),
                    sessions
                );
            }
        }
    }

    serve_task.abort();
    let open = registry.len();
    if open > 0 {
        crate::component_debug!("status", "Dropping {} open connection(s)", open);
    }
    info!("Canvas server stopped");

    Ok(())
}
