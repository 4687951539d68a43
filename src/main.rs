#![forbid(unsafe_code)]

//! `sandbox-controller`: session API server binary.
//!
//! Loads configuration, restores persisted sessions, and serves the
//! session HTTP API until Ctrl-C or SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use sandbox_controller::clock::SystemClock;
use sandbox_controller::config::GlobalConfig;
use sandbox_controller::events::JsonlEventWriter;
use sandbox_controller::http::{self, AppState};
use sandbox_controller::orchestrator::{
    ControllerContext, ControllerRegistry, ControllerSettings,
};
use sandbox_controller::persistence::db;
use sandbox_controller::persistence::session_repo::SessionRepo;
use sandbox_controller::sandbox::http_backend::HttpSandboxBackend;
use sandbox_controller::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "sandbox-controller", about = "Sandbox session controller", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the configured HTTP port.
    #[arg(long)]
    port: Option<u16>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("sandbox-controller bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = GlobalConfig::load_from_path(&args.config)?;
    if let Some(port) = args.port {
        config.http_port = port;
    }
    info!("configuration loaded");

    // ── Initialize database ─────────────────────────────
    let db = Arc::new(db::connect(&config.db_path).await?);
    info!(path = %config.db_path.display(), "database connected");

    // ── Build controller context ────────────────────────
    let sandbox = HttpSandboxBackend::new(
        &config.sandbox.provider_url,
        config.sandbox_request_timeout(),
    )?;
    let events = JsonlEventWriter::new(config.event_log_dir.clone())?;
    let ctx = Arc::new(ControllerContext {
        repo: SessionRepo::new(db),
        sandbox: Arc::new(sandbox),
        events: Arc::new(events),
        clock: Arc::new(SystemClock),
        settings: ControllerSettings::from_config(&config),
    });

    // ── Restore persisted sessions before serving ───────
    let registry = Arc::new(ControllerRegistry::new(ctx));
    registry.recover().await?;

    let state = Arc::new(AppState {
        registry: Arc::clone(&registry),
        identity: config.identity.clone(),
    });

    // ── Serve ───────────────────────────────────────────
    let ct = CancellationToken::new();
    let server_ct = ct.clone();
    let addr = config.http_addr();
    let mut server = tokio::spawn(async move { http::serve(state, addr, server_ct).await });

    let exited_early = tokio::select! {
        () = shutdown_signal() => {
            info!("shutdown signal received");
            None
        }
        joined = &mut server => Some(joined),
    };
    ct.cancel();

    let joined = match exited_early {
        Some(joined) => joined,
        None => server.await,
    };
    match joined {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!(%err, "http server failed"),
        Err(err) => error!(%err, "http server task panicked"),
    }

    // Open relays are closed; persisted status is left as-is.
    registry.shutdown().await;
    info!("sandbox-controller shut down");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
