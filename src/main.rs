//! Highscore Relay Server
//!
//! Stores a single high-score record in a key-value document store over
//! plain HTTP routes, and relays chat/echo frames between WebSocket clients
//! on the same port.

mod config;
mod relay;
mod server;
mod store;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use config::{DatabaseSettings, Settings};
use relay::OriginPolicy;
use server::{Server, ServerConfig};
use store::{MemoryStore, RemoteStore, ScoreStore};

/// Highscore Relay Server
///
/// High-score store facade and WebSocket chat relay
#[derive(Parser, Debug)]
#[command(name = "highscore-relay")]
#[command(version, about, long_about = None)]
struct Args {
    /// Settings file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on (overrides the settings file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address (overrides the settings file)
    #[arg(long)]
    bind: Option<String>,

    /// Realtime database URL; the in-memory store is used when unset
    #[arg(long)]
    database_url: Option<String>,

    /// Auth token for the realtime database
    #[arg(long, requires = "database_url")]
    database_auth: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    /// Apply command line overrides on top of file settings
    fn apply(self, mut settings: Settings) -> Settings {
        if let Some(port) = self.port {
            settings.port = port;
        }
        if let Some(bind) = self.bind {
            settings.bind = bind;
        }
        if let Some(url) = self.database_url {
            settings.database = Some(DatabaseSettings {
                url,
                auth: self.database_auth,
            });
        }
        settings
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging; RUST_LOG takes precedence over --verbose
    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    info!("Highscore Relay v{}", env!("CARGO_PKG_VERSION"));

    let settings = Settings::load_or_default(args.config.as_deref())?;
    let settings = args.apply(settings);

    if !settings.allowed_origins.is_empty() {
        info!(
            "Relay admits {} configured origins",
            settings.allowed_origins.len()
        );
    }

    let store: Arc<dyn ScoreStore> = match &settings.database {
        Some(database) => {
            info!("Using remote score store at {}", database.url);
            Arc::new(RemoteStore::new(database))
        }
        None => {
            info!("Using in-memory score store");
            Arc::new(MemoryStore::new())
        }
    };

    let config = ServerConfig::new(settings.bind, settings.port).with_origin_policy(
        OriginPolicy::from_allowed_origins(&settings.allowed_origins),
    );

    let server = Arc::new(Server::bind(config, store).await?);
    let server_handle = Arc::clone(&server);

    // Spawn shutdown signal handler
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Initiating graceful shutdown...");
        server_handle.shutdown();
    });

    server.run().await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
