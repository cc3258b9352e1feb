//! The mcpbox gateway binary.
//!
//! Loads the configuration, wires up storage, the OAuth server, and the MCP
//! multiplexer, then serves HTTP until a signal asks it to stop.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use mcpbox_core::config::{AppConfig, AuthConfig, LogFormat, StorageConfig, DEFAULT_CONFIG_PATH};
use mcpbox_gateway::server::AuthMode;
use mcpbox_gateway::{build_router, Multiplexer, OAuthServer};
use mcpbox_storage::{MemoryStore, SqliteStore, StateStore, SWEEP_INTERVAL};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "mcpbox",
    about = "Gateway that multiplexes stdio MCP servers behind one authenticated HTTP endpoint"
)]
struct Cli {
    /// Path to the configuration file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Config path as a bare argument (kept for backward compatibility)
    #[arg(value_name = "CONFIG")]
    config_positional: Option<PathBuf>,

    /// Print version information
    #[arg(short = 'v', long = "version")]
    version: bool,
}

impl Cli {
    fn config_path(&self) -> PathBuf {
        self.config
            .clone()
            .or_else(|| self.config_positional.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }
}

fn main() {
    let cli = Cli::parse();

    if cli.version {
        println!("mcpbox {}", env!("CARGO_PKG_VERSION"));
        return;
    }

    let config = match AppConfig::load(&cli.config_path()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    init_logging(&config);
    install_panic_hook();

    let runtime = tokio::runtime::Runtime::new().expect("tokio runtime");
    if let Err(e) = runtime.block_on(run(config)) {
        error!(error = %format!("{e:#}"), "startup failed");
        std::process::exit(1);
    }
}

fn init_logging(config: &AppConfig) {
    let filter = EnvFilter::new(config.log.effective_level());
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.log.format {
        LogFormat::Pretty => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        error!("panic: {info}");
        std::process::exit(1);
    }));
}

async fn run(config: AppConfig) -> anyhow::Result<()> {
    let port = config.server.port;

    if let Ok(value) = serde_json::to_value(&config) {
        let echoed = if config.log.redact_secrets {
            mcpbox_core::redact::redact_json(&value)
        } else {
            value
        };
        tracing::debug!(config = %echoed, "configuration loaded");
    }

    // Storage first; everything auth-related hangs off it.
    let store: Arc<dyn StateStore> = match &config.storage {
        StorageConfig::Memory => Arc::new(MemoryStore::new()),
        StorageConfig::Sqlite(sqlite) => {
            Arc::new(SqliteStore::open(std::path::Path::new(&sqlite.path))?)
        }
    };
    spawn_store_sweeper(Arc::clone(&store));

    let (auth_mode, oauth) = match &config.auth {
        None => (AuthMode::None, None),
        Some(AuthConfig::Apikey(apikey)) => (AuthMode::ApiKey(apikey.api_key.clone()), None),
        Some(AuthConfig::Oauth(settings)) => {
            let server = OAuthServer::new(settings, port, Arc::clone(&store)).await?;
            server.spawn_expiry_task();
            (AuthMode::OAuth(Arc::clone(&server)), Some(server))
        }
    };

    let mux = Multiplexer::start(
        &config.mcp_servers,
        config.log.mcp_debug,
        config.log.redact_secrets,
    )
    .await;

    let router = build_router(Arc::clone(&mux), auth_mode, oauth);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, servers = mux.child_count(), "gateway listening");

    // Children close concurrently while the listener drains; the handle is
    // recovered afterwards so the process waits for both.
    let (children_tx, children_rx) = tokio::sync::oneshot::channel();
    let shutdown = {
        let mux = Arc::clone(&mux);
        async move {
            wait_for_signal().await;
            info!("shutdown signal received");
            tokio::spawn(async {
                wait_for_signal().await;
                error!("forcing exit");
                std::process::exit(1);
            });
            let _ = children_tx.send(tokio::spawn(async move { mux.shutdown().await }));
        }
    };

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;

    if let Ok(handle) = children_rx.await {
        let _ = handle.await;
    }
    store.close().await?;
    info!("shutdown complete");
    Ok(())
}

fn spawn_store_sweeper(store: Arc<dyn StateStore>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.tick().await; // first tick is immediate
        loop {
            ticker.tick().await;
            if let Err(e) = store.cleanup_expired().await {
                error!(error = %e, "store sweep failed");
            }
        }
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut terminate = signal(SignalKind::terminate()).expect("SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_path_precedence() {
        let cli = Cli {
            config: Some(PathBuf::from("/etc/mcpbox.json")),
            config_positional: Some(PathBuf::from("other.json")),
            version: false,
        };
        assert_eq!(cli.config_path(), PathBuf::from("/etc/mcpbox.json"));
    }

    #[test]
    fn test_positional_config_fallback() {
        let cli = Cli {
            config: None,
            config_positional: Some(PathBuf::from("other.json")),
            version: false,
        };
        assert_eq!(cli.config_path(), PathBuf::from("other.json"));
    }

    #[test]
    fn test_default_config_path() {
        let cli = Cli {
            config: None,
            config_positional: None,
            version: false,
        };
        assert_eq!(cli.config_path(), PathBuf::from(DEFAULT_CONFIG_PATH));
    }

    #[test]
    fn test_cli_parses_flags() {
        let cli = Cli::parse_from(["mcpbox", "-c", "conf.json"]);
        assert_eq!(cli.config_path(), PathBuf::from("conf.json"));
        let cli = Cli::parse_from(["mcpbox", "bare.json"]);
        assert_eq!(cli.config_path(), PathBuf::from("bare.json"));
    }
}
