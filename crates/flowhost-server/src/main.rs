//! flowhost server binary.
//!
//! Configuration comes from the environment:
//! - `FLOWHOST_BIND` - listen address (default `127.0.0.1:8765`)
//! - `FLOWHOST_MAX_CONNECTIONS` - admission cap
//! - `FLOWHOST_WORKSPACE` - workspace directory for flows and staging
//! - `FLOWHOST_RUNNER_CMD` - interpreter command for flow programs

use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context as _;
use flowhost_core::{ErrorCounters, ServerConfig};
use flowhost_registry::SessionRegistry;
use flowhost_runner::{SubprocessRunnerFactory, WorkspaceFileHandler};
use flowhost_transport::ConnectionServer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn config_from_env() -> anyhow::Result<ServerConfig> {
    let mut config = ServerConfig::default();
    if let Ok(bind) = std::env::var("FLOWHOST_BIND") {
        config.bind_addr = bind;
    }
    if let Ok(max) = std::env::var("FLOWHOST_MAX_CONNECTIONS") {
        config.max_connections = max
            .parse()
            .context("FLOWHOST_MAX_CONNECTIONS must be a number")?;
    }
    if let Ok(dir) = std::env::var("FLOWHOST_WORKSPACE") {
        config.workspace_dir = PathBuf::from(dir);
    }
    if let Ok(cmd) = std::env::var("FLOWHOST_RUNNER_CMD") {
        config.runner_command = cmd;
    }
    if let Ok(secs) = std::env::var("FLOWHOST_SESSION_MAX_AGE_SECS") {
        config.session_max_age = Duration::from_secs(
            secs.parse()
                .context("FLOWHOST_SESSION_MAX_AGE_SECS must be a number")?,
        );
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = config_from_env()?;

    let errors = Arc::new(ErrorCounters::new());
    let registry = Arc::new(SessionRegistry::new(Arc::clone(&errors)));
    let _sweeper = registry.spawn_sweeper(config.sweep_interval, config.session_max_age);

    let runner_factory = Arc::new(SubprocessRunnerFactory::new(config.clone()));
    let file_handler = Arc::new(WorkspaceFileHandler::new(config.workspace_dir.clone()));

    let server = ConnectionServer::new(
        config.clone(),
        registry,
        errors,
        runner_factory,
        file_handler,
    );
    let app = server.router();

    let addr: SocketAddr = config
        .bind_addr
        .parse()
        .with_context(|| format!("invalid bind address {}", config.bind_addr))?;
    tracing::info!(%addr, max_connections = config.max_connections, "flowhost listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("server error")?;

    Ok(())
}
