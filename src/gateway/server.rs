//! Gateway server

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

use super::router::{AppState, create_router};
use crate::config::Config;
use crate::{Error, Result};

/// The guild gateway server
pub struct GatewayServer {
    config: Config,
}

impl GatewayServer {
    /// Create a server from validated configuration
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run the server until a shutdown signal arrives
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        if self.config.provider.bot_token.is_empty() {
            warn!("provider.bot_token is empty - presence probes and guild overviews will fail");
        }
        if self.config.allowed_guilds.is_empty() {
            warn!("allowed_guilds is empty - no guild data will be served");
        }

        let host = self.config.server.host.clone();
        let port = self.config.server.port;
        let frontend_origin = self.config.frontend_origin.clone();
        let provider_name = self.config.provider.name.clone();
        let shared_store = self.config.redis_url.is_some();
        let guild_count = self.config.allowed_guilds.len();
        let production = self.config.environment.is_production();

        let state = AppState::build(self.config).await?;
        let app = create_router(state)?;

        let listener = TcpListener::bind(addr).await?;

        info!("============================================================");
        info!("GUILD GATEWAY v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %host, port = %port, "Listening");
        info!(provider = %provider_name, "Identity provider");
        info!(origin = %frontend_origin, "Front-end origin (CORS + redirects)");
        info!(guilds = guild_count, "Allow-listed guilds");
        if shared_store {
            info!("Store backend: shared (in-process fallback on failure)");
        } else {
            info!("Store backend: in-process (sessions lost on restart)");
        }
        if production {
            info!("Environment: production (Secure cookies, HSTS)");
        } else {
            info!("Environment: development");
        }
        info!("============================================================");

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| Error::Internal(e.to_string()))?;

        Ok(())
    }
}

/// Shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
