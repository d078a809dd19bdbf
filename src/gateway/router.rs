//! HTTP router and shared application state

use std::sync::Arc;

use axum::http::{HeaderValue, Method, header};
use axum::routing::{get, post};
use axum::{Router, middleware};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::handlers;
use super::headers::{self, SecurityHeaders};
use crate::auth::CookieCodec;
use crate::config::Config;
use crate::guilds::GuildDirectory;
use crate::provider::{ProviderApi, ProviderClient};
use crate::store::Stores;
use crate::{Error, Result};

/// Shared application state
pub struct AppState {
    /// Gateway configuration
    pub config: Config,
    /// Identity-provider client
    pub provider: Arc<dyn ProviderApi>,
    /// Pluggable stores (state, sessions, rate limits, records)
    pub stores: Stores,
    /// Allow-listed guild directory with upstream caches
    pub guilds: GuildDirectory,
    /// Cookie builder with environment-aware attributes
    pub cookies: CookieCodec,
    /// Process start time, reported by the status endpoint
    pub started_at: chrono::DateTime<chrono::Utc>,
}

impl AppState {
    /// Connect the configured store backend and assemble the state
    pub async fn build(config: Config) -> Result<Arc<Self>> {
        let stores = Stores::connect(&config).await?;
        Self::assemble(config, stores)
    }

    /// Assemble state around pre-built stores
    pub fn assemble(config: Config, stores: Stores) -> Result<Arc<Self>> {
        let provider = Arc::new(ProviderClient::new(config.provider.clone()));
        Self::assemble_with_provider(config, stores, provider)
    }

    /// Assemble state around pre-built stores and an explicit provider
    /// implementation
    pub fn assemble_with_provider(
        config: Config,
        stores: Stores,
        provider: Arc<dyn ProviderApi>,
    ) -> Result<Arc<Self>> {
        let cookies = CookieCodec::from_config(&config)?;
        let guilds = GuildDirectory::new(Arc::clone(&provider), &config);
        Ok(Arc::new(Self {
            config,
            provider,
            stores,
            guilds,
            cookies,
            started_at: chrono::Utc::now(),
        }))
    }
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Result<Router> {
    let origin: HeaderValue = state
        .config
        .frontend_origin
        .parse()
        .map_err(|_| Error::Config("frontend_origin is not a valid origin".to_string()))?;

    // Credentialed CORS pinned to the single configured front-end origin.
    // The layer also answers OPTIONS preflights before they reach handlers.
    let cors = CorsLayer::new()
        .allow_origin(origin)
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    let api = Router::new()
        .route("/api/auth/login", get(handlers::login))
        .route("/api/auth/logout", post(handlers::logout))
        .route("/api/me", get(handlers::me))
        .route("/api/status", get(handlers::status))
        .route("/api/guilds", get(handlers::list_guilds))
        .route("/api/guilds/{guild_id}/me", get(handlers::guild_me))
        .route(
            "/api/guilds/{guild_id}/overview",
            get(handlers::guild_overview),
        )
        .route(
            "/api/guilds/{guild_id}/consent",
            get(handlers::get_consent).post(handlers::set_consent),
        )
        .route(
            "/api/users/me/profile",
            get(handlers::get_profile).post(handlers::set_profile),
        )
        .layer(cors);

    // The callback is a top-level navigation from the provider, not a
    // cross-origin XHR, so it stays outside the CORS layer.
    let callback = Router::new().route(
        "/api/auth/callback/{provider}",
        get(handlers::callback),
    );

    Ok(api
        .merge(callback)
        .layer(middleware::from_fn_with_state(
            SecurityHeaders::from_config(&state.config),
            headers::apply,
        ))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state))
}
