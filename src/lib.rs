//! Guild Gateway Library
//!
//! Web authorization gateway for the community bot dashboard.
//!
//! # Features
//!
//! - **OAuth2 + PKCE**: Authorization-Code-with-PKCE login against the chat
//!   platform's identity provider, CSRF-safe double-submit state checking
//! - **Opaque sessions**: server-side session records behind an unguessable
//!   cookie id, 7-day absolute expiry
//! - **Pluggable stores**: shared durable backend (Redis) with transparent
//!   in-process fallback, selected once at startup
//! - **Stale-on-error caching**: guild lists and bot-presence probes served
//!   from cache when the provider is down or rate-limited
//! - **Allow-list filtering**: only operator-configured guilds are ever exposed

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod guilds;
pub mod provider;
pub mod store;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
