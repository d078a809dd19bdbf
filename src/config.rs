//! Configuration management

use std::{env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// Identity-provider configuration
    pub provider: ProviderConfig,
    /// Origin of the single-page front end (scheme + host [+ port])
    pub frontend_origin: String,
    /// Allow-list of guild ids the gateway will serve data about.
    /// Empty list means no guild is ever exposed (fail closed).
    pub allowed_guilds: Vec<String>,
    /// Optional shared-store connection string. Absence selects the
    /// in-process fallback stores.
    pub redis_url: Option<String>,
    /// Deployment environment, controls cookie scoping and HSTS
    pub environment: Environment,
    /// Session settings
    pub session: SessionConfig,
    /// Cache TTL settings
    pub cache: CacheTtlConfig,
    /// Login rate-limit settings
    pub rate_limit: RateLimitConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
        }
    }
}

/// Identity-provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Provider name, also the callback path segment
    pub name: String,
    /// OAuth2 client id (supports `${VAR}` expansion)
    pub client_id: String,
    /// OAuth2 client secret (supports `${VAR}` expansion)
    pub client_secret: String,
    /// Registered redirect URI for the callback endpoint
    pub redirect_uri: String,
    /// Base URL of the provider's REST API
    pub api_base: String,
    /// Authorization endpoint
    pub authorize_url: String,
    /// Token endpoint
    pub token_url: String,
    /// Scopes requested on login
    pub scopes: Vec<String>,
    /// Bot/service credential used for presence and role probes
    /// (supports `${VAR}` expansion)
    pub bot_token: String,
    /// Permission bitmask requested when constructing bot invite URLs
    pub invite_permissions: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            name: "discord".to_string(),
            client_id: String::new(),
            client_secret: String::new(),
            redirect_uri: String::new(),
            api_base: "https://discord.com/api/v10".to_string(),
            authorize_url: "https://discord.com/oauth2/authorize".to_string(),
            token_url: "https://discord.com/api/v10/oauth2/token".to_string(),
            scopes: vec!["identify".to_string(), "guilds".to_string()],
            bot_token: String::new(),
            invite_permissions: 277_025_770_496,
        }
    }
}

/// Deployment environment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Local development: cookies without Secure/Domain, no HSTS
    #[default]
    Development,
    /// Production: Secure cookies scoped to the origin host, HSTS on
    Production,
}

impl Environment {
    /// Whether this is a production deployment
    #[must_use]
    pub fn is_production(self) -> bool {
        matches!(self, Self::Production)
    }
}

/// Session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Absolute session lifetime, fixed at creation (not renewed on read)
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

/// Cache TTL settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheTtlConfig {
    /// Lifetime of an unconsumed OAuth state token
    #[serde(with = "humantime_serde")]
    pub state_ttl: Duration,
    /// Freshness window for cached "guilds for user" responses
    #[serde(with = "humantime_serde")]
    pub guilds_ttl: Duration,
    /// Freshness window for cached bot-presence probes
    #[serde(with = "humantime_serde")]
    pub presence_ttl: Duration,
}

impl Default for CacheTtlConfig {
    fn default() -> Self {
        Self {
            state_ttl: Duration::from_secs(600),
            guilds_ttl: Duration::from_secs(300),
            presence_ttl: Duration::from_secs(600),
        }
    }
}

/// Login rate-limit settings (fixed window per client address)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Window length
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// Maximum requests per window
    pub max_requests: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_requests: 40,
        }
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or fails validation. Missing provider credentials, redirect URI, or
    /// front-end origin are startup failures, not per-request errors.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("GUILD_GATEWAY_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();
        config.expand_env_vars();
        config.validate()?;

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Ok(home) = env::var("HOME") {
                    path_str.replacen('~', &home, 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in secret-bearing values
    fn expand_env_vars(&mut self) {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}").expect("static pattern");

        for value in [
            &mut self.provider.client_id,
            &mut self.provider.client_secret,
            &mut self.provider.bot_token,
        ] {
            *value = Self::expand_string(&re, value);
        }
        if let Some(url) = &self.redis_url {
            self.redis_url = Some(Self::expand_string(&re, url));
        }
    }

    /// Expand environment variables in a string
    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }

    /// Validate required settings. Called from `load`; startup stops here
    /// rather than failing every request later.
    pub fn validate(&self) -> Result<()> {
        if self.provider.client_id.is_empty() {
            return Err(Error::Config("provider.client_id is required".to_string()));
        }
        if self.provider.client_secret.is_empty() {
            return Err(Error::Config(
                "provider.client_secret is required".to_string(),
            ));
        }
        if self.provider.redirect_uri.is_empty() {
            return Err(Error::Config(
                "provider.redirect_uri is required".to_string(),
            ));
        }
        Url::parse(&self.provider.redirect_uri)
            .map_err(|e| Error::Config(format!("provider.redirect_uri is not a URL: {e}")))?;
        if self.frontend_origin.is_empty() {
            return Err(Error::Config("frontend_origin is required".to_string()));
        }
        self.origin_host()?;
        Ok(())
    }

    /// Host component of the configured front-end origin (used for cookie
    /// Domain scoping in production)
    pub fn origin_host(&self) -> Result<String> {
        let url = Url::parse(&self.frontend_origin)
            .map_err(|e| Error::Config(format!("frontend_origin is not a URL: {e}")))?;
        url.host_str()
            .map(ToString::to_string)
            .ok_or_else(|| Error::Config("frontend_origin has no host".to_string()))
    }
}
