//! Cookie codec
//!
//! Builds and reads the two cookies the gateway owns: the long-lived
//! `session` cookie and the short-lived `oauth_state` cookie used across the
//! login-to-callback hop. Security attributes depend on the deployment
//! environment: production adds `Secure` and a `Domain` scoped to the
//! configured front-end origin host.

use std::time::Duration;

use axum::http::HeaderMap;

use crate::Result;
use crate::config::Config;

/// Name of the session cookie
pub const SESSION_COOKIE: &str = "session";

/// Name of the one-hop OAuth state cookie
pub const STATE_COOKIE: &str = "oauth_state";

/// Builds Set-Cookie values with environment-aware attributes
#[derive(Debug, Clone)]
pub struct CookieCodec {
    secure: bool,
    domain: Option<String>,
    session_max_age: Duration,
    state_max_age: Duration,
}

impl CookieCodec {
    /// Derive cookie settings from the gateway configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        let production = config.environment.is_production();
        let domain = if production {
            Some(format!(".{}", config.origin_host()?))
        } else {
            None
        };
        Ok(Self {
            secure: production,
            domain,
            session_max_age: config.session.ttl,
            state_max_age: config.cache.state_ttl,
        })
    }

    /// Set-Cookie value for a new session
    pub fn session_cookie(&self, value: &str) -> String {
        self.build(SESSION_COOKIE, value, self.session_max_age.as_secs())
    }

    /// Set-Cookie value that removes the session cookie
    pub fn clear_session_cookie(&self) -> String {
        self.build(SESSION_COOKIE, "", 0)
    }

    /// Set-Cookie value for the login-hop state cookie
    pub fn state_cookie(&self, value: &str) -> String {
        self.build(STATE_COOKIE, value, self.state_max_age.as_secs())
    }

    /// Set-Cookie value that removes the state cookie
    pub fn clear_state_cookie(&self) -> String {
        self.build(STATE_COOKIE, "", 0)
    }

    fn build(&self, name: &str, value: &str, max_age: u64) -> String {
        let mut cookie = format!("{name}={value}; Path=/; HttpOnly; SameSite=Lax; Max-Age={max_age}");
        if self.secure {
            cookie.push_str("; Secure");
        }
        if let Some(domain) = &self.domain {
            cookie.push_str("; Domain=");
            cookie.push_str(domain);
        }
        cookie
    }
}

/// Read a cookie value from the request headers
pub fn read_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    let header = headers.get(axum::http::header::COOKIE)?.to_str().ok()?;
    header.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}
