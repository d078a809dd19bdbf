//! Pluggable shared-state stores
//!
//! Every mutable shared resource of the gateway (ephemeral OAuth state,
//! sessions, rate-limit counters, consent/profile records) sits behind a
//! trait with two behaviorally interchangeable implementations: a durable
//! shared Redis backend and an in-process map. Selection happens once at
//! startup; callers never branch on backend type. When Redis is configured
//! but unreachable at runtime, operations degrade to the in-process store
//! (see [`fallback`]).

pub mod fallback;
pub mod memory;
pub mod redis;

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::Result;
use crate::auth::pkce::generate_session_id;
use crate::config::Config;
use crate::provider::{ProviderUser, TokenSet};

/// Seconds since the Unix epoch
pub(crate) fn now_epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// A server-side session record. The id is the sole credential carried by
/// the browser; everything else stays server-side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Opaque session id (256 bits of entropy, base64url)
    pub id: String,
    /// The authenticated user
    pub user: ProviderUser,
    /// Provider access token for user-scoped calls
    pub access_token: String,
    /// Optional provider refresh token
    pub refresh_token: Option<String>,
    /// Absolute expiry (Unix seconds), fixed at creation and not renewed
    /// on read
    pub expires_at: u64,
}

impl Session {
    /// Create a session for a freshly authenticated user
    #[must_use]
    pub fn new(user: ProviderUser, tokens: TokenSet, ttl: Duration) -> Self {
        Self {
            id: generate_session_id(),
            user,
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            expires_at: now_epoch_secs() + ttl.as_secs(),
        }
    }

    /// Whether the absolute expiry has passed
    #[must_use]
    pub fn is_expired(&self) -> bool {
        now_epoch_secs() >= self.expires_at
    }
}

/// A user's profile fields editable through the dashboard
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserProfile {
    /// Birthday in `YYYY-MM-DD` form
    pub birthday: Option<String>,
}

/// One-time OAuth state storage: `state -> code_verifier`, 600 s TTL
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Persist the verifier under its state token
    async fn put(&self, state: &str, code_verifier: &str) -> Result<()>;

    /// Atomically fetch and delete the verifier for a state token.
    /// Two concurrent consumptions of the same state must not both succeed.
    async fn consume(&self, state: &str) -> Result<Option<String>>;
}

/// Session storage keyed by opaque session id
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Store a new session
    async fn create(&self, session: &Session) -> Result<()>;

    /// Load a session by id; expired sessions are not returned
    async fn load(&self, id: &str) -> Result<Option<Session>>;

    /// Delete a session (logout)
    async fn delete(&self, id: &str) -> Result<()>;
}

/// Fixed-window request counter keyed by client address
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Record one request for the key; false once the window limit is hit.
    /// The increment-and-compare must be a single atomic operation from the
    /// store's perspective.
    async fn allow(&self, key: &str) -> Result<bool>;
}

/// Typed repository for consent and profile records. The gateway never
/// depends on the shape of the underlying schema.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Look up a user's tracking consent in a guild
    async fn find_consent(&self, user_id: &str, guild_id: &str) -> Result<Option<bool>>;

    /// Create or update a user's tracking consent in a guild
    async fn upsert_consent(&self, user_id: &str, guild_id: &str, consent: bool) -> Result<()>;

    /// Look up a user's profile
    async fn find_profile(&self, user_id: &str) -> Result<Option<UserProfile>>;

    /// Create or update a user's profile
    async fn upsert_profile(&self, user_id: &str, profile: &UserProfile) -> Result<()>;
}

/// The gateway's shared stores, selected once at startup
#[derive(Clone)]
pub struct Stores {
    /// Ephemeral OAuth state
    pub state: Arc<dyn StateStore>,
    /// Sessions
    pub sessions: Arc<dyn SessionStore>,
    /// Login rate-limit counters
    pub rate_limiter: Arc<dyn RateLimiter>,
    /// Consent/profile repository
    pub repository: Arc<dyn Repository>,
}

impl Stores {
    /// Connect the configured backend. With `redis_url` set, each store is a
    /// Redis implementation wrapped so runtime failures degrade to the
    /// in-process map; without it, the in-process stores are used directly.
    /// An unreachable Redis at startup also selects the in-process stores.
    pub async fn connect(config: &Config) -> Result<Self> {
        if let Some(url) = &config.redis_url {
            match redis::connect(url).await {
                Ok(conn) => {
                    info!("Shared store connected");
                    return Ok(Self::shared(config, conn));
                }
                Err(e) => {
                    warn!(error = %e, "Shared store unreachable at startup, using in-process stores");
                }
            }
        }
        Ok(Self::in_process(config))
    }

    /// In-process stores only
    #[must_use]
    pub fn in_process(config: &Config) -> Self {
        Self {
            state: Arc::new(memory::MemoryStateStore::new(config.cache.state_ttl)),
            sessions: Arc::new(memory::MemorySessionStore::new()),
            rate_limiter: Arc::new(memory::MemoryRateLimiter::new(
                config.rate_limit.window,
                config.rate_limit.max_requests,
            )),
            repository: Arc::new(memory::MemoryRepository::new()),
        }
    }

    /// Redis-backed stores with in-process fallback
    fn shared(config: &Config, conn: ::redis::aio::ConnectionManager) -> Self {
        let window = fallback::DEGRADE_WINDOW;
        Self {
            state: Arc::new(fallback::Fallback::new(
                redis::RedisStateStore::new(conn.clone(), config.cache.state_ttl),
                memory::MemoryStateStore::new(config.cache.state_ttl),
                window,
            )),
            sessions: Arc::new(fallback::Fallback::new(
                redis::RedisSessionStore::new(conn.clone(), config.session.ttl),
                memory::MemorySessionStore::new(),
                window,
            )),
            rate_limiter: Arc::new(fallback::Fallback::new(
                redis::RedisRateLimiter::new(
                    conn.clone(),
                    config.rate_limit.window,
                    config.rate_limit.max_requests,
                ),
                memory::MemoryRateLimiter::new(
                    config.rate_limit.window,
                    config.rate_limit.max_requests,
                ),
                window,
            )),
            repository: Arc::new(fallback::Fallback::new(
                redis::RedisRepository::new(conn),
                memory::MemoryRepository::new(),
                window,
            )),
        }
    }
}
