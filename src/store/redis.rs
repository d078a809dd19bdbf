//! Redis-backed store implementations
//!
//! The durable shared backend. Atomicity requirements are met with single
//! Redis primitives: `GETDEL` for one-time state consumption, `INCR` for the
//! rate-limit counter. Session TTLs use `SET ... EX` at creation; reads never
//! touch the expiry.

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use super::{RateLimiter, Repository, Session, SessionStore, StateStore, UserProfile};
use crate::{Error, Result};

const STATE_PREFIX: &str = "gw:state:";
const SESSION_PREFIX: &str = "gw:session:";
const RATE_PREFIX: &str = "gw:rl:";
const CONSENT_PREFIX: &str = "gw:consent:";
const PROFILE_PREFIX: &str = "gw:profile:";

/// Open a managed connection to the shared store
pub async fn connect(url: &str) -> Result<ConnectionManager> {
    let client = redis::Client::open(url).map_err(store_err)?;
    ConnectionManager::new(client).await.map_err(store_err)
}

fn store_err(e: redis::RedisError) -> Error {
    Error::Store(e.to_string())
}

/// Redis OAuth state store
pub struct RedisStateStore {
    conn: ConnectionManager,
    ttl: Duration,
}

impl RedisStateStore {
    /// Create a state store over an existing connection
    #[must_use]
    pub fn new(conn: ConnectionManager, ttl: Duration) -> Self {
        Self { conn, ttl }
    }
}

#[async_trait]
impl StateStore for RedisStateStore {
    async fn put(&self, state: &str, code_verifier: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(
            format!("{STATE_PREFIX}{state}"),
            code_verifier,
            self.ttl.as_secs(),
        )
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn consume(&self, state: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        // GETDEL is the atomic get-and-delete; concurrent consumers cannot
        // both receive the verifier
        let verifier: Option<String> = redis::cmd("GETDEL")
            .arg(format!("{STATE_PREFIX}{state}"))
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(verifier)
    }
}

/// Redis session store
pub struct RedisSessionStore {
    conn: ConnectionManager,
    ttl: Duration,
}

impl RedisSessionStore {
    /// Create a session store over an existing connection
    #[must_use]
    pub fn new(conn: ConnectionManager, ttl: Duration) -> Self {
        Self { conn, ttl }
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn create(&self, session: &Session) -> Result<()> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(session)?;
        conn.set_ex::<_, _, ()>(
            format!("{SESSION_PREFIX}{}", session.id),
            json,
            self.ttl.as_secs(),
        )
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<Session>> {
        let mut conn = self.conn.clone();
        let json: Option<String> = conn
            .get(format!("{SESSION_PREFIX}{id}"))
            .await
            .map_err(store_err)?;
        match json {
            Some(json) => {
                let session: Session = serde_json::from_str(&json)?;
                // The key TTL already bounds the lifetime; the record's own
                // expiry is checked too so both backends agree
                if session.is_expired() {
                    return Ok(None);
                }
                Ok(Some(session))
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(format!("{SESSION_PREFIX}{id}"))
            .await
            .map_err(store_err)?;
        Ok(())
    }
}

/// Redis fixed-window rate limiter
pub struct RedisRateLimiter {
    conn: ConnectionManager,
    window: Duration,
    limit: u32,
}

impl RedisRateLimiter {
    /// Create a limiter over an existing connection
    #[must_use]
    pub fn new(conn: ConnectionManager, window: Duration, limit: u32) -> Self {
        Self { conn, window, limit }
    }
}

#[async_trait]
impl RateLimiter for RedisRateLimiter {
    async fn allow(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let redis_key = format!("{RATE_PREFIX}{key}");

        // INCR is atomic; EXPIRE NX attaches the window TTL exactly once,
        // and re-attaches it if a dropped connection ever left the counter
        // without one (a bare counter would reject the key forever)
        let count: i64 = conn.incr(&redis_key, 1).await.map_err(store_err)?;
        let window_secs: i64 = self.window.as_secs().try_into().unwrap_or(60);
        let _: i64 = redis::cmd("EXPIRE")
            .arg(&redis_key)
            .arg(window_secs)
            .arg("NX")
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(count <= i64::from(self.limit))
    }
}

/// Redis consent/profile repository
pub struct RedisRepository {
    conn: ConnectionManager,
}

impl RedisRepository {
    /// Create a repository over an existing connection
    #[must_use]
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl Repository for RedisRepository {
    async fn find_consent(&self, user_id: &str, guild_id: &str) -> Result<Option<bool>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn
            .get(format!("{CONSENT_PREFIX}{guild_id}:{user_id}"))
            .await
            .map_err(store_err)?;
        Ok(value.map(|v| v == "1"))
    }

    async fn upsert_consent(&self, user_id: &str, guild_id: &str, consent: bool) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(
            format!("{CONSENT_PREFIX}{guild_id}:{user_id}"),
            if consent { "1" } else { "0" },
        )
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn find_profile(&self, user_id: &str) -> Result<Option<UserProfile>> {
        let mut conn = self.conn.clone();
        let json: Option<String> = conn
            .get(format!("{PROFILE_PREFIX}{user_id}"))
            .await
            .map_err(store_err)?;
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn upsert_profile(&self, user_id: &str, profile: &UserProfile) -> Result<()> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(profile)?;
        conn.set::<_, _, ()>(format!("{PROFILE_PREFIX}{user_id}"), json)
            .await
            .map_err(store_err)?;
        Ok(())
    }
}
