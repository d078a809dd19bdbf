//! In-process store implementations
//!
//! DashMap-backed fallbacks with the same TTL semantics as the Redis
//! implementations. Atomicity comes from DashMap's per-entry exclusive
//! access: consume is a single `remove`, rate-limit increments mutate the
//! entry under its shard lock.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use super::{RateLimiter, Repository, Session, SessionStore, StateStore, UserProfile};
use crate::Result;

struct StateEntry {
    code_verifier: String,
    expires_at: Instant,
}

/// In-process OAuth state store
pub struct MemoryStateStore {
    entries: DashMap<String, StateEntry>,
    ttl: Duration,
}

impl MemoryStateStore {
    /// Create a state store with the given entry TTL
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn put(&self, state: &str, code_verifier: &str) -> Result<()> {
        let now = Instant::now();
        // Lazy purge: abandoned logins never consume their state, so expired
        // entries are reclaimed here instead of accumulating forever
        self.entries.retain(|_, entry| entry.expires_at > now);
        self.entries.insert(
            state.to_string(),
            StateEntry {
                code_verifier: code_verifier.to_string(),
                expires_at: now + self.ttl,
            },
        );
        Ok(())
    }

    async fn consume(&self, state: &str) -> Result<Option<String>> {
        // remove() is the atomic get-and-delete: a second concurrent
        // consumption of the same state sees None
        let Some((_, entry)) = self.entries.remove(state) else {
            return Ok(None);
        };
        if Instant::now() > entry.expires_at {
            return Ok(None);
        }
        Ok(Some(entry.code_verifier))
    }
}

/// In-process session store
pub struct MemorySessionStore {
    entries: DashMap<String, Session>,
}

impl MemorySessionStore {
    /// Create an empty session store
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create(&self, session: &Session) -> Result<()> {
        self.entries.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<Session>> {
        let expired = match self.entries.get(id) {
            Some(entry) if entry.is_expired() => true,
            Some(entry) => return Ok(Some(entry.clone())),
            None => return Ok(None),
        };
        if expired {
            self.entries.remove(id);
        }
        Ok(None)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.entries.remove(id);
        Ok(())
    }
}

struct Window {
    count: u32,
    reset_at: Instant,
}

/// In-process fixed-window rate limiter
pub struct MemoryRateLimiter {
    windows: DashMap<String, Window>,
    window: Duration,
    limit: u32,
}

impl MemoryRateLimiter {
    /// Create a limiter with the given window and per-window limit
    #[must_use]
    pub fn new(window: Duration, limit: u32) -> Self {
        Self {
            windows: DashMap::new(),
            window,
            limit,
        }
    }
}

#[async_trait]
impl RateLimiter for MemoryRateLimiter {
    async fn allow(&self, key: &str) -> Result<bool> {
        let now = Instant::now();
        // Lazy purge of elapsed windows, one per distinct client address
        self.windows.retain(|_, window| window.reset_at >= now);
        // entry() holds the shard lock, making increment-and-compare atomic
        let mut entry = self.windows.entry(key.to_string()).or_insert_with(|| Window {
            count: 0,
            reset_at: now + self.window,
        });
        entry.count += 1;
        Ok(entry.count <= self.limit)
    }
}

/// In-process consent/profile repository
pub struct MemoryRepository {
    consents: DashMap<(String, String), bool>,
    profiles: DashMap<String, UserProfile>,
}

impl MemoryRepository {
    /// Create an empty repository
    #[must_use]
    pub fn new() -> Self {
        Self {
            consents: DashMap::new(),
            profiles: DashMap::new(),
        }
    }
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn find_consent(&self, user_id: &str, guild_id: &str) -> Result<Option<bool>> {
        Ok(self
            .consents
            .get(&(user_id.to_string(), guild_id.to_string()))
            .map(|entry| *entry))
    }

    async fn upsert_consent(&self, user_id: &str, guild_id: &str, consent: bool) -> Result<()> {
        self.consents
            .insert((user_id.to_string(), guild_id.to_string()), consent);
        Ok(())
    }

    async fn find_profile(&self, user_id: &str) -> Result<Option<UserProfile>> {
        Ok(self.profiles.get(user_id).map(|entry| entry.clone()))
    }

    async fn upsert_profile(&self, user_id: &str, profile: &UserProfile) -> Result<()> {
        self.profiles.insert(user_id.to_string(), profile.clone());
        Ok(())
    }
}
