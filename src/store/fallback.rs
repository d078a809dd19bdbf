//! Degrading wrapper: shared store first, in-process fallback on failure
//!
//! When the shared backend errors, the wrapper logs a warning, latches a
//! degrade window, and serves from the in-process store. The latch means the
//! degrade decision is made once per failure window rather than re-attempted
//! on every call. Once the window passes, the shared store is preferred
//! again and fallback data is treated as discardable.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tracing::warn;

use super::{RateLimiter, Repository, Session, SessionStore, StateStore, UserProfile};
use crate::Result;

/// How long a shared-store failure suppresses further attempts
pub const DEGRADE_WINDOW: Duration = Duration::from_secs(30);

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

struct DegradeGuard {
    degraded_until: AtomicU64,
    window_ms: u64,
}

impl DegradeGuard {
    fn new(window: Duration) -> Self {
        Self {
            degraded_until: AtomicU64::new(0),
            window_ms: window.as_millis() as u64,
        }
    }

    fn is_degraded(&self) -> bool {
        now_millis() < self.degraded_until.load(Ordering::Relaxed)
    }

    fn trip(&self) {
        self.degraded_until
            .store(now_millis() + self.window_ms, Ordering::Relaxed);
    }
}

/// A primary store with an in-process fallback behind a degrade latch
pub struct Fallback<P, F> {
    primary: P,
    fallback: F,
    guard: DegradeGuard,
}

impl<P, F> Fallback<P, F> {
    /// Wrap a primary and fallback pair
    pub fn new(primary: P, fallback: F, window: Duration) -> Self {
        Self {
            primary,
            fallback,
            guard: DegradeGuard::new(window),
        }
    }

    fn degrade(&self, operation: &str, error: &crate::Error) {
        warn!(operation, error = %error,
            "Shared store unavailable, degrading to in-process store");
        self.guard.trip();
    }
}

macro_rules! degrading {
    ($self:ident, $op:literal, $call:ident ( $($arg:expr),* )) => {{
        if !$self.guard.is_degraded() {
            match $self.primary.$call($($arg),*).await {
                Ok(value) => return Ok(value),
                Err(e) => $self.degrade($op, &e),
            }
        }
        $self.fallback.$call($($arg),*).await
    }};
}

#[async_trait]
impl<P: StateStore, F: StateStore> StateStore for Fallback<P, F> {
    async fn put(&self, state: &str, code_verifier: &str) -> Result<()> {
        degrading!(self, "state.put", put(state, code_verifier))
    }

    async fn consume(&self, state: &str) -> Result<Option<String>> {
        degrading!(self, "state.consume", consume(state))
    }
}

#[async_trait]
impl<P: SessionStore, F: SessionStore> SessionStore for Fallback<P, F> {
    async fn create(&self, session: &Session) -> Result<()> {
        degrading!(self, "session.create", create(session))
    }

    async fn load(&self, id: &str) -> Result<Option<Session>> {
        degrading!(self, "session.load", load(id))
    }

    async fn delete(&self, id: &str) -> Result<()> {
        degrading!(self, "session.delete", delete(id))
    }
}

#[async_trait]
impl<P: RateLimiter, F: RateLimiter> RateLimiter for Fallback<P, F> {
    async fn allow(&self, key: &str) -> Result<bool> {
        degrading!(self, "rate_limit.allow", allow(key))
    }
}

#[async_trait]
impl<P: Repository, F: Repository> Repository for Fallback<P, F> {
    async fn find_consent(&self, user_id: &str, guild_id: &str) -> Result<Option<bool>> {
        degrading!(self, "repository.find_consent", find_consent(user_id, guild_id))
    }

    async fn upsert_consent(&self, user_id: &str, guild_id: &str, consent: bool) -> Result<()> {
        degrading!(
            self,
            "repository.upsert_consent",
            upsert_consent(user_id, guild_id, consent)
        )
    }

    async fn find_profile(&self, user_id: &str) -> Result<Option<UserProfile>> {
        degrading!(self, "repository.find_profile", find_profile(user_id))
    }

    async fn upsert_profile(&self, user_id: &str, profile: &UserProfile) -> Result<()> {
        degrading!(self, "repository.upsert_profile", upsert_profile(user_id, profile))
    }
}
