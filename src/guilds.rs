//! Guild allow-list filtering and dashboard assembly
//!
//! Everything the gateway exposes about guilds flows through the operator
//! allow-list: the list endpoint intersects the user's guilds with it, and
//! every per-guild endpoint independently re-checks membership before doing
//! any work, even for ids that came from a previously filtered list.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;

use crate::cache::{FetchOutcome, StaleCache};
use crate::config::Config;
use crate::provider::{Guild, ProviderApi};
use crate::{Error, Result};

/// Operator-configured closed set of guild ids
#[derive(Debug, Clone)]
pub struct AllowList {
    ids: HashSet<String>,
}

impl AllowList {
    /// Build the allow-list from configured ids
    #[must_use]
    pub fn new(ids: &[String]) -> Self {
        Self {
            ids: ids.iter().cloned().collect(),
        }
    }

    /// Whether a guild id is allow-listed
    #[must_use]
    pub fn contains(&self, guild_id: &str) -> bool {
        self.ids.contains(guild_id)
    }

    /// Intersect guilds with the allow-list. An empty allow-list yields an
    /// empty result: fail closed, never "show everything".
    #[must_use]
    pub fn filter(&self, guilds: Vec<Guild>) -> Vec<Guild> {
        guilds
            .into_iter()
            .filter(|g| self.ids.contains(&g.id))
            .collect()
    }
}

/// A guild enriched with bot presence and, when absent, an invite URL
#[derive(Debug, Clone, Serialize)]
pub struct GuildSummary {
    /// The guild as reported by the provider
    #[serde(flatten)]
    pub guild: Guild,
    /// Whether the bot is installed in the guild
    pub bot_present: bool,
    /// Invite URL when the bot is absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invite_url: Option<String>,
}

/// Serves allow-listed guild data through the upstream caches
pub struct GuildDirectory {
    provider: Arc<dyn ProviderApi>,
    allow_list: AllowList,
    guild_cache: StaleCache<Vec<Guild>>,
    presence_cache: StaleCache<bool>,
}

impl GuildDirectory {
    /// Build the directory from configuration
    #[must_use]
    pub fn new(provider: Arc<dyn ProviderApi>, config: &Config) -> Self {
        Self {
            provider,
            allow_list: AllowList::new(&config.allowed_guilds),
            guild_cache: StaleCache::new(config.cache.guilds_ttl),
            presence_cache: StaleCache::new(config.cache.presence_ttl),
        }
    }

    /// Error unless the guild id is allow-listed. Called by every handler
    /// that takes a guild id path parameter, defense in depth against
    /// forged ids.
    pub fn assert_allowed(&self, guild_id: &str) -> Result<()> {
        if self.allow_list.contains(guild_id) {
            Ok(())
        } else {
            Err(Error::Forbidden("Guild is not served by this gateway".to_string()))
        }
    }

    /// Allow-listed guilds for a user, each annotated with bot presence and
    /// an invite URL where the bot is absent. Guild lists are cached per
    /// user; a stale list is served if the provider call fails.
    pub async fn list_for_user(
        &self,
        user_id: &str,
        access_token: &str,
    ) -> Result<Vec<GuildSummary>> {
        let provider = Arc::clone(&self.provider);
        let token = access_token.to_string();
        let outcome = self
            .guild_cache
            .get_or_fetch(user_id, move || async move {
                provider.fetch_guilds(&token).await
            })
            .await?;

        let mut summaries = Vec::new();
        for guild in self.allow_list.filter(outcome.data) {
            let bot_present = self.bot_present(&guild.id).await?.data;
            let invite_url = (!bot_present).then(|| self.provider.invite_url(&guild.id));
            summaries.push(GuildSummary {
                guild,
                bot_present,
                invite_url,
            });
        }
        Ok(summaries)
    }

    /// Cached bot-presence probe for a guild
    pub async fn bot_present(&self, guild_id: &str) -> Result<FetchOutcome<bool>> {
        let provider = Arc::clone(&self.provider);
        let id = guild_id.to_string();
        self.presence_cache
            .get_or_fetch(guild_id, move || async move {
                provider.bot_in_guild(&id).await
            })
            .await
    }
}
