//! Identity-provider REST client
//!
//! Single round-trip calls to the chat platform's identity provider: the
//! PKCE token exchange, user and guild lookups with the user's bearer token,
//! and guild/member probes with the bot credential. No retries live here;
//! transient failures are absorbed by the cache layer via staleness.

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::config::ProviderConfig;
use crate::{Error, Result};

/// OAuth token response wire format
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<u64>,
    refresh_token: Option<String>,
}

/// Tokens obtained from the authorization-code exchange
#[derive(Debug, Clone)]
pub struct TokenSet {
    /// Bearer token for user-scoped provider calls
    pub access_token: String,
    /// Optional refresh token
    pub refresh_token: Option<String>,
    /// Provider-reported token lifetime in seconds
    pub expires_in: Option<u64>,
}

/// The authenticated user's provider identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderUser {
    /// Stable provider-side user id
    pub id: String,
    /// Display name
    pub username: String,
    /// Avatar reference, if set
    pub avatar: Option<String>,
}

/// A guild as reported by the provider for the authenticated user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Guild {
    /// Guild id
    pub id: String,
    /// Guild name
    pub name: String,
    /// Icon reference, if set
    pub icon: Option<String>,
    /// Whether the user owns the guild
    #[serde(default)]
    pub owner: bool,
    /// Permission bitmask the user holds in the guild
    #[serde(default)]
    pub permissions: String,
}

/// The caller's membership record in a guild (bot-credential probe)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuildMember {
    /// Role ids held in the guild
    #[serde(default)]
    pub roles: Vec<String>,
    /// Per-guild nickname
    pub nick: Option<String>,
    /// Join timestamp as reported by the provider
    pub joined_at: Option<String>,
}

/// Guild details from the bot-credential endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuildDetails {
    /// Guild id
    pub id: String,
    /// Guild name
    pub name: String,
    /// Icon reference, if set
    pub icon: Option<String>,
    /// Approximate member count when requested with counts
    pub approximate_member_count: Option<u64>,
    /// Approximate online count when requested with counts
    pub approximate_presence_count: Option<u64>,
}

/// The provider operations the gateway depends on. The REST client is the
/// production implementation; tests substitute scripted ones to exercise
/// upstream failures without a network.
#[async_trait]
pub trait ProviderApi: Send + Sync {
    /// Build the authorization URL for one login attempt
    fn build_authorize_url(&self, state: &str, code_challenge: &str) -> Result<String>;

    /// Bot invite URL for a guild where the bot is absent
    fn invite_url(&self, guild_id: &str) -> String;

    /// Exchange an authorization code and PKCE verifier for tokens
    async fn exchange(&self, code: &str, code_verifier: &str) -> Result<TokenSet>;

    /// Fetch the authenticated user's identity
    async fn fetch_user(&self, access_token: &str) -> Result<ProviderUser>;

    /// Fetch the guilds the authenticated user belongs to
    async fn fetch_guilds(&self, access_token: &str) -> Result<Vec<Guild>>;

    /// Fetch guild details with the bot credential
    async fn fetch_guild(&self, guild_id: &str) -> Result<GuildDetails>;

    /// Fetch a user's membership record in a guild; `None` when the user is
    /// not a member
    async fn fetch_member(&self, guild_id: &str, user_id: &str) -> Result<Option<GuildMember>>;

    /// Probe whether the bot is installed in a guild
    async fn bot_in_guild(&self, guild_id: &str) -> Result<bool>;
}

/// REST client for the identity provider
pub struct ProviderClient {
    http: Client,
    config: ProviderConfig,
}

impl ProviderClient {
    /// Create a client for the configured provider
    #[must_use]
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            http: Client::new(),
            config,
        }
    }

    /// Provider configuration backing this client
    #[must_use]
    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    fn bot_authorization(&self) -> String {
        format!("Bot {}", self.config.bot_token)
    }

    /// Map non-2xx responses into `Error::Upstream` with a truncated body
    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            Err(Error::upstream(status, body))
        }
    }
}

#[async_trait]
impl ProviderApi for ProviderClient {
    fn build_authorize_url(&self, state: &str, code_challenge: &str) -> Result<String> {
        let mut url = Url::parse(&self.config.authorize_url)
            .map_err(|e| Error::Config(format!("Invalid authorize_url: {e}")))?;

        {
            let mut params = url.query_pairs_mut();
            params.append_pair("response_type", "code");
            params.append_pair("client_id", &self.config.client_id);
            params.append_pair("redirect_uri", &self.config.redirect_uri);
            params.append_pair("state", state);
            params.append_pair("code_challenge", code_challenge);
            params.append_pair("code_challenge_method", "S256");
            if !self.config.scopes.is_empty() {
                params.append_pair("scope", &self.config.scopes.join(" "));
            }
        }

        Ok(url.to_string())
    }

    // Pure derivation from client id, requested permissions, and guild id
    fn invite_url(&self, guild_id: &str) -> String {
        format!(
            "{}?client_id={}&scope=bot%20applications.commands&permissions={}&guild_id={}",
            self.config.authorize_url,
            self.config.client_id,
            self.config.invite_permissions,
            guild_id
        )
    }

    async fn exchange(&self, code: &str, code_verifier: &str) -> Result<TokenSet> {
        let mut params = HashMap::new();
        params.insert("grant_type", "authorization_code");
        params.insert("code", code);
        params.insert("redirect_uri", self.config.redirect_uri.as_str());
        params.insert("client_id", self.config.client_id.as_str());
        params.insert("client_secret", self.config.client_secret.as_str());
        params.insert("code_verifier", code_verifier);

        let response = self
            .http
            .post(&self.config.token_url)
            .form(&params)
            .send()
            .await?;
        let response = Self::check(response).await?;

        let token: TokenResponse = response.json().await?;
        debug!("Token exchange complete");
        Ok(TokenSet {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expires_in: token.expires_in,
        })
    }

    async fn fetch_user(&self, access_token: &str) -> Result<ProviderUser> {
        let response = self
            .http
            .get(format!("{}/users/@me", self.config.api_base))
            .bearer_auth(access_token)
            .send()
            .await?;
        let response = Self::check(response).await?;
        Ok(response.json().await?)
    }

    async fn fetch_guilds(&self, access_token: &str) -> Result<Vec<Guild>> {
        let response = self
            .http
            .get(format!("{}/users/@me/guilds", self.config.api_base))
            .bearer_auth(access_token)
            .send()
            .await?;
        let response = Self::check(response).await?;
        Ok(response.json().await?)
    }

    async fn fetch_guild(&self, guild_id: &str) -> Result<GuildDetails> {
        let response = self
            .http
            .get(format!(
                "{}/guilds/{guild_id}?with_counts=true",
                self.config.api_base
            ))
            .header("Authorization", self.bot_authorization())
            .send()
            .await?;
        let response = Self::check(response).await?;
        Ok(response.json().await?)
    }

    async fn fetch_member(&self, guild_id: &str, user_id: &str) -> Result<Option<GuildMember>> {
        let response = self
            .http
            .get(format!(
                "{}/guilds/{guild_id}/members/{user_id}",
                self.config.api_base
            ))
            .header("Authorization", self.bot_authorization())
            .send()
            .await?;
        // A 404 means "not a member", a client-side fact, not an outage
        if response.status().as_u16() == 404 {
            return Ok(None);
        }
        let response = Self::check(response).await?;
        Ok(Some(response.json().await?))
    }

    // A 403/404 from the guild endpoint means the bot is not a member;
    // other failures propagate.
    async fn bot_in_guild(&self, guild_id: &str) -> Result<bool> {
        let response = self
            .http
            .get(format!("{}/guilds/{guild_id}", self.config.api_base))
            .header("Authorization", self.bot_authorization())
            .send()
            .await?;

        match response.status().as_u16() {
            200..=299 => Ok(true),
            403 | 404 => Ok(false),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(Error::upstream(status, body))
            }
        }
    }
}
