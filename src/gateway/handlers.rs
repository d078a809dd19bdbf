//! Endpoint handlers
//!
//! Handlers return `Result<_, Error>`; the error type carries the HTTP
//! mapping. The one deliberate exception is the OAuth callback, which never
//! surfaces an error page: whatever goes wrong mid-flow, the browser is sent
//! back to the front-end home.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Json;
use axum::extract::{ConnectInfo, Path, Query, Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use super::router::AppState;
use crate::auth::{SESSION_COOKIE, STATE_COOKIE, generate_login_attempt, read_cookie};
use crate::guilds::GuildSummary;
use crate::provider::{GuildMember, ProviderUser};
use crate::store::{Session, UserProfile};
use crate::{Error, Result};

/// Rate-limit key for a request: first `x-forwarded-for` hop when present,
/// else the peer socket address.
fn client_key(headers: &HeaderMap, peer: Option<&ConnectInfo<SocketAddr>>) -> String {
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    peer.map_or_else(
        || "unknown".to_string(),
        |ConnectInfo(addr)| addr.ip().to_string(),
    )
}

fn append_cookie(response: &mut Response, cookie: &str) {
    if let Ok(value) = HeaderValue::from_str(cookie) {
        response.headers_mut().append(header::SET_COOKIE, value);
    }
}

async fn require_session(state: &AppState, headers: &HeaderMap) -> Result<Session> {
    let id = read_cookie(headers, SESSION_COOKIE)
        .ok_or_else(|| Error::Unauthorized("Not logged in".to_string()))?;
    state
        .stores
        .sessions
        .load(&id)
        .await?
        .ok_or_else(|| Error::Unauthorized("Session expired".to_string()))
}

/// GET /api/auth/login - begin the PKCE flow
///
/// Rate limited per client address. Generates fresh PKCE material, parks the
/// verifier under its state token, and redirects to the provider with the
/// state doubled into a short-lived cookie.
pub async fn login(State(state): State<Arc<AppState>>, request: Request) -> Result<Response> {
    let key = client_key(
        request.headers(),
        request.extensions().get::<ConnectInfo<SocketAddr>>(),
    );
    if !state.stores.rate_limiter.allow(&key).await? {
        warn!(client = %key, "Login rate limit exceeded");
        return Err(Error::RateLimited);
    }

    let attempt = generate_login_attempt();
    state
        .stores
        .state
        .put(&attempt.state, &attempt.code_verifier)
        .await?;
    let authorize_url = state
        .provider
        .build_authorize_url(&attempt.state, &attempt.code_challenge)?;

    Ok((
        StatusCode::FOUND,
        [
            (header::LOCATION, authorize_url),
            (
                header::SET_COOKIE,
                state.cookies.state_cookie(&attempt.state),
            ),
        ],
    )
        .into_response())
}

/// Query parameters the provider sends to the callback
#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    /// Authorization code (absent when the user denied the grant)
    pub code: Option<String>,
    /// State token echoed back by the provider
    pub state: Option<String>,
    /// Provider-side error code
    pub error: Option<String>,
}

/// GET /api/auth/callback/{provider} - complete the PKCE flow
///
/// Success establishes a session and redirects to the dashboard. Every
/// failure path redirects to the front-end home instead, with the state
/// cookie cleared either way.
pub async fn callback(
    State(state): State<Arc<AppState>>,
    Path(provider_name): Path<String>,
    Query(params): Query<CallbackParams>,
    headers: HeaderMap,
) -> Response {
    let session_cookie = match run_callback(&state, &provider_name, params, &headers).await {
        Ok(cookie) => Some(cookie),
        Err(e) => {
            warn!(error = %e, "Login callback failed, redirecting to home");
            None
        }
    };

    let mut response = (
        StatusCode::FOUND,
        [(header::LOCATION, state.config.frontend_origin.clone())],
    )
        .into_response();
    if let Some(cookie) = session_cookie {
        append_cookie(&mut response, &cookie);
    }
    append_cookie(&mut response, &state.cookies.clear_state_cookie());
    response
}

async fn run_callback(
    state: &AppState,
    provider_name: &str,
    params: CallbackParams,
    headers: &HeaderMap,
) -> Result<String> {
    if provider_name != state.config.provider.name {
        return Err(Error::Validation(format!(
            "Unknown provider: {provider_name}"
        )));
    }
    if let Some(error) = params.error {
        return Err(Error::Validation(format!("Provider denied login: {error}")));
    }
    let code = params
        .code
        .ok_or_else(|| Error::Validation("Missing code parameter".to_string()))?;
    let returned_state = params
        .state
        .ok_or_else(|| Error::Validation("Missing state parameter".to_string()))?;

    // Double submit: the echoed state must match the login-hop cookie before
    // we touch the store.
    let cookie_state = read_cookie(headers, STATE_COOKIE)
        .ok_or_else(|| Error::Validation("Missing state cookie".to_string()))?;
    if cookie_state != returned_state {
        return Err(Error::Validation("State mismatch".to_string()));
    }

    // One-time consumption: a replayed state finds nothing.
    let code_verifier = state
        .stores
        .state
        .consume(&returned_state)
        .await?
        .ok_or_else(|| Error::Validation("Unknown or already-used state".to_string()))?;

    let tokens = state.provider.exchange(&code, &code_verifier).await?;
    let user = state.provider.fetch_user(&tokens.access_token).await?;
    info!(user = %user.id, "Login complete");

    let session = Session::new(user, tokens, state.config.session.ttl);
    state.stores.sessions.create(&session).await?;
    Ok(state.cookies.session_cookie(&session.id))
}

/// POST /api/auth/logout - delete the session, clear the cookie
pub async fn logout(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response> {
    if let Some(id) = read_cookie(&headers, SESSION_COOKIE) {
        state.stores.sessions.delete(&id).await?;
    }
    Ok((
        StatusCode::NO_CONTENT,
        [(header::SET_COOKIE, state.cookies.clear_session_cookie())],
    )
        .into_response())
}

/// GET /api/me - the authenticated user's identity
pub async fn me(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ProviderUser>> {
    let session = require_session(&state, &headers).await?;
    Ok(Json(session.user))
}

/// GET /api/status - liveness probe, no auth
pub async fn status(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "started_at": state.started_at.to_rfc3339(),
    }))
}

/// GET /api/guilds - allow-listed guilds for the user, with presence info
pub async fn list_guilds(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<GuildSummary>>> {
    let session = require_session(&state, &headers).await?;
    let guilds = state
        .guilds
        .list_for_user(&session.user.id, &session.access_token)
        .await?;
    Ok(Json(guilds))
}

/// GET /api/guilds/{guild_id}/me - the caller's membership in a guild
pub async fn guild_me(
    State(state): State<Arc<AppState>>,
    Path(guild_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<GuildMember>> {
    let session = require_session(&state, &headers).await?;
    state.guilds.assert_allowed(&guild_id)?;
    let member = state
        .provider
        .fetch_member(&guild_id, &session.user.id)
        .await?
        .ok_or_else(|| Error::Forbidden("Not a member of this guild".to_string()))?;
    Ok(Json(member))
}

/// GET /api/guilds/{guild_id}/overview - aggregated dashboard data
///
/// Requires the bot to be installed; without it there is nothing to show and
/// the bot-credential lookups below would fail anyway.
pub async fn guild_overview(
    State(state): State<Arc<AppState>>,
    Path(guild_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    let session = require_session(&state, &headers).await?;
    state.guilds.assert_allowed(&guild_id)?;

    let presence = state.guilds.bot_present(&guild_id).await?;
    if !presence.data {
        return Err(Error::Forbidden(
            "Bot is not installed in this guild".to_string(),
        ));
    }

    let details = state.provider.fetch_guild(&guild_id).await?;
    let member = state
        .provider
        .fetch_member(&guild_id, &session.user.id)
        .await?
        .ok_or_else(|| Error::Forbidden("Not a member of this guild".to_string()))?;
    let consent = state
        .stores
        .repository
        .find_consent(&session.user.id, &guild_id)
        .await?;

    Ok(Json(json!({
        "guild": details,
        "member": member,
        "tracking_consent": consent,
        "served_stale": presence.served_stale,
    })))
}

/// POST body for the consent endpoint
#[derive(Debug, Deserialize)]
pub struct ConsentBody {
    /// Whether the user consents to activity tracking in the guild
    pub tracking_consent: bool,
}

/// GET /api/guilds/{guild_id}/consent - the caller's tracking consent
pub async fn get_consent(
    State(state): State<Arc<AppState>>,
    Path(guild_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    let session = require_session(&state, &headers).await?;
    state.guilds.assert_allowed(&guild_id)?;
    let consent = state
        .stores
        .repository
        .find_consent(&session.user.id, &guild_id)
        .await?;
    Ok(Json(json!({
        "guild_id": guild_id,
        "tracking_consent": consent,
    })))
}

/// POST /api/guilds/{guild_id}/consent - record the caller's tracking consent
pub async fn set_consent(
    State(state): State<Arc<AppState>>,
    Path(guild_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<ConsentBody>,
) -> Result<Json<Value>> {
    let session = require_session(&state, &headers).await?;
    state.guilds.assert_allowed(&guild_id)?;
    state
        .stores
        .repository
        .upsert_consent(&session.user.id, &guild_id, body.tracking_consent)
        .await?;
    Ok(Json(json!({
        "guild_id": guild_id,
        "tracking_consent": body.tracking_consent,
    })))
}

/// POST body for the profile endpoint
#[derive(Debug, Deserialize)]
pub struct ProfileBody {
    /// Birthday in `YYYY-MM-DD` form; null clears it
    pub birthday: Option<String>,
}

/// GET /api/users/me/profile - the caller's profile
pub async fn get_profile(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<UserProfile>> {
    let session = require_session(&state, &headers).await?;
    let profile = state
        .stores
        .repository
        .find_profile(&session.user.id)
        .await?
        .unwrap_or_default();
    Ok(Json(profile))
}

/// POST /api/users/me/profile - update the caller's profile
pub async fn set_profile(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ProfileBody>,
) -> Result<Json<UserProfile>> {
    let session = require_session(&state, &headers).await?;
    if let Some(birthday) = &body.birthday {
        NaiveDate::parse_from_str(birthday, "%Y-%m-%d")
            .map_err(|_| Error::Validation("birthday must be YYYY-MM-DD".to_string()))?;
    }
    let profile = UserProfile {
        birthday: body.birthday,
    };
    state
        .stores
        .repository
        .upsert_profile(&session.user.id, &profile)
        .await?;
    Ok(Json(profile))
}
