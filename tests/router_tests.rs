//! Router-level integration tests
//!
//! Drives the full router with in-process stores via `tower::ServiceExt::
//! oneshot`. No network: requests stop at validation/auth, are served from
//! the stores, or hit a scripted in-test provider implementation.

use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use pretty_assertions::assert_eq;
use serde_json::Value;
use tower::ServiceExt;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use guild_gateway::config::{Config, Environment, ProviderConfig};
use guild_gateway::gateway::{AppState, create_router};
use guild_gateway::provider::{Guild, GuildDetails, GuildMember, ProviderApi, ProviderUser, TokenSet};
use guild_gateway::store::{Session, Stores};
use guild_gateway::Error;

fn test_config() -> Config {
    Config {
        provider: ProviderConfig {
            client_id: "12345".to_string(),
            client_secret: "secret".to_string(),
            redirect_uri: "http://localhost:8787/api/auth/callback/discord".to_string(),
            bot_token: "bot-token".to_string(),
            ..ProviderConfig::default()
        },
        frontend_origin: "http://localhost:5173".to_string(),
        allowed_guilds: vec!["100".to_string()],
        ..Config::default()
    }
}

fn build_app(config: Config) -> (Router, Stores) {
    let stores = Stores::in_process(&config);
    let state = AppState::assemble(config, stores.clone()).unwrap();
    (create_router(state).unwrap(), stores)
}

async fn logged_in_app() -> (Router, Stores, String) {
    let (app, stores) = build_app(test_config());
    let session = Session::new(
        ProviderUser {
            id: "u1".to_string(),
            username: "tester".to_string(),
            avatar: None,
        },
        TokenSet {
            access_token: "at".to_string(),
            refresh_token: None,
            expires_in: Some(3600),
        },
        Duration::from_secs(3600),
    );
    stores.sessions.create(&session).await.unwrap();
    let cookie = format!("session={}", session.id);
    (app, stores, cookie)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn get_with_cookie(uri: &str, cookie: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(header::COOKIE, cookie)
        .body(Body::empty())
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

// ---------------------------------------------------------------------------
// Status and security headers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn status_is_public_and_carries_security_headers() {
    let (app, _) = build_app(test_config());
    let response = app.oneshot(get("/api/status")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(headers["referrer-policy"], "no-referrer");
    assert_eq!(headers["x-content-type-options"], "nosniff");
    assert_eq!(headers["x-frame-options"], "DENY");
    assert!(headers.contains_key("permissions-policy"));
    assert!(!headers.contains_key("strict-transport-security"));

    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert!(body["started_at"].is_string());
}

#[tokio::test]
async fn production_adds_hsts() {
    let mut config = test_config();
    config.environment = Environment::Production;
    let (app, _) = build_app(config);

    let response = app.oneshot(get("/api/status")).await.unwrap();
    assert!(response.headers().contains_key("strict-transport-security"));
}

#[tokio::test]
async fn error_responses_carry_security_headers_too() {
    let (app, _) = build_app(test_config());
    let response = app.oneshot(get("/api/me")).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(response.headers()["x-frame-options"], "DENY");
}

// ---------------------------------------------------------------------------
// CORS
// ---------------------------------------------------------------------------

#[tokio::test]
async fn preflight_is_answered_for_the_configured_origin() {
    let (app, _) = build_app(test_config());
    let request = Request::builder()
        .method("OPTIONS")
        .uri("/api/me")
        .header(header::ORIGIN, "http://localhost:5173")
        .header("access-control-request-method", "GET")
        .body(Body::empty())
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["access-control-allow-origin"],
        "http://localhost:5173"
    );
    assert_eq!(
        response.headers()["access-control-allow-credentials"],
        "true"
    );
}

#[tokio::test]
async fn cross_origin_get_is_credentialed() {
    let (app, _) = build_app(test_config());
    let request = Request::builder()
        .uri("/api/status")
        .header(header::ORIGIN, "http://localhost:5173")
        .body(Body::empty())
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(
        response.headers()["access-control-allow-origin"],
        "http://localhost:5173"
    );
}

// ---------------------------------------------------------------------------
// Login
// ---------------------------------------------------------------------------

#[tokio::test]
async fn login_redirects_to_provider_with_pkce() {
    let (app, _) = build_app(test_config());
    let request = Request::builder()
        .uri("/api/auth/login")
        .header("x-forwarded-for", "203.0.113.1")
        .body(Body::empty())
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FOUND);

    let location = response.headers()[header::LOCATION].to_str().unwrap();
    assert!(location.starts_with("https://discord.com/oauth2/authorize?"));
    assert!(location.contains("response_type=code"));
    assert!(location.contains("client_id=12345"));
    assert!(location.contains("code_challenge="));
    assert!(location.contains("code_challenge_method=S256"));
    assert!(location.contains("state="));

    let cookie = response.headers()[header::SET_COOKIE].to_str().unwrap();
    assert!(cookie.starts_with("oauth_state="));
    assert!(cookie.contains("HttpOnly"));
    assert!(cookie.contains("Max-Age=600"));
}

#[tokio::test]
async fn login_rate_limit_rejects_the_41st_request() {
    let (app, _) = build_app(test_config());

    for _ in 0..40 {
        let request = Request::builder()
            .uri("/api/auth/login")
            .header("x-forwarded-for", "203.0.113.9")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
    }

    let request = Request::builder()
        .uri("/api/auth/login")
        .header("x-forwarded-for", "203.0.113.9")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()[header::RETRY_AFTER], "60");

    // Another client is unaffected
    let request = Request::builder()
        .uri("/api/auth/login")
        .header("x-forwarded-for", "203.0.113.10")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FOUND);
}

// ---------------------------------------------------------------------------
// Callback failure paths (all redirect home, never an error page)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn callback_with_mismatched_state_redirects_home() {
    let (app, _) = build_app(test_config());
    let request = get_with_cookie(
        "/api/auth/callback/discord?code=abc&state=query-state",
        "oauth_state=cookie-state",
    );

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(
        response.headers()[header::LOCATION],
        "http://localhost:5173"
    );
    // The state cookie is cleared on the way out
    let cookie = response.headers()[header::SET_COOKIE].to_str().unwrap();
    assert!(cookie.starts_with("oauth_state=; "));
    assert!(cookie.contains("Max-Age=0"));
}

#[tokio::test]
async fn callback_with_unknown_state_redirects_home() {
    // Cookie and query agree, but the state was never stored (or already
    // consumed) - the replay is rejected at the store.
    let (app, _) = build_app(test_config());
    let request = get_with_cookie(
        "/api/auth/callback/discord?code=abc&state=replayed",
        "oauth_state=replayed",
    );

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(
        response.headers()[header::LOCATION],
        "http://localhost:5173"
    );
}

#[tokio::test]
async fn callback_for_unknown_provider_redirects_home() {
    let (app, _) = build_app(test_config());
    let request = get_with_cookie(
        "/api/auth/callback/github?code=abc&state=s",
        "oauth_state=s",
    );

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(
        response.headers()[header::LOCATION],
        "http://localhost:5173"
    );
}

#[tokio::test]
async fn callback_with_provider_error_redirects_home() {
    let (app, _) = build_app(test_config());
    let request = get_with_cookie(
        "/api/auth/callback/discord?error=access_denied&state=s",
        "oauth_state=s",
    );

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FOUND);
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn me_without_cookie_is_unauthorized() {
    let (app, _) = build_app(test_config());
    let response = app.oneshot(get("/api/me")).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn me_with_session_is_idempotent() {
    let (app, _, cookie) = logged_in_app().await;

    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(get_with_cookie("/api/me", &cookie))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["id"], "u1");
        assert_eq!(body["username"], "tester");
    }
}

#[tokio::test]
async fn logout_invalidates_the_session_immediately() {
    let (app, _, cookie) = logged_in_app().await;

    let request = Request::builder()
        .method("POST")
        .uri("/api/auth/logout")
        .header(header::COOKIE, &cookie)
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    let set_cookie = response.headers()[header::SET_COOKIE].to_str().unwrap();
    assert!(set_cookie.starts_with("session=; "));
    assert!(set_cookie.contains("Max-Age=0"));

    let response = app
        .oneshot(get_with_cookie("/api/me", &cookie))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn unknown_session_id_is_unauthorized() {
    let (app, _, _) = logged_in_app().await;
    let response = app
        .oneshot(get_with_cookie("/api/me", "session=forged-id"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

// ---------------------------------------------------------------------------
// Allow-list enforcement
// ---------------------------------------------------------------------------

#[tokio::test]
async fn guild_endpoints_reject_unlisted_guild_ids() {
    let (app, _, cookie) = logged_in_app().await;

    for uri in [
        "/api/guilds/999/me",
        "/api/guilds/999/overview",
        "/api/guilds/999/consent",
    ] {
        let response = app
            .clone()
            .oneshot(get_with_cookie(uri, &cookie))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN, "{uri}");
    }
}

#[tokio::test]
async fn empty_allow_list_rejects_every_guild() {
    let mut config = test_config();
    config.allowed_guilds.clear();
    let (app, stores) = build_app(config);

    let session = Session::new(
        ProviderUser {
            id: "u1".to_string(),
            username: "tester".to_string(),
            avatar: None,
        },
        TokenSet {
            access_token: "at".to_string(),
            refresh_token: None,
            expires_in: None,
        },
        Duration::from_secs(3600),
    );
    stores.sessions.create(&session).await.unwrap();

    let response = app
        .oneshot(get_with_cookie(
            "/api/guilds/100/consent",
            &format!("session={}", session.id),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

// ---------------------------------------------------------------------------
// Consent and profile records
// ---------------------------------------------------------------------------

#[tokio::test]
async fn consent_round_trips_through_the_repository() {
    let (app, _, cookie) = logged_in_app().await;

    let response = app
        .clone()
        .oneshot(get_with_cookie("/api/guilds/100/consent", &cookie))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["tracking_consent"], Value::Null);

    let request = Request::builder()
        .method("POST")
        .uri("/api/guilds/100/consent")
        .header(header::COOKIE, &cookie)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"tracking_consent":true}"#))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(get_with_cookie("/api/guilds/100/consent", &cookie))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["tracking_consent"], true);
    assert_eq!(body["guild_id"], "100");
}

#[tokio::test]
async fn profile_validates_birthday_format() {
    let (app, _, cookie) = logged_in_app().await;

    let request = Request::builder()
        .method("POST")
        .uri("/api/users/me/profile")
        .header(header::COOKIE, &cookie)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"birthday":"05/04/1990"}"#))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let request = Request::builder()
        .method("POST")
        .uri("/api/users/me/profile")
        .header(header::COOKIE, &cookie)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"birthday":"1990-05-04"}"#))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(get_with_cookie("/api/users/me/profile", &cookie))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["birthday"], "1990-05-04");
}

// ---------------------------------------------------------------------------
// Routing edges
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unknown_route_is_not_found() {
    let (app, _) = build_app(test_config());
    let response = app.oneshot(get("/api/nope")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn wrong_verb_is_method_not_allowed() {
    let (app, _) = build_app(test_config());
    let request = Request::builder()
        .method("POST")
        .uri("/api/me")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}

// ---------------------------------------------------------------------------
// Upstream behavior via a scripted provider
// ---------------------------------------------------------------------------

/// Provider stand-in with scriptable guild lists, membership, and presence
struct ScriptedProvider {
    guilds: Vec<Guild>,
    guild_fetches: AtomicU32,
    fail_guild_fetches_after: u32,
    member: Option<GuildMember>,
    bot_present: bool,
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self {
            guilds: Vec::new(),
            guild_fetches: AtomicU32::new(0),
            fail_guild_fetches_after: u32::MAX,
            member: None,
            bot_present: true,
        }
    }
}

#[async_trait]
impl ProviderApi for ScriptedProvider {
    fn build_authorize_url(
        &self,
        state: &str,
        code_challenge: &str,
    ) -> guild_gateway::Result<String> {
        Ok(format!(
            "https://provider.test/authorize?state={state}&code_challenge={code_challenge}"
        ))
    }

    fn invite_url(&self, guild_id: &str) -> String {
        format!("https://provider.test/invite?guild_id={guild_id}")
    }

    async fn exchange(
        &self,
        _code: &str,
        _code_verifier: &str,
    ) -> guild_gateway::Result<TokenSet> {
        Err(Error::upstream(500, "exchange not scripted"))
    }

    async fn fetch_user(&self, _access_token: &str) -> guild_gateway::Result<ProviderUser> {
        Err(Error::upstream(500, "fetch_user not scripted"))
    }

    async fn fetch_guilds(&self, _access_token: &str) -> guild_gateway::Result<Vec<Guild>> {
        let calls = self.guild_fetches.fetch_add(1, Ordering::SeqCst);
        if calls >= self.fail_guild_fetches_after {
            return Err(Error::upstream(429, "rate limited"));
        }
        Ok(self.guilds.clone())
    }

    async fn fetch_guild(&self, guild_id: &str) -> guild_gateway::Result<GuildDetails> {
        Ok(GuildDetails {
            id: guild_id.to_string(),
            name: "Test Guild".to_string(),
            icon: None,
            approximate_member_count: Some(5),
            approximate_presence_count: Some(2),
        })
    }

    async fn fetch_member(
        &self,
        _guild_id: &str,
        _user_id: &str,
    ) -> guild_gateway::Result<Option<GuildMember>> {
        Ok(self.member.clone())
    }

    async fn bot_in_guild(&self, _guild_id: &str) -> guild_gateway::Result<bool> {
        Ok(self.bot_present)
    }
}

fn provider_guild(id: &str) -> Guild {
    Guild {
        id: id.to_string(),
        name: format!("Guild {id}"),
        icon: None,
        owner: false,
        permissions: String::new(),
    }
}

async fn logged_in_with(config: Config, provider: Arc<dyn ProviderApi>) -> (Router, String) {
    let stores = Stores::in_process(&config);
    let state = AppState::assemble_with_provider(config, stores.clone(), provider).unwrap();
    let app = create_router(state).unwrap();

    let session = Session::new(
        ProviderUser {
            id: "u1".to_string(),
            username: "tester".to_string(),
            avatar: None,
        },
        TokenSet {
            access_token: "at".to_string(),
            refresh_token: None,
            expires_in: Some(3600),
        },
        Duration::from_secs(3600),
    );
    stores.sessions.create(&session).await.unwrap();
    (app, format!("session={}", session.id))
}

#[tokio::test]
async fn stale_guild_list_served_when_upstream_fails() {
    let mut config = test_config();
    config.cache.guilds_ttl = Duration::from_millis(1);
    let provider = Arc::new(ScriptedProvider {
        guilds: vec![provider_guild("100"), provider_guild("999")],
        fail_guild_fetches_after: 1,
        ..ScriptedProvider::default()
    });
    let (app, cookie) = logged_in_with(config, provider).await;

    let response = app
        .clone()
        .oneshot(get_with_cookie("/api/guilds", &cookie))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    // The un-listed guild never leaks, even from a fresh fetch
    assert_eq!(body.as_array().unwrap().len(), 1);
    assert_eq!(body[0]["id"], "100");
    assert_eq!(body[0]["bot_present"], true);

    tokio::time::sleep(Duration::from_millis(5)).await;

    // The entry is past its TTL and the refetch fails; the stale copy is
    // served rather than surfacing the outage
    let response = app
        .oneshot(get_with_cookie("/api/guilds", &cookie))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body[0]["id"], "100");
}

#[tokio::test]
async fn guild_list_failure_without_cache_is_bad_gateway() {
    let provider = Arc::new(ScriptedProvider {
        fail_guild_fetches_after: 0,
        ..ScriptedProvider::default()
    });
    let (app, cookie) = logged_in_with(test_config(), provider).await;

    let response = app
        .oneshot(get_with_cookie("/api/guilds", &cookie))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn non_member_of_allowed_guild_gets_forbidden_not_bad_gateway() {
    let provider = Arc::new(ScriptedProvider::default());
    let (app, cookie) = logged_in_with(test_config(), provider).await;

    for uri in ["/api/guilds/100/me", "/api/guilds/100/overview"] {
        let response = app
            .clone()
            .oneshot(get_with_cookie(uri, &cookie))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN, "{uri}");
    }
}

#[tokio::test]
async fn member_of_allowed_guild_gets_membership_record() {
    let provider = Arc::new(ScriptedProvider {
        member: Some(GuildMember {
            roles: vec!["role-1".to_string()],
            nick: Some("nick".to_string()),
            joined_at: None,
        }),
        ..ScriptedProvider::default()
    });
    let (app, cookie) = logged_in_with(test_config(), provider).await;

    let response = app
        .oneshot(get_with_cookie("/api/guilds/100/me", &cookie))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["roles"][0], "role-1");
    assert_eq!(body["nick"], "nick");
}

#[tokio::test]
async fn overview_forbidden_when_bot_absent() {
    let provider = Arc::new(ScriptedProvider {
        bot_present: false,
        member: Some(GuildMember {
            roles: Vec::new(),
            nick: None,
            joined_at: None,
        }),
        ..ScriptedProvider::default()
    });
    let (app, cookie) = logged_in_with(test_config(), provider).await;

    let response = app
        .oneshot(get_with_cookie("/api/guilds/100/overview", &cookie))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn overview_aggregates_guild_member_and_consent() {
    let provider = Arc::new(ScriptedProvider {
        member: Some(GuildMember {
            roles: vec!["role-1".to_string()],
            nick: None,
            joined_at: None,
        }),
        ..ScriptedProvider::default()
    });
    let (app, cookie) = logged_in_with(test_config(), provider).await;

    let response = app
        .oneshot(get_with_cookie("/api/guilds/100/overview", &cookie))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["guild"]["id"], "100");
    assert_eq!(body["member"]["roles"][0], "role-1");
    assert_eq!(body["tracking_consent"], Value::Null);
    assert_eq!(body["served_stale"], false);
}
