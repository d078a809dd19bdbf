//! Login-flow primitives: PKCE material and cookie handling

pub mod cookies;
pub mod pkce;

pub use cookies::{CookieCodec, SESSION_COOKIE, STATE_COOKIE, read_cookie};
pub use pkce::{LoginAttempt, derive_challenge, generate_login_attempt, generate_session_id};
