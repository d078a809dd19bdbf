//! HTTP gateway: server lifecycle, routing, middleware, and handlers

pub mod handlers;
pub mod headers;
pub mod router;
pub mod server;

pub use router::{AppState, create_router};
pub use server::GatewayServer;
