//! Axum HTTP adapters for the authorization server and the protected resource.

pub mod context;
mod handler_authorize;
mod handler_index;
mod handler_login;
mod handler_oauth;
mod handler_oauth_clients;
mod handler_userinfo;
pub mod handler_well_known;
mod handler_whoami;
pub mod middleware_auth;
pub mod server;
mod utils_session;

pub use context::{AppEngine, AppState, WebSettings};
pub use middleware_auth::{AuthorizationMiddleware, ExtractedAuth, OptionalAuth, authorize_request};
pub use server::build_router;
