//! Application state shared by every handler.

use axum::extract::FromRef;
use axum_template::engine::Engine;
use std::sync::Arc;

use crate::oauth::{AuthorizationServer, KeyManager, SessionManager, TokenValidator};

#[cfg(feature = "reload")]
use minijinja_autoreload::AutoReloader;

#[cfg(feature = "reload")]
/// Template engine with auto-reloading support for development.
pub type AppEngine = Engine<AutoReloader>;

#[cfg(feature = "embed")]
use minijinja::Environment;

#[cfg(feature = "embed")]
pub type AppEngine = Engine<Environment<'static>>;

#[cfg(not(any(feature = "reload", feature = "embed")))]
pub type AppEngine = Engine<minijinja::Environment<'static>>;

/// Settings of the HTTP surface that the protocol core does not know about
#[derive(Clone, Debug)]
pub struct WebSettings {
    /// Public base URL, used when the request carries no usable host
    pub external_base: String,
    /// Mark cookies `Secure`
    pub secure_cookies: bool,
    /// Scopes the sample protected API requires
    pub api_required_scopes: Vec<String>,
}

#[derive(Clone)]
pub struct AppState {
    pub auth_server: Arc<AuthorizationServer>,
    pub sessions: SessionManager,
    /// Resource-server side bearer validation
    pub validator: Arc<TokenValidator>,
    pub keys: Arc<KeyManager>,
    /// Template engine for rendering HTML responses.
    pub template_env: AppEngine,
    pub web: WebSettings,
}

impl FromRef<AppState> for Arc<AuthorizationServer> {
    fn from_ref(app_state: &AppState) -> Self {
        app_state.auth_server.clone()
    }
}

impl FromRef<AppState> for Arc<TokenValidator> {
    fn from_ref(app_state: &AppState) -> Self {
        app_state.validator.clone()
    }
}
