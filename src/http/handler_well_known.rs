//! Handles OAuth 2.0 well-known discovery endpoints - authorization server metadata, protected resource metadata, and JWKS

use axum::{
    Json,
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use http::{HeaderValue, header};
use serde::{Deserialize, Serialize};

use super::{context::AppState, middleware_auth::request_origin};
use crate::oauth::auth_server::AuthorizationServerMetadata;

/// RFC 9728 protected resource metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectedResourceMetadata {
    pub resource: String,
    pub authorization_servers: Vec<String>,
    pub scopes_supported: Vec<String>,
    pub scopes_required: Vec<String>,
    pub bearer_methods_supported: Vec<String>,
}

/// OAuth 2.0 Protected Resource Metadata handler
/// GET /.well-known/oauth-protected-resource
///
/// The resource identifier is the configured resource URI, or the request origin when none
/// is configured.
pub async fn oauth_protected_resource_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Json<ProtectedResourceMetadata> {
    let resource = match state.validator.resource_uri() {
        Some(resource_uri) => resource_uri.to_string(),
        None => request_origin(&headers, &state.web.external_base),
    };
    let settings = state.auth_server.settings();

    Json(ProtectedResourceMetadata {
        resource,
        authorization_servers: vec![settings.issuer.clone()],
        scopes_supported: settings.supported_scopes.iter().cloned().collect(),
        scopes_required: state.web.api_required_scopes.clone(),
        bearer_methods_supported: vec!["header".to_string()],
    })
}

/// OAuth 2.0 Authorization Server Metadata handler
/// GET /.well-known/oauth-authorization-server
pub async fn oauth_authorization_server_handler(
    State(state): State<AppState>,
) -> Json<AuthorizationServerMetadata> {
    Json(state.auth_server.metadata())
}

/// JWKS (JSON Web Key Set) handler
/// GET /.well-known/jwks.json
pub async fn jwks_handler(State(state): State<AppState>) -> Response {
    let mut response = Json(state.keys.jwks()).into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("public, max-age=3600"),
    );
    response
}
