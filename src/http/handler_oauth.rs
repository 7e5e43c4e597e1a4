//! Handles POST /oauth/token, /oauth/introspect and /oauth/revoke

use axum::{
    Form, Json,
    extract::{ConnectInfo, State, rejection::FormRejection},
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use http::{Extensions, HeaderValue, header};
use std::net::SocketAddr;

use super::context::AppState;
use crate::errors::OAuthError;
use crate::oauth::{auth_server::TokenActionForm, types::TokenForm};

/// Token responses must never be cached (RFC 6749 section 5.1).
fn no_store(mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    response
}

fn form_error(rejection: FormRejection) -> OAuthError {
    OAuthError::InvalidRequest(format!("Malformed request body: {}", rejection.body_text()))
}

/// POST /oauth/token
pub async fn handle_oauth_token(
    State(state): State<AppState>,
    extensions: Extensions,
    headers: HeaderMap,
    form: Result<Form<TokenForm>, FormRejection>,
) -> Response {
    let peer = extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let result = match form {
        Ok(Form(form)) => state.auth_server.token_from(form, &headers, peer).await,
        Err(rejection) => Err(form_error(rejection)),
    };

    match result {
        Ok(token) => no_store(Json(token).into_response()),
        Err(error) => error.into_response(),
    }
}

/// POST /oauth/introspect
pub async fn handle_oauth_introspect(
    State(state): State<AppState>,
    headers: HeaderMap,
    form: Result<Form<TokenActionForm>, FormRejection>,
) -> Response {
    let result = match form {
        Ok(Form(form)) => state.auth_server.introspect(form, &headers).await,
        Err(rejection) => Err(form_error(rejection)),
    };

    match result {
        Ok(introspection) => no_store(Json(introspection).into_response()),
        Err(error) => error.into_response(),
    }
}

/// POST /oauth/revoke
///
/// Answers 200 for unknown tokens (RFC 7009 section 2.2).
pub async fn handle_oauth_revoke(
    State(state): State<AppState>,
    headers: HeaderMap,
    form: Result<Form<TokenActionForm>, FormRejection>,
) -> Response {
    let result = match form {
        Ok(Form(form)) => state.auth_server.revoke(form, &headers).await,
        Err(rejection) => Err(form_error(rejection)),
    };

    match result {
        Ok(()) => no_store(http::StatusCode::OK.into_response()),
        Err(error) => error.into_response(),
    }
}
