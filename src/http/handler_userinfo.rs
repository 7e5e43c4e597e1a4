//! Handles GET/POST /oauth/userinfo - claims about the token's user, gated by scope

use axum::{
    Json,
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Response},
};

use super::{
    context::AppState,
    middleware_auth::{ExtractedAuth, challenge_response, resource_metadata_url},
};
use crate::errors::OAuthError;

/// `profile` adds name and picture, `email` adds email and email_verified.
pub async fn get_userinfo_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    ExtractedAuth(token): ExtractedAuth,
) -> Response {
    match state.auth_server.userinfo(&token).await {
        Ok(claims) => Json(claims).into_response(),
        Err(error @ OAuthError::InvalidToken(_)) => challenge_response(
            &resource_metadata_url(&headers, &state.web.external_base),
            Some(error),
        ),
        Err(error) => error.into_response(),
    }
}
