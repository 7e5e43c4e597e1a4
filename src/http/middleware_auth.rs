//! Bearer token middleware for protected resource routes.
//!
//! Validates `Authorization: Bearer` tokens through the [`TokenValidator`] and answers
//! failures the way RFC 6750 and RFC 9728 describe: 401 with a `WWW-Authenticate` challenge
//! pointing at the protected resource metadata, or 403 for an under-scoped token.

use axum::extract::{FromRequestParts, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use http::request::Parts;
use http::{HeaderMap, HeaderValue, header};
use std::convert::Infallible;
use std::sync::Arc;
use url::Url;

use crate::errors::OAuthError;
use crate::oauth::types::join_scopes;
use crate::oauth::validator::{AuthenticatedToken, TokenValidator, extract_bearer_token};

/// Well-known path of the RFC 9728 document
pub const PROTECTED_RESOURCE_METADATA_PATH: &str = "/.well-known/oauth-protected-resource";

/// Per-route authorization policy.
///
/// Attach with `axum::middleware::from_fn_with_state(policy, authorize_request)`.
#[derive(Clone)]
pub struct AuthorizationMiddleware {
    validator: Arc<TokenValidator>,
    required_scopes: Vec<String>,
    optional: bool,
    external_base: String,
}

impl AuthorizationMiddleware {
    pub fn new(validator: Arc<TokenValidator>, external_base: impl Into<String>) -> Self {
        Self {
            validator,
            required_scopes: Vec::new(),
            optional: false,
            external_base: external_base.into(),
        }
    }

    /// Require every one of `scopes`.
    pub fn require_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    /// Let requests without an `Authorization` header through unauthenticated.
    ///
    /// A token that is present but invalid is still rejected.
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn required_scopes(&self) -> &[String] {
        &self.required_scopes
    }

    /// Check the request headers, returning the authenticated token or the error response.
    pub async fn authorize(&self, headers: &HeaderMap) -> Result<Option<AuthenticatedToken>, Response> {
        let metadata_url = resource_metadata_url(headers, &self.external_base);

        if !headers.contains_key(header::AUTHORIZATION) {
            if self.optional {
                return Ok(None);
            }
            return Err(challenge_response(&metadata_url, None));
        }

        let Some(token) = extract_bearer_token(headers) else {
            let error = OAuthError::InvalidToken("Malformed Authorization header".to_string());
            return Err(challenge_response(&metadata_url, Some(error)));
        };

        match self.validator.validate_token(token, &self.required_scopes).await {
            Ok(authenticated) => Ok(Some(authenticated)),
            Err(OAuthError::InsufficientScope(description)) => {
                tracing::debug!(required = %join_scopes(&self.required_scopes), "insufficient scope");
                Err(insufficient_scope_response(
                    &metadata_url,
                    &self.required_scopes,
                    description,
                ))
            }
            Err(OAuthError::ServerError(cause)) => {
                tracing::error!(error = %cause, "token validation failed");
                let error = OAuthError::InvalidToken("The access token could not be validated".to_string());
                Err(challenge_response(&metadata_url, Some(error)))
            }
            Err(err) => {
                tracing::debug!(error = %err, "bearer token rejected");
                Err(challenge_response(&metadata_url, Some(err)))
            }
        }
    }
}

/// Middleware function enforcing an [`AuthorizationMiddleware`] policy.
///
/// On success the [`AuthenticatedToken`] is stored in the request extensions for
/// [`ExtractedAuth`] and [`OptionalAuth`].
pub async fn authorize_request(
    State(policy): State<AuthorizationMiddleware>,
    mut request: Request,
    next: Next,
) -> Response {
    match policy.authorize(request.headers()).await {
        Ok(Some(authenticated)) => {
            request.extensions_mut().insert(authenticated);
            let mut response = next.run(request).await;
            response
                .headers_mut()
                .append(header::VARY, HeaderValue::from_static("Authorization"));
            response
        }
        Ok(None) => next.run(request).await,
        Err(response) => response,
    }
}

/// Authenticated token of a request that passed [`authorize_request`].
#[derive(Clone, Debug)]
pub struct ExtractedAuth(pub AuthenticatedToken);

impl<S> FromRequestParts<S> for ExtractedAuth
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthenticatedToken>()
            .cloned()
            .map(ExtractedAuth)
            .ok_or_else(|| {
                OAuthError::InvalidToken("Missing access token".to_string()).into_response()
            })
    }
}

/// Token of a request on an optional route; `None` when the caller sent no token.
#[derive(Clone, Debug)]
pub struct OptionalAuth(pub Option<AuthenticatedToken>);

impl<S> FromRequestParts<S> for OptionalAuth
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(OptionalAuth(parts.extensions.get::<AuthenticatedToken>().cloned()))
    }
}

/// First value of a possibly comma-joined forwarding header.
fn first_forwarded<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn is_plain_authority(host: &str) -> bool {
    !host.contains('@') && host.parse::<http::uri::Authority>().is_ok()
}

/// Scheme and host the client used to reach this server.
///
/// Only the first hop of `X-Forwarded-Proto` and `X-Forwarded-Host` is honored. Without a
/// usable host the configured base URL is returned.
pub fn request_origin(headers: &HeaderMap, external_base: &str) -> String {
    let fallback = Url::parse(external_base).ok();
    let fallback_scheme = fallback
        .as_ref()
        .map(|url| url.scheme().to_string())
        .unwrap_or_else(|| "https".to_string());

    let scheme = match first_forwarded(headers, "x-forwarded-proto") {
        Some(proto) if proto.eq_ignore_ascii_case("https") => "https".to_string(),
        Some(proto) if proto.eq_ignore_ascii_case("http") => "http".to_string(),
        _ => fallback_scheme,
    };

    let host = first_forwarded(headers, "x-forwarded-host")
        .filter(|host| is_plain_authority(host))
        .or_else(|| {
            headers
                .get(header::HOST)
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
                .filter(|host| is_plain_authority(host))
        });

    match host {
        Some(host) => format!("{}://{}", scheme, host.to_ascii_lowercase()),
        None => external_base.trim_end_matches('/').to_string(),
    }
}

/// URL of the protected resource metadata for this request.
pub fn resource_metadata_url(headers: &HeaderMap, external_base: &str) -> String {
    format!(
        "{}{}",
        request_origin(headers, external_base),
        PROTECTED_RESOURCE_METADATA_PATH
    )
}

/// Quoted-string safe rendering of a description.
fn quote_safe(value: &str) -> String {
    value
        .chars()
        .filter(|c| !c.is_control())
        .map(|c| if c == '"' || c == '\\' { '\'' } else { c })
        .collect()
}

/// `WWW-Authenticate: Bearer resource_metadata="..."[, error="...", error_description="..."]`
pub fn bearer_challenge(metadata_url: &str, error: Option<&OAuthError>, scope: Option<&str>) -> String {
    let mut challenge = format!("Bearer resource_metadata=\"{}\"", quote_safe(metadata_url));
    if let Some(error) = error {
        challenge.push_str(&format!(
            ", error=\"{}\", error_description=\"{}\"",
            error.error_code(),
            quote_safe(&error.description())
        ));
    }
    if let Some(scope) = scope {
        challenge.push_str(&format!(", scope=\"{}\"", quote_safe(scope)));
    }
    challenge
}

fn with_challenge(mut response: Response, challenge: &str) -> Response {
    let headers = response.headers_mut();
    match HeaderValue::from_str(challenge) {
        Ok(value) => {
            headers.insert(header::WWW_AUTHENTICATE, value);
        }
        Err(_) => {
            headers.insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
    }
    headers.insert(header::VARY, HeaderValue::from_static("Authorization"));
    response
}

/// 401 response for a missing or rejected token.
pub fn challenge_response(metadata_url: &str, error: Option<OAuthError>) -> Response {
    let challenge = bearer_challenge(metadata_url, error.as_ref(), None);
    let error = error.unwrap_or_else(|| OAuthError::InvalidToken("Missing access token".to_string()));
    let mut response = error.into_response();
    *response.status_mut() = http::StatusCode::UNAUTHORIZED;
    with_challenge(response, &challenge)
}

fn insufficient_scope_response(metadata_url: &str, required_scopes: &[String], description: String) -> Response {
    let error = OAuthError::InsufficientScope(description);
    let scope = join_scopes(required_scopes);
    let challenge = bearer_challenge(metadata_url, Some(&error), Some(&scope));
    with_challenge(error.into_response(), &challenge)
}
