//! Cookie and rendering helpers shared by the browser-facing handlers.

use axum::response::{IntoResponse, Response};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use axum_template::RenderHtml;
use http::StatusCode;
use minijinja::context;

use super::context::AppState;
use crate::errors::OAuthError;
use crate::oauth::session::{Session, verify_csrf};

pub(crate) const SESSION_COOKIE: &str = "authgate_session";
pub(crate) const CSRF_COOKIE: &str = "authgate_csrf";

fn build_cookie(state: &AppState, name: &'static str, value: String) -> Cookie<'static> {
    let max_age = time::Duration::seconds(state.sessions.ttl().num_seconds());
    Cookie::build((name, value))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .secure(state.web.secure_cookies)
        .max_age(max_age)
        .build()
}

/// Set the session id and CSRF cookies for `session`.
pub(crate) fn attach_session(state: &AppState, jar: CookieJar, session: &Session) -> CookieJar {
    jar.add(build_cookie(state, SESSION_COOKIE, session.id.clone()))
        .add(build_cookie(state, CSRF_COOKIE, session.csrf_token.clone()))
}

/// Expire both session cookies.
pub(crate) fn clear_session(jar: CookieJar) -> CookieJar {
    jar.remove(Cookie::build(SESSION_COOKIE).path("/"))
        .remove(Cookie::build(CSRF_COOKIE).path("/"))
}

pub(crate) fn session_id(jar: &CookieJar) -> Option<&str> {
    jar.get(SESSION_COOKIE).map(|cookie| cookie.value())
}

/// Load the cookie's session, or start a fresh one.
pub(crate) async fn current_session(state: &AppState, jar: &CookieJar) -> Result<Session, OAuthError> {
    Ok(state.sessions.load_or_create(session_id(jar)).await?)
}

/// Load the session for a state-changing form post and check its CSRF token.
///
/// Returns `None` when there is no session or the double-submit check fails; the caller
/// answers with [`csrf_failure`].
pub(crate) async fn verified_session(
    state: &AppState,
    jar: &CookieJar,
    form_token: Option<&str>,
) -> Result<Option<Session>, OAuthError> {
    let Some(session_id) = session_id(jar) else {
        tracing::warn!(target: "security", "form post without a session");
        return Ok(None);
    };
    let Some(session) = state.sessions.load(session_id).await? else {
        tracing::warn!(target: "security", "form post with an unknown session");
        return Ok(None);
    };

    let cookie_token = jar.get(CSRF_COOKIE).map(|cookie| cookie.value());
    if !verify_csrf(&session, form_token, cookie_token) {
        tracing::warn!(target: "security", "CSRF token mismatch");
        return Ok(None);
    }
    Ok(Some(session))
}

/// Generic response for a failed CSRF check.
pub(crate) fn csrf_failure(state: &AppState) -> Response {
    render_error(
        state,
        StatusCode::FORBIDDEN,
        "invalid_request",
        "The form has expired or is invalid. Go back and try again.",
    )
}

pub(crate) fn render_error(
    state: &AppState,
    status: StatusCode,
    error: &str,
    error_description: &str,
) -> Response {
    (
        status,
        RenderHtml(
            "error.html",
            state.template_env.clone(),
            context! {
                error => error,
                error_description => error_description,
            },
        ),
    )
        .into_response()
}

/// Render an OAuth error as an HTML page.
pub(crate) fn render_oauth_error(state: &AppState, error: &OAuthError) -> Response {
    if let OAuthError::ServerError(cause) = error {
        tracing::error!(error = %cause, "request failed");
    }
    render_error(state, error.status_code(), error.error_code(), &error.description())
}

/// Absolute path of an OAuth endpoint under the configured prefix.
pub(crate) fn oauth_path(state: &AppState, name: &str) -> String {
    format!("{}/{}", state.auth_server.settings().path_prefix, name)
}
