//! Handles GET/POST /oauth/login and POST /oauth/logout - resource owner sign-in

use axum::{
    Form,
    extract::State,
    response::{IntoResponse, Redirect, Response},
};
use axum_extra::extract::cookie::CookieJar;
use axum_template::RenderHtml;
use http::StatusCode;
use minijinja::context;
use serde::Deserialize;

use super::{
    context::AppState,
    utils_session::{
        attach_session, clear_session, csrf_failure, current_session, oauth_path,
        render_oauth_error, verified_session,
    },
};
use crate::errors::OAuthError;
use crate::oauth::session::Session;

#[derive(Debug, Deserialize)]
pub struct LoginForm {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    pub csrf_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LogoutForm {
    pub csrf_token: Option<String>,
}

fn render_login(
    state: &AppState,
    jar: CookieJar,
    session: &Session,
    status: StatusCode,
    username: &str,
    error: Option<&str>,
) -> Response {
    let jar = attach_session(state, jar, session);
    (
        status,
        jar,
        RenderHtml(
            "login.html",
            state.template_env.clone(),
            context! {
                csrf_token => session.csrf_token,
                login_url => oauth_path(state, "login"),
                username => username,
                error => error,
            },
        ),
    )
        .into_response()
}

/// GET /oauth/login
pub async fn handle_login(State(state): State<AppState>, jar: CookieJar) -> Response {
    match current_session(&state, &jar).await {
        Ok(session) => render_login(&state, jar, &session, StatusCode::OK, "", None),
        Err(error) => render_oauth_error(&state, &error),
    }
}

/// POST /oauth/login
///
/// On success the session moves to a fresh id and any stashed authorization request is
/// replayed by redirecting back to the authorize endpoint with its original parameters.
pub async fn handle_login_submit(
    State(state): State<AppState>,
    jar: CookieJar,
    Form(form): Form<LoginForm>,
) -> Response {
    let session = match verified_session(&state, &jar, form.csrf_token.as_deref()).await {
        Ok(Some(session)) => session,
        Ok(None) => return csrf_failure(&state),
        Err(error) => return render_oauth_error(&state, &error),
    };

    let user = match state.auth_server.login(&form.username, &form.password).await {
        Ok(user) => user,
        Err(OAuthError::AccessDenied(description)) => {
            return render_login(
                &state,
                jar,
                &session,
                StatusCode::UNAUTHORIZED,
                &form.username,
                Some(&description),
            );
        }
        Err(OAuthError::TemporarilyUnavailable(description)) => {
            return render_login(
                &state,
                jar,
                &session,
                StatusCode::TOO_MANY_REQUESTS,
                &form.username,
                Some(&description),
            );
        }
        Err(error) => return render_oauth_error(&state, &error),
    };

    let mut session = session;
    let pending = session.oauth_params.take();

    let session = match state.sessions.sign_in(session, &user.id, &user.username).await {
        Ok(session) => session,
        Err(error) => return render_oauth_error(&state, &OAuthError::from(error)),
    };
    let jar = attach_session(&state, jar, &session);

    let target = match pending {
        Some(request) => format!("{}?{}", oauth_path(&state, "authorize"), request.to_query()),
        None => "/".to_string(),
    };
    (jar, Redirect::to(&target)).into_response()
}

/// POST /oauth/logout
pub async fn handle_logout(
    State(state): State<AppState>,
    jar: CookieJar,
    Form(form): Form<LogoutForm>,
) -> Response {
    let session = match verified_session(&state, &jar, form.csrf_token.as_deref()).await {
        Ok(Some(session)) => session,
        Ok(None) => return csrf_failure(&state),
        Err(error) => return render_oauth_error(&state, &error),
    };

    if let Err(error) = state.sessions.destroy(&session.id).await {
        return render_oauth_error(&state, &OAuthError::from(error));
    }
    if let Some(user) = &session.user {
        tracing::info!(user_id = %user.user_id, "user signed out");
    }
    (clear_session(jar), Redirect::to("/")).into_response()
}
