//! Handles GET / - Renders the landing page with the current sign-in state

use axum::{
    extract::State,
    response::{IntoResponse, Response},
};
use axum_extra::extract::cookie::CookieJar;
use axum_template::RenderHtml;
use minijinja::context;

use super::{
    context::AppState,
    utils_session::{oauth_path, render_oauth_error, session_id},
};
use crate::errors::OAuthError;

/// Handle requests to the index page
pub async fn handle_index(State(state): State<AppState>, jar: CookieJar) -> Response {
    let session = match session_id(&jar) {
        Some(session_id) => match state.sessions.load(session_id).await {
            Ok(session) => session,
            Err(error) => return render_oauth_error(&state, &OAuthError::from(error)),
        },
        None => None,
    };

    let username = session
        .as_ref()
        .and_then(|session| session.user.as_ref())
        .map(|user| user.username.clone());
    let csrf_token = session.map(|session| session.csrf_token);

    RenderHtml(
        "index.html",
        state.template_env.clone(),
        context! {
            title => "authgate",
            username => username,
            csrf_token => csrf_token,
            login_url => oauth_path(&state, "login"),
            logout_url => oauth_path(&state, "logout"),
        },
    )
    .into_response()
}
