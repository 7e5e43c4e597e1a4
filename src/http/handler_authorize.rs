//! Handles GET/POST /oauth/authorize - the consent step of the authorization code flow
//!
//! GET validates the request, sends anonymous users to the login page with the request
//! stashed in their session, and renders the consent screen for signed-in users. POST
//! receives the consent decision.

use axum::{
    Form,
    extract::{Query, State},
    response::{IntoResponse, Redirect, Response},
};
use axum_extra::extract::cookie::CookieJar;
use axum_template::RenderHtml;
use minijinja::context;
use serde::Deserialize;

use super::{
    context::AppState,
    utils_session::{
        attach_session, csrf_failure, current_session, oauth_path, render_oauth_error,
        verified_session,
    },
};
use crate::errors::OAuthError;
use crate::oauth::{
    auth_server::AuthorizeError,
    types::{AuthorizeRequest, join_scopes},
};

/// Consent form body: the original request parameters plus the decision
#[derive(Debug, Deserialize)]
pub struct ConsentForm {
    #[serde(flatten)]
    pub request: AuthorizeRequest,
    pub csrf_token: Option<String>,
    pub decision: Option<String>,
}

/// Errors go back to the client only after its redirect URI was validated.
fn authorize_error_response(state: &AppState, error: AuthorizeError) -> Response {
    match error.redirect_url() {
        Some(url) => {
            tracing::debug!(error = error.error().error_code(), "authorization error redirected to client");
            Redirect::to(&url).into_response()
        }
        None => render_oauth_error(state, error.error()),
    }
}

fn request_params(request: &AuthorizeRequest) -> Vec<(&'static str, String)> {
    [
        ("response_type", &request.response_type),
        ("client_id", &request.client_id),
        ("redirect_uri", &request.redirect_uri),
        ("scope", &request.scope),
        ("state", &request.state),
        ("code_challenge", &request.code_challenge),
        ("code_challenge_method", &request.code_challenge_method),
        ("resource", &request.resource),
    ]
    .into_iter()
    .filter_map(|(name, value)| value.clone().map(|value| (name, value)))
    .collect()
}

/// GET /oauth/authorize
pub async fn handle_authorize(
    State(state): State<AppState>,
    jar: CookieJar,
    Query(request): Query<AuthorizeRequest>,
) -> Response {
    let validated = match state.auth_server.validate_authorize(&request).await {
        Ok(validated) => validated,
        Err(error) => return authorize_error_response(&state, error),
    };

    let mut session = match current_session(&state, &jar).await {
        Ok(session) => session,
        Err(error) => return render_oauth_error(&state, &error),
    };

    let Some(user) = session.user.clone() else {
        session.oauth_params = Some(request);
        if let Err(error) = state.sessions.save(&session).await {
            return render_oauth_error(&state, &OAuthError::from(error));
        }
        let jar = attach_session(&state, jar, &session);
        return (jar, Redirect::to(&oauth_path(&state, "login"))).into_response();
    };

    let scopes = validated.granted_scopes();
    let jar = attach_session(&state, jar, &session);
    (
        jar,
        RenderHtml(
            "consent.html",
            state.template_env.clone(),
            context! {
                client_name => validated.client.display_name(),
                logo_uri => validated.client.logo_uri,
                username => user.username,
                scopes => scopes,
                scope => join_scopes(&scopes),
                redirect_uri => validated.redirect_uri,
                params => request_params(&request),
                csrf_token => session.csrf_token,
                authorize_url => oauth_path(&state, "authorize"),
            },
        ),
    )
        .into_response()
}

/// POST /oauth/authorize
pub async fn handle_authorize_decision(
    State(state): State<AppState>,
    jar: CookieJar,
    Form(form): Form<ConsentForm>,
) -> Response {
    let mut session = match verified_session(&state, &jar, form.csrf_token.as_deref()).await {
        Ok(Some(session)) => session,
        Ok(None) => return csrf_failure(&state),
        Err(error) => return render_oauth_error(&state, &error),
    };

    let Some(user) = session.user.clone() else {
        session.oauth_params = Some(form.request);
        if let Err(error) = state.sessions.save(&session).await {
            return render_oauth_error(&state, &OAuthError::from(error));
        }
        return Redirect::to(&oauth_path(&state, "login")).into_response();
    };

    if session.oauth_params.take().is_some() {
        if let Err(error) = state.sessions.save(&session).await {
            return render_oauth_error(&state, &OAuthError::from(error));
        }
    }

    let outcome = match form.decision.as_deref() {
        Some("approve") => state.auth_server.approve(&form.request, &user.user_id).await,
        _ => {
            tracing::info!(user_id = %user.user_id, "authorization denied by user");
            Err(state.auth_server.deny(&form.request).await)
        }
    };

    match outcome {
        Ok(url) => Redirect::to(&url).into_response(),
        Err(error) => authorize_error_response(&state, error),
    }
}
