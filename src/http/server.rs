//! Main router configuration assembling the OAuth, discovery, and protected API endpoints.

use axum::{
    Router, middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use http::{Method, header};
use std::any::Any as PanicPayload;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::errors::OAuthError;

use super::{
    context::AppState,
    handler_authorize::{handle_authorize, handle_authorize_decision},
    handler_index::handle_index,
    handler_login::{handle_login, handle_login_submit, handle_logout},
    handler_oauth::{handle_oauth_introspect, handle_oauth_revoke, handle_oauth_token},
    handler_oauth_clients::app_register_client_handler,
    handler_userinfo::get_userinfo_handler,
    handler_well_known::{
        jwks_handler, oauth_authorization_server_handler, oauth_protected_resource_handler,
    },
    handler_whoami::handle_whoami,
    middleware_auth::{AuthorizationMiddleware, authorize_request},
};

/// Build the application router
pub fn build_router(ctx: AppState) -> Router {
    let api_policy = AuthorizationMiddleware::new(ctx.validator.clone(), ctx.web.external_base.clone())
        .require_scopes(ctx.web.api_required_scopes.clone());
    let userinfo_policy =
        AuthorizationMiddleware::new(ctx.validator.clone(), ctx.web.external_base.clone());

    // Bearer-protected resource routes
    let protected_api_routes = Router::new()
        .route("/whoami", get(handle_whoami))
        .route_layer(middleware::from_fn_with_state(api_policy, authorize_request));

    let userinfo_routes = Router::new()
        .route("/userinfo", get(get_userinfo_handler).post(get_userinfo_handler))
        .route_layer(middleware::from_fn_with_state(
            userinfo_policy,
            authorize_request,
        ));

    let mut oauth_routes = Router::new()
        .route("/authorize", get(handle_authorize).post(handle_authorize_decision))
        .route("/login", get(handle_login).post(handle_login_submit))
        .route("/logout", post(handle_logout))
        .route("/token", post(handle_oauth_token))
        .route("/introspect", post(handle_oauth_introspect))
        .route("/revoke", post(handle_oauth_revoke))
        .merge(userinfo_routes);

    if ctx.auth_server.settings().registration_enabled {
        oauth_routes = oauth_routes.route("/register", post(app_register_client_handler));
    }

    let well_known_routes = Router::new()
        .route(
            "/oauth-protected-resource",
            get(oauth_protected_resource_handler),
        )
        .route(
            "/oauth-authorization-server",
            get(oauth_authorization_server_handler),
        )
        .route("/jwks.json", get(jwks_handler));

    let router = Router::new()
        .route("/", get(handle_index))
        .nest("/api", protected_api_routes)
        .nest("/.well-known", well_known_routes);

    let prefix = ctx.auth_server.settings().path_prefix.clone();
    let router = if prefix.is_empty() {
        router.merge(oauth_routes)
    } else {
        router.nest(&prefix, oauth_routes)
    };

    with_service_layers(router).with_state(ctx)
}

/// CORS, panic recovery and request tracing shared by every route.
fn with_service_layers<S>(router: Router<S>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::ACCEPT]);

    router
        .layer(cors)
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(TraceLayer::new_for_http())
}

/// Generic `server_error` body for a handler that panicked.
fn panic_response(payload: Box<dyn PanicPayload + Send + 'static>) -> Response {
    let detail = payload
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| payload.downcast_ref::<&str>().copied())
        .unwrap_or("non-string panic payload");
    OAuthError::ServerError(format!("request handler panicked: {detail}")).into_response()
}
