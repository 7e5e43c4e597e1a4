//! Handles POST /oauth/register - RFC 7591 dynamic client registration

use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};

use super::context::AppState;
use crate::errors::ClientRegistrationError;
use crate::oauth::types::ClientMetadata;

/// Register a new OAuth client.
///
/// The plaintext secret of a confidential client is only returned here.
pub async fn app_register_client_handler(
    State(state): State<AppState>,
    body: Result<Json<ClientMetadata>, JsonRejection>,
) -> Response {
    let metadata = match body {
        Ok(Json(metadata)) => metadata,
        Err(rejection) => {
            return ClientRegistrationError::InvalidClientMetadata(rejection.body_text())
                .into_response();
        }
    };

    match state.auth_server.register(metadata).await {
        Ok(response) => (StatusCode::CREATED, Json(response)).into_response(),
        Err(error) => {
            tracing::info!(error = %error, "client registration rejected");
            error.into_response()
        }
    }
}
