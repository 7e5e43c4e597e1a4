//! Handles GET /api/whoami - bearer-protected sample endpoint describing the caller's token

use axum::Json;
use serde_json::{Value, json};

use super::middleware_auth::ExtractedAuth;

/// Handle the protected whoami endpoint
/// GET /api/whoami - Returns the subject, client and scopes of the presented token
pub async fn handle_whoami(ExtractedAuth(token): ExtractedAuth) -> Json<Value> {
    tracing::debug!(
        client_id = %token.client_id,
        subject = %token.subject,
        "whoami accessed"
    );

    Json(json!({
        "sub": token.subject,
        "client_id": token.client_id,
        "scope": token.scope(),
        "aud": token.audience,
        "exp": token.expires_at.map(|exp| exp.timestamp()),
    }))
}
