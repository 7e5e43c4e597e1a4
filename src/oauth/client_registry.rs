//! Registered OAuth clients: registration, credential checks and redirect URI matching.

use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use std::collections::BTreeSet;
use std::sync::Arc;
use url::Url;

use crate::clock::SharedClock;
use crate::errors::{ClientRegistrationError, StorageError};
use crate::oauth::types::*;
use crate::storage::{Store, StoreExt};

const MAX_REDIRECT_URIS: usize = 10;

fn client_key(client_id: &str) -> String {
    format!("client:{}", client_id)
}

/// Client identifiers are 8 to 128 characters of `[A-Za-z0-9_-]`.
pub fn is_valid_client_id(client_id: &str) -> bool {
    (8..=128).contains(&client_id.len())
        && client_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn is_loopback_host(host: &str) -> bool {
    matches!(host, "localhost" | "127.0.0.1" | "[::1]")
}

/// Canonical form used for exact redirect URI comparison.
///
/// Parsing lowercases scheme and host, drops the scheme's default port and renders an empty
/// path as `/`. Any other trailing slash is significant. Fragments never match.
pub fn normalize_redirect_uri(uri: &str) -> Option<String> {
    let parsed = Url::parse(uri).ok()?;
    if parsed.fragment().is_some() || parsed.cannot_be_a_base() {
        return None;
    }
    Some(parsed.as_str().to_string())
}

/// Check a redirect URI at registration time and return its canonical form.
pub fn validate_redirect_uri(uri: &str) -> Result<String, ClientRegistrationError> {
    let parsed = Url::parse(uri)
        .map_err(|e| ClientRegistrationError::InvalidRedirectUri(format!("{}: {}", uri, e)))?;

    if parsed.fragment().is_some() {
        return Err(ClientRegistrationError::InvalidRedirectUri(format!(
            "{}: fragments are not allowed",
            uri
        )));
    }
    if parsed.query().is_some() {
        return Err(ClientRegistrationError::InvalidRedirectUri(format!(
            "{}: query strings are not allowed",
            uri
        )));
    }

    let host = parsed.host_str().unwrap_or_default();
    match parsed.scheme() {
        "https" if !host.is_empty() => {}
        "http" if is_loopback_host(host) => {}
        _ => {
            return Err(ClientRegistrationError::InvalidRedirectUri(format!(
                "{}: must use https unless the host is localhost or 127.0.0.1",
                uri
            )));
        }
    }

    Ok(parsed.as_str().to_string())
}

fn hash_secret(secret: &str) -> Result<String, ClientRegistrationError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(secret.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| ClientRegistrationError::SecretHashingFailed(e.to_string()))
}

fn verify_secret(secret: &str, hash: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(secret.as_bytes(), &parsed)
            .is_ok(),
        Err(e) => {
            tracing::error!(error = %e, "stored client secret hash is unreadable");
            false
        }
    }
}

/// Store-backed registry of OAuth clients.
#[derive(Clone)]
pub struct ClientRegistry {
    store: Arc<dyn Store>,
    clock: SharedClock,
    supported_scopes: BTreeSet<String>,
}

impl ClientRegistry {
    pub fn new(store: Arc<dyn Store>, clock: SharedClock, supported_scopes: BTreeSet<String>) -> Self {
        Self {
            store,
            clock,
            supported_scopes,
        }
    }

    /// Register a client.
    ///
    /// Returns the stored client and, for confidential clients, the plaintext secret. The
    /// secret is only ever available here; the registry keeps an Argon2id hash.
    pub async fn register(
        &self,
        metadata: ClientMetadata,
    ) -> Result<(Client, Option<String>), ClientRegistrationError> {
        let client_id = match metadata.client_id.clone() {
            Some(client_id) => {
                if !is_valid_client_id(&client_id) {
                    return Err(ClientRegistrationError::InvalidClientMetadata(
                        "client_id must be 8-128 characters of letters, digits, '-' or '_'"
                            .to_string(),
                    ));
                }
                client_id
            }
            None => generate_client_id(),
        };

        if self.store.get(&client_key(&client_id)).await?.is_some() {
            return Err(ClientRegistrationError::ClientExists(client_id));
        }

        let client_type = resolve_client_type(&metadata)?;
        let redirect_uris = self.validate_redirect_uris(&metadata.redirect_uris)?;
        let scopes = self.validate_scopes(metadata.scope.as_deref())?;
        let grant_types = validate_grant_types(
            metadata.grant_types.clone(),
            client_type,
            !redirect_uris.is_empty(),
        )?;

        let secret = match client_type {
            ClientType::Confidential => {
                Some(metadata.client_secret.clone().unwrap_or_else(generate_token))
            }
            ClientType::Public => None,
        };
        let client_secret_hash = secret.as_deref().map(hash_secret).transpose()?;

        let now = self.clock.now();
        let client = Client {
            client_id,
            client_secret_hash,
            client_type,
            redirect_uris,
            scopes,
            grant_types,
            name: metadata.client_name,
            logo_uri: metadata.logo_uri,
            created_at: now,
            updated_at: now,
        };

        self.store
            .set_json(&client_key(&client.client_id), &client, None)
            .await?;
        tracing::info!(client_id = %client.client_id, client_type = ?client.client_type, "client registered");

        Ok((client, secret))
    }

    /// Register a client from operator configuration.
    ///
    /// Confidential seeds must carry their own `client_secret`, since a generated one would
    /// never reach the operator. An already registered `client_id` is left untouched and
    /// yields `None`.
    pub async fn seed(&self, metadata: ClientMetadata) -> Result<Option<Client>, ClientRegistrationError> {
        if metadata.client_secret.is_none()
            && resolve_client_type(&metadata)? == ClientType::Confidential
        {
            return Err(ClientRegistrationError::InvalidClientMetadata(format!(
                "seeded confidential client {} needs a client_secret",
                metadata.client_id.as_deref().unwrap_or("(unnamed)")
            )));
        }

        match self.register(metadata).await {
            Ok((client, _)) => Ok(Some(client)),
            Err(ClientRegistrationError::ClientExists(client_id)) => {
                tracing::debug!(%client_id, "client already present; skipping seed");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    pub async fn get(&self, client_id: &str) -> Result<Option<Client>, StorageError> {
        self.store.get_json(&client_key(client_id)).await
    }

    /// Replace the mutable metadata of an existing client. Type and secret are unchanged.
    pub async fn update(
        &self,
        client_id: &str,
        metadata: ClientMetadata,
    ) -> Result<Client, ClientRegistrationError> {
        let mut client = self
            .get(client_id)
            .await?
            .ok_or_else(|| ClientRegistrationError::ClientNotFound(client_id.to_string()))?;

        client.redirect_uris = self.validate_redirect_uris(&metadata.redirect_uris)?;
        if metadata.scope.is_some() {
            client.scopes = self.validate_scopes(metadata.scope.as_deref())?;
        }
        if metadata.grant_types.is_some() {
            client.grant_types = validate_grant_types(
                metadata.grant_types,
                client.client_type,
                !client.redirect_uris.is_empty(),
            )?;
        }
        if metadata.client_name.is_some() {
            client.name = metadata.client_name;
        }
        if metadata.logo_uri.is_some() {
            client.logo_uri = metadata.logo_uri;
        }
        client.updated_at = self.clock.now();

        self.store
            .set_json(&client_key(client_id), &client, None)
            .await?;
        Ok(client)
    }

    pub async fn delete(&self, client_id: &str) -> Result<bool, StorageError> {
        self.store.delete(&client_key(client_id)).await
    }

    /// Authenticate a client.
    ///
    /// Confidential clients must present a secret matching the stored hash. Public clients
    /// must present none; they are bound to their codes through PKCE instead.
    pub async fn validate_client(
        &self,
        client_id: &str,
        client_secret: Option<&str>,
    ) -> Result<Option<Client>, StorageError> {
        let Some(client) = self.get(client_id).await? else {
            tracing::warn!(target: "security", client_id, "authentication for unknown client");
            return Ok(None);
        };

        let authenticated = match (&client.client_secret_hash, client_secret) {
            (Some(hash), Some(secret)) => verify_secret(secret, hash),
            (None, None) => client.is_public(),
            _ => false,
        };

        if authenticated {
            Ok(Some(client))
        } else {
            tracing::warn!(target: "security", client_id, "client authentication failed");
            Ok(None)
        }
    }

    /// Exact match of `uri` against the client's registered redirect URIs.
    pub async fn is_valid_redirect_uri(&self, client_id: &str, uri: &str) -> Result<bool, StorageError> {
        Ok(self
            .get(client_id)
            .await?
            .is_some_and(|client| redirect_uri_matches(&client, uri)))
    }

    fn validate_redirect_uris(&self, uris: &[String]) -> Result<Vec<String>, ClientRegistrationError> {
        if uris.len() > MAX_REDIRECT_URIS {
            return Err(ClientRegistrationError::InvalidClientMetadata(format!(
                "at most {} redirect_uris may be registered",
                MAX_REDIRECT_URIS
            )));
        }
        let mut normalized: Vec<String> = Vec::with_capacity(uris.len());
        for uri in uris {
            let canonical = validate_redirect_uri(uri)?;
            if !normalized.contains(&canonical) {
                normalized.push(canonical);
            }
        }
        Ok(normalized)
    }

    fn validate_scopes(&self, scope: Option<&str>) -> Result<Vec<String>, ClientRegistrationError> {
        let Some(scope) = scope.filter(|s| !s.trim().is_empty()) else {
            return Ok(self.supported_scopes.iter().cloned().collect());
        };

        if !validate_scope(scope) {
            return Err(ClientRegistrationError::InvalidClientMetadata(
                "scope contains invalid characters".to_string(),
            ));
        }

        let requested = parse_scope(scope);
        if !self.supported_scopes.is_empty() {
            if let Some(unsupported) = requested.iter().find(|s| !self.supported_scopes.contains(*s)) {
                return Err(ClientRegistrationError::InvalidClientMetadata(format!(
                    "unsupported scope: {}",
                    unsupported
                )));
            }
        }
        Ok(requested.into_iter().collect())
    }
}

/// Exact comparison of a presented redirect URI against a client's registered set.
pub fn redirect_uri_matches(client: &Client, uri: &str) -> bool {
    let Some(presented) = normalize_redirect_uri(uri) else {
        return false;
    };
    client
        .redirect_uris
        .iter()
        .filter_map(|registered| normalize_redirect_uri(registered))
        .any(|registered| registered == presented)
}

/// Build the RFC 7591 response for a freshly registered client.
pub fn registration_response(client: &Client, secret: Option<String>) -> ClientRegistrationResponse {
    ClientRegistrationResponse {
        client_id: client.client_id.clone(),
        client_secret_expires_at: secret.as_ref().map(|_| 0),
        client_secret: secret,
        client_id_issued_at: client.created_at.timestamp(),
        client_name: client.name.clone(),
        logo_uri: client.logo_uri.clone(),
        redirect_uris: client.redirect_uris.clone(),
        grant_types: client.grant_types.clone(),
        response_types: vec![ResponseType::Code],
        scope: join_scopes(&client.scopes),
        token_endpoint_auth_method: client.token_endpoint_auth_method(),
    }
}

fn resolve_client_type(metadata: &ClientMetadata) -> Result<ClientType, ClientRegistrationError> {
    let client_type = match (metadata.client_type, metadata.token_endpoint_auth_method) {
        (Some(client_type), _) => client_type,
        (None, Some(ClientAuthMethod::None)) => ClientType::Public,
        (None, _) => ClientType::Confidential,
    };

    let auth_method_matches = match (client_type, metadata.token_endpoint_auth_method) {
        (_, None) => true,
        (ClientType::Public, Some(method)) => method == ClientAuthMethod::None,
        (ClientType::Confidential, Some(method)) => method != ClientAuthMethod::None,
    };
    if !auth_method_matches {
        return Err(ClientRegistrationError::InvalidClientMetadata(
            "token_endpoint_auth_method conflicts with client_type".to_string(),
        ));
    }

    if client_type == ClientType::Public && metadata.client_secret.is_some() {
        return Err(ClientRegistrationError::InvalidClientMetadata(
            "public clients cannot have a client_secret".to_string(),
        ));
    }

    Ok(client_type)
}

fn validate_grant_types(
    grant_types: Option<Vec<GrantType>>,
    client_type: ClientType,
    has_redirect_uris: bool,
) -> Result<Vec<GrantType>, ClientRegistrationError> {
    let grant_types = grant_types
        .filter(|grants| !grants.is_empty())
        .unwrap_or_else(|| vec![GrantType::AuthorizationCode]);

    if grant_types.contains(&GrantType::ClientCredentials) && client_type == ClientType::Public {
        return Err(ClientRegistrationError::InvalidClientMetadata(
            "client_credentials requires a confidential client".to_string(),
        ));
    }
    if grant_types.contains(&GrantType::AuthorizationCode) && !has_redirect_uris {
        return Err(ClientRegistrationError::InvalidClientMetadata(
            "authorization_code requires at least one redirect_uri".to_string(),
        ));
    }

    let mut deduplicated = Vec::with_capacity(grant_types.len());
    for grant in grant_types {
        if !deduplicated.contains(&grant) {
            deduplicated.push(grant);
        }
    }
    Ok(deduplicated)
}
