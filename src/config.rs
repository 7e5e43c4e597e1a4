//! Environment-based configuration for the authgate server.

use anyhow::Result;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::ConfigError;
use crate::oauth::types::{parse_scope, validate_scope};

/// HTTP server port configuration
#[derive(Clone, Debug)]
pub struct HttpPort(u16);

/// Outbound HTTP client timeout
#[derive(Clone, Debug)]
pub struct HttpClientTimeout(Duration);

/// Lifetime of an issued artifact (tokens, codes, sessions, windows)
#[derive(Clone, Copy, Debug)]
pub struct Expiration(chrono::Duration);

/// Boolean flag accepting true/false/1/0/yes/no/on/off
#[derive(Clone, Copy, Debug, Default)]
pub struct Flag(bool);

/// Attempt budget per rate-limit window
#[derive(Clone, Copy, Debug)]
pub struct MaxAttempts(u64);

/// Scope universe of the server
#[derive(Clone, Debug)]
pub struct SupportedScopes(BTreeSet<String>);

/// Path prefix of the OAuth endpoints
#[derive(Clone, Debug)]
pub struct PathPrefix(String);

/// How the resource-server side validates bearer tokens
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TokenValidationMode {
    /// Verify JWTs with the server's own signing key
    Local,
    /// Verify JWTs against a remote JWKS document
    Jwks { jwks_uri: String },
    /// Ask a remote RFC 7662 introspection endpoint
    Introspection {
        endpoint: String,
        client_id: String,
        client_secret: Option<String>,
    },
    /// No verifier; every protected request fails closed
    None,
}

/// Main application configuration
#[derive(Clone)]
pub struct Config {
    pub version: String,
    pub http_port: HttpPort,
    pub http_templates_path: String,
    pub external_base: String,
    pub user_agent: String,
    pub http_client_timeout: HttpClientTimeout,
    pub storage_backend: String,
    pub redis_url: Option<String>,
    pub signing_key_path: Option<PathBuf>,
    pub resource_uri: String,
    pub supported_scopes: SupportedScopes,
    pub access_token_expiration: Expiration,
    pub refresh_token_expiration: Expiration,
    pub authorization_code_expiration: Expiration,
    pub session_expiration: Expiration,
    pub refresh_token_rotation: Flag,
    pub enable_client_registration: Flag,
    pub token_validation_mode: TokenValidationMode,
    pub introspection_timeout: HttpClientTimeout,
    pub validation_cache_ttl: Expiration,
    pub rate_limit_max_attempts: MaxAttempts,
    pub rate_limit_window: Expiration,
    pub cleanup_interval: HttpClientTimeout,
    pub bootstrap_clients_path: Option<PathBuf>,
    pub bootstrap_users_path: Option<PathBuf>,
    pub oauth_path_prefix: PathPrefix,
}

impl Config {
    /// Create a new configuration from environment variables
    pub fn new() -> Result<Self> {
        let external_base = require_env("EXTERNAL_BASE")?;
        let external_base = parse_url("EXTERNAL_BASE", &external_base)?;
        let default_user_agent = format!("authgate/{}", version()?);

        let http_port: HttpPort = default_env("HTTP_PORT", "8080").try_into()?;
        let http_templates_path = optional_env("HTTP_TEMPLATES_PATH")
            .unwrap_or_else(|| format!("{}/templates", env!("CARGO_MANIFEST_DIR")));
        let user_agent = default_env("USER_AGENT", &default_user_agent);
        let http_client_timeout: HttpClientTimeout =
            default_env("HTTP_CLIENT_TIMEOUT", "10s").try_into()?;

        let storage_backend = default_env("STORAGE_BACKEND", "memory");
        let redis_url = optional_env("REDIS_URL");
        let signing_key_path = optional_env("SIGNING_KEY_PATH").map(PathBuf::from);

        let resource_uri = match optional_env("RESOURCE_URI").filter(|v| !v.is_empty()) {
            Some(value) => parse_url("RESOURCE_URI", &value)?,
            None => external_base.clone(),
        };
        let supported_scopes: SupportedScopes = default_env(
            "SUPPORTED_SCOPES",
            "profile email offline_access mcp.read mcp.write",
        )
        .try_into()?;

        let access_token_expiration: Expiration =
            default_env("ACCESS_TOKEN_EXPIRATION", "15m").try_into()?;
        let refresh_token_expiration: Expiration =
            default_env("REFRESH_TOKEN_EXPIRATION", "30d").try_into()?;
        let authorization_code_expiration: Expiration =
            default_env("AUTHORIZATION_CODE_EXPIRATION", "10m").try_into()?;
        let session_expiration: Expiration = default_env("SESSION_EXPIRATION", "1h").try_into()?;
        let refresh_token_rotation: Flag =
            default_env("REFRESH_TOKEN_ROTATION", "false").try_into()?;
        let enable_client_registration: Flag =
            default_env("ENABLE_CLIENT_REGISTRATION", "false").try_into()?;

        let token_validation_mode = TokenValidationMode::from_env()?;
        let introspection_timeout: HttpClientTimeout =
            default_env("INTROSPECTION_TIMEOUT", "5s").try_into()?;
        let validation_cache_ttl: Expiration =
            default_env("VALIDATION_CACHE_TTL", "60s").try_into()?;

        let rate_limit_max_attempts: MaxAttempts =
            default_env("RATE_LIMIT_MAX_ATTEMPTS", "10").try_into()?;
        let rate_limit_window: Expiration = default_env("RATE_LIMIT_WINDOW", "15m").try_into()?;
        let cleanup_interval: HttpClientTimeout =
            default_env("CLEANUP_INTERVAL", "60s").try_into()?;

        let bootstrap_clients_path = optional_env("BOOTSTRAP_CLIENTS_PATH").map(PathBuf::from);
        let bootstrap_users_path = optional_env("BOOTSTRAP_USERS_PATH").map(PathBuf::from);
        let oauth_path_prefix: PathPrefix = default_env("OAUTH_PATH_PREFIX", "/oauth").try_into()?;

        Ok(Self {
            version: version()?,
            http_port,
            http_templates_path,
            external_base,
            user_agent,
            http_client_timeout,
            storage_backend,
            redis_url,
            signing_key_path,
            resource_uri,
            supported_scopes,
            access_token_expiration,
            refresh_token_expiration,
            authorization_code_expiration,
            session_expiration,
            refresh_token_rotation,
            enable_client_registration,
            token_validation_mode,
            introspection_timeout,
            validation_cache_ttl,
            rate_limit_max_attempts,
            rate_limit_window,
            cleanup_interval,
            bootstrap_clients_path,
            bootstrap_users_path,
            oauth_path_prefix,
        })
    }

    /// Session cookies are marked `Secure` when the server is reached over HTTPS.
    pub fn secure_cookies(&self) -> bool {
        self.external_base.starts_with("https://")
    }
}

/// Get application version from build environment
pub fn version() -> Result<String> {
    option_env!("GIT_HASH")
        .or(option_env!("CARGO_PKG_VERSION"))
        .map(|val| val.to_string())
        .ok_or(ConfigError::VersionNotSet.into())
}

fn require_env(name: &str) -> Result<String> {
    std::env::var(name).map_err(|_| ConfigError::EnvVarRequired(name.to_string()).into())
}

pub(crate) fn optional_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn default_env(name: &str, default_value: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default_value.to_string())
}

/// Parse an absolute URL setting, dropping a trailing slash.
fn parse_url(name: &str, value: &str) -> Result<String, ConfigError> {
    url::Url::parse(value)
        .map_err(|e| ConfigError::InvalidUrl(name.to_string(), e.to_string()))?;
    Ok(value.trim_end_matches('/').to_string())
}

/// Parse a boolean setting.
pub fn parse_bool(value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::BoolParsingFailed(value.to_string())),
    }
}

impl TokenValidationMode {
    fn from_env() -> Result<Self, ConfigError> {
        let mode = default_env("TOKEN_VALIDATION_MODE", "local");
        match mode.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "jwks" => {
                let jwks_uri = require_setting("JWKS_URI")?;
                Ok(Self::Jwks {
                    jwks_uri: parse_url("JWKS_URI", &jwks_uri)?,
                })
            }
            "introspection" => {
                let endpoint = require_setting("INTROSPECTION_ENDPOINT")?;
                Ok(Self::Introspection {
                    endpoint: parse_url("INTROSPECTION_ENDPOINT", &endpoint)?,
                    client_id: require_setting("INTROSPECTION_CLIENT_ID")?,
                    client_secret: optional_env("INTROSPECTION_CLIENT_SECRET")
                        .filter(|v| !v.is_empty()),
                })
            }
            "none" => Ok(Self::None),
            _ => Err(ConfigError::UnsupportedValue(
                "TOKEN_VALIDATION_MODE".to_string(),
                mode,
            )),
        }
    }
}

fn require_setting(name: &str) -> Result<String, ConfigError> {
    optional_env(name)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ConfigError::EnvVarRequired(name.to_string()))
}

fn parse_duration(value: &str) -> Result<Duration, ConfigError> {
    duration_str::parse(value)
        .map_err(|e| ConfigError::DurationParsingFailed(value.to_string(), e.to_string()))
}

impl TryFrom<String> for HttpPort {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.is_empty() {
            Ok(Self(8080))
        } else {
            value
                .parse::<u16>()
                .map(Self)
                .map_err(|err| ConfigError::PortParsingFailed(err).into())
        }
    }
}

impl AsRef<u16> for HttpPort {
    fn as_ref(&self) -> &u16 {
        &self.0
    }
}

impl TryFrom<String> for HttpClientTimeout {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.is_empty() {
            return Ok(Self(Duration::from_secs(10)));
        }
        let duration = parse_duration(&value)?;
        if duration.is_zero() {
            return Err(ConfigError::DurationParsingFailed(
                value,
                "must be greater than zero".to_string(),
            ));
        }
        Ok(Self(duration))
    }
}

impl AsRef<Duration> for HttpClientTimeout {
    fn as_ref(&self) -> &Duration {
        &self.0
    }
}

impl TryFrom<String> for Expiration {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let duration = parse_duration(&value)?;
        Ok(Self(chrono::Duration::from_std(duration)?))
    }
}

impl AsRef<chrono::Duration> for Expiration {
    fn as_ref(&self) -> &chrono::Duration {
        &self.0
    }
}

impl TryFrom<String> for Flag {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        parse_bool(&value).map(Self)
    }
}

impl AsRef<bool> for Flag {
    fn as_ref(&self) -> &bool {
        &self.0
    }
}

impl TryFrom<String> for MaxAttempts {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value
            .trim()
            .parse::<u64>()
            .map(Self)
            .map_err(|e| ConfigError::NumberParsingFailed(value, e))
    }
}

impl AsRef<u64> for MaxAttempts {
    fn as_ref(&self) -> &u64 {
        &self.0
    }
}

impl TryFrom<String> for SupportedScopes {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if !validate_scope(&value) {
            return Err(ConfigError::InvalidScope(format!(
                "'{}' contains characters outside the scope-token grammar",
                value
            )));
        }
        let scopes = parse_scope(&value);
        if scopes.is_empty() {
            return Err(ConfigError::InvalidScope(
                "at least one scope must be supported".to_string(),
            ));
        }
        Ok(Self(scopes))
    }
}

impl AsRef<BTreeSet<String>> for SupportedScopes {
    fn as_ref(&self) -> &BTreeSet<String> {
        &self.0
    }
}

impl TryFrom<String> for PathPrefix {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let trimmed = value.trim().trim_end_matches('/');
        if trimmed.is_empty() {
            return Ok(Self(String::new()));
        }
        if !trimmed.starts_with('/') || trimmed.contains(['?', '#', ' ']) {
            return Err(ConfigError::UnsupportedValue(
                "OAUTH_PATH_PREFIX".to_string(),
                value,
            ));
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl AsRef<str> for PathPrefix {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bool_variants() {
        for truthy in ["true", "1", "YES", "on"] {
            assert!(parse_bool(truthy).unwrap());
        }
        for falsy in ["false", "0", "no", "Off"] {
            assert!(!parse_bool(falsy).unwrap());
        }
        assert!(parse_bool("maybe").is_err());
    }

    #[test]
    fn test_expiration_parsing() {
        let expiration: Expiration = "15m".to_string().try_into().unwrap();
        assert_eq!(*expiration.as_ref(), chrono::Duration::minutes(15));

        let expiration: Expiration = "30d".to_string().try_into().unwrap();
        assert_eq!(*expiration.as_ref(), chrono::Duration::days(30));

        assert!(Expiration::try_from("soon".to_string()).is_err());
    }

    #[test]
    fn test_http_client_timeout() {
        let timeout: HttpClientTimeout = "5s".to_string().try_into().unwrap();
        assert_eq!(*timeout.as_ref(), Duration::from_secs(5));

        let timeout: HttpClientTimeout = String::new().try_into().unwrap();
        assert_eq!(*timeout.as_ref(), Duration::from_secs(10));

        for zero in ["0s", "0ms", "0m"] {
            assert!(matches!(
                HttpClientTimeout::try_from(zero.to_string()),
                Err(ConfigError::DurationParsingFailed(_, _))
            ));
        }
    }

    #[test]
    fn test_supported_scopes() {
        let scopes: SupportedScopes = "mcp.read profile mcp.read".to_string().try_into().unwrap();
        assert_eq!(scopes.as_ref().len(), 2);

        assert!(SupportedScopes::try_from("   ".to_string()).is_err());
        assert!(SupportedScopes::try_from("bad\"scope".to_string()).is_err());
    }

    #[test]
    fn test_path_prefix() {
        let prefix: PathPrefix = "/oauth/".to_string().try_into().unwrap();
        assert_eq!(prefix.as_ref(), "/oauth");

        let prefix: PathPrefix = "/".to_string().try_into().unwrap();
        assert_eq!(prefix.as_ref(), "");

        assert!(PathPrefix::try_from("oauth".to_string()).is_err());
    }

    #[test]
    fn test_max_attempts() {
        let attempts: MaxAttempts = "10".to_string().try_into().unwrap();
        assert_eq!(*attempts.as_ref(), 10);
        assert!(MaxAttempts::try_from("ten".to_string()).is_err());
    }
}
