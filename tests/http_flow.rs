//! HTTP flow tests
//!
//! Drive the assembled router through `axum-test`: discovery documents, the bearer
//! challenge, the token endpoint, and the browser flow from authorize through login and
//! consent to a protected API call.

use authgate::clock::{SharedClock, system_clock};
use authgate::http::{AppEngine, AppState, WebSettings, build_router};
use authgate::oauth::{
    AuthorizationCodeStore, AuthorizationServer, ClientMetadata, ClientRegistry, GrantType,
    KeyManager, LocalVerifier, MemoryUserDirectory, RateLimiter, RefreshTokenStore,
    ServerSettings, SessionManager, TokenCodec, TokenService, TokenSettings, TokenValidator,
    parse_scope, pkce, types::ClientAuthMethod, users::UserSeed,
};
use authgate::storage::MemoryStore;
use authgate::templates::build_env;
use axum::http::{HeaderName, HeaderValue, StatusCode, header};
use axum_test::{TestResponse, TestServer};
use chrono::Duration;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use url::Url;

const BASE: &str = "https://auth.example";
const VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";

async fn test_server(registration_enabled: bool) -> TestServer {
    let clock: SharedClock = system_clock();
    let store = Arc::new(MemoryStore::with_clock(clock.clone()));
    let supported = parse_scope("profile email mcp.read mcp.write");

    let clients = ClientRegistry::new(store.clone(), clock.clone(), supported.clone());
    clients
        .register(ClientMetadata {
            client_id: Some("pkce-client-1".to_string()),
            token_endpoint_auth_method: Some(ClientAuthMethod::None),
            redirect_uris: vec!["https://app.example/cb".to_string()],
            scope: Some("mcp.read profile".to_string()),
            client_name: Some("Test App".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    clients
        .register(ClientMetadata {
            client_id: Some("service-client".to_string()),
            client_secret: Some("service-secret".to_string()),
            grant_types: Some(vec![GrantType::ClientCredentials]),
            scope: Some("mcp.read mcp.write".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    clients
        .register(ClientMetadata {
            client_id: Some("profile-only".to_string()),
            client_secret: Some("profile-secret".to_string()),
            grant_types: Some(vec![GrantType::ClientCredentials]),
            scope: Some("profile".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();

    let users = MemoryUserDirectory::new();
    users
        .add_user(UserSeed {
            id: Some("user-1".to_string()),
            username: "alice".to_string(),
            password: "wonderland".to_string(),
            name: Some("Alice".to_string()),
            email: Some("alice@example.com".to_string()),
            email_verified: true,
            picture: None,
        })
        .unwrap();

    let keys = Arc::new(KeyManager::generate().unwrap());
    let codec = TokenCodec::new(keys.clone(), BASE, clock.clone());
    let tokens = TokenService::new(
        codec.clone(),
        RefreshTokenStore::new(store.clone(), clock.clone(), Duration::days(30)),
        TokenSettings {
            resource_uri: BASE.to_string(),
            access_token_ttl: Duration::minutes(15),
            rotate_refresh_tokens: false,
        },
    );
    let auth_server = Arc::new(AuthorizationServer::new(
        clients,
        AuthorizationCodeStore::new(store.clone(), clock.clone(), Duration::minutes(10)),
        tokens,
        Arc::new(users),
        RateLimiter::new(store.clone(), 50, Duration::minutes(15)),
        ServerSettings {
            issuer: BASE.to_string(),
            resource_uri: BASE.to_string(),
            supported_scopes: supported,
            path_prefix: "/oauth".to_string(),
            registration_enabled,
        },
    ));
    let validator = Arc::new(TokenValidator::new(
        Some(Arc::new(LocalVerifier::new(codec))),
        Some(BASE.to_string()),
        Duration::seconds(60),
        clock.clone(),
    ));

    let state = AppState {
        auth_server,
        sessions: SessionManager::new(store, clock, Duration::hours(1)),
        validator,
        keys,
        template_env: AppEngine::from(build_env(BASE.to_string(), "test".to_string())),
        web: WebSettings {
            external_base: BASE.to_string(),
            secure_cookies: false,
            api_required_scopes: vec!["mcp.read".to_string()],
        },
    };

    TestServer::new(build_router(state)).unwrap()
}

fn header_str<'a>(response: &'a TestResponse, name: HeaderName) -> Option<&'a str> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
}

/// Name/value pairs from every `Set-Cookie` header of a response.
fn set_cookies(response: &TestResponse) -> HashMap<String, String> {
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .filter_map(|raw| raw.split(';').next())
        .filter_map(|pair| pair.split_once('='))
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .collect()
}

fn cookie_header(cookies: &HashMap<String, String>) -> HeaderValue {
    let raw = cookies
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join("; ");
    HeaderValue::from_str(&raw).unwrap()
}

fn location(response: &TestResponse) -> String {
    header_str(response, header::LOCATION).unwrap().to_string()
}

fn bearer(token: &str) -> HeaderValue {
    HeaderValue::from_str(&format!("Bearer {token}")).unwrap()
}

async fn client_credentials_token(server: &TestServer, client_id: &str, secret: &str) -> String {
    let response = server
        .post("/oauth/token")
        .form(&[
            ("grant_type", "client_credentials"),
            ("client_id", client_id),
            ("client_secret", secret),
        ])
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    response.json::<Value>()["access_token"]
        .as_str()
        .unwrap()
        .to_string()
}

#[tokio::test]
async fn test_missing_token_gets_challenge() {
    let server = test_server(false).await;
    let response = server.get("/api/whoami").await;

    assert_eq!(response.status_code(), StatusCode::UNAUTHORIZED);
    let challenge = header_str(&response, header::WWW_AUTHENTICATE).unwrap();
    assert!(challenge.starts_with("Bearer resource_metadata=\""));
    assert!(challenge.contains("/.well-known/oauth-protected-resource"));
    assert_eq!(header_str(&response, header::VARY), Some("Authorization"));
}

#[tokio::test]
async fn test_garbage_token_is_invalid_token() {
    let server = test_server(false).await;
    let response = server
        .get("/api/whoami")
        .add_header(header::AUTHORIZATION, bearer("not-a-jwt"))
        .await;

    assert_eq!(response.status_code(), StatusCode::UNAUTHORIZED);
    let challenge = header_str(&response, header::WWW_AUTHENTICATE).unwrap();
    assert!(challenge.contains("error=\"invalid_token\""));
}

#[tokio::test]
async fn test_insufficient_scope_is_forbidden() {
    let server = test_server(false).await;
    let token = client_credentials_token(&server, "profile-only", "profile-secret").await;

    let response = server
        .get("/api/whoami")
        .add_header(header::AUTHORIZATION, bearer(&token))
        .await;
    assert_eq!(response.status_code(), StatusCode::FORBIDDEN);
    let challenge = header_str(&response, header::WWW_AUTHENTICATE).unwrap();
    assert!(challenge.contains("error=\"insufficient_scope\""));
    assert!(challenge.contains("scope=\"mcp.read\""));
}

#[tokio::test]
async fn test_token_response_is_not_cached() {
    let server = test_server(false).await;
    let response = server
        .post("/oauth/token")
        .form(&[
            ("grant_type", "client_credentials"),
            ("client_id", "service-client"),
            ("client_secret", "service-secret"),
            ("scope", "mcp.read"),
        ])
        .await;

    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(header_str(&response, header::CACHE_CONTROL), Some("no-store"));
    assert_eq!(header_str(&response, header::PRAGMA), Some("no-cache"));
    let body = response.json::<Value>();
    assert_eq!(body["token_type"], "Bearer");
    assert_eq!(body["scope"], "mcp.read");
}

#[tokio::test]
async fn test_token_endpoint_rejects_bad_secret() {
    let server = test_server(false).await;
    let response = server
        .post("/oauth/token")
        .form(&[
            ("grant_type", "client_credentials"),
            ("client_id", "service-client"),
            ("client_secret", "wrong"),
        ])
        .await;

    assert_eq!(response.status_code(), StatusCode::UNAUTHORIZED);
    assert_eq!(response.json::<Value>()["error"], "invalid_client");
}

#[tokio::test]
async fn test_repeated_client_credentials_grants_stay_available() {
    let server = test_server(false).await;
    for _ in 0..60 {
        client_credentials_token(&server, "service-client", "service-secret").await;
    }
}

#[tokio::test]
async fn test_bad_secret_flood_does_not_lock_out_real_client() {
    let server = test_server(false).await;
    for _ in 0..60 {
        server
            .post("/oauth/token")
            .add_header(
                HeaderName::from_static("x-forwarded-for"),
                HeaderValue::from_static("203.0.113.9"),
            )
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", "service-client"),
                ("client_secret", "wrong"),
            ])
            .await;
    }

    let locked = server
        .post("/oauth/token")
        .add_header(
            HeaderName::from_static("x-forwarded-for"),
            HeaderValue::from_static("203.0.113.9"),
        )
        .form(&[
            ("grant_type", "client_credentials"),
            ("client_id", "service-client"),
            ("client_secret", "service-secret"),
        ])
        .await;
    assert_eq!(locked.status_code(), StatusCode::TOO_MANY_REQUESTS);

    let response = server
        .post("/oauth/token")
        .add_header(
            HeaderName::from_static("x-forwarded-for"),
            HeaderValue::from_static("198.51.100.7"),
        )
        .form(&[
            ("grant_type", "client_credentials"),
            ("client_id", "service-client"),
            ("client_secret", "service-secret"),
        ])
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
}

#[tokio::test]
async fn test_userinfo_rejection_carries_bearer_challenge() {
    let server = test_server(false).await;
    let token = client_credentials_token(&server, "profile-only", "profile-secret").await;

    let response = server
        .get("/oauth/userinfo")
        .add_header(header::AUTHORIZATION, bearer(&token))
        .await;
    assert_eq!(response.status_code(), StatusCode::UNAUTHORIZED);
    let challenge = header_str(&response, header::WWW_AUTHENTICATE).unwrap();
    assert!(challenge.starts_with("Bearer resource_metadata=\""));
    assert!(challenge.contains("error=\"invalid_token\""));
    assert_eq!(header_str(&response, header::VARY), Some("Authorization"));
    assert_eq!(response.json::<Value>()["error"], "invalid_token");
}

#[tokio::test]
async fn test_discovery_documents() {
    let server = test_server(false).await;

    let response = server.get("/.well-known/oauth-authorization-server").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let metadata = response.json::<Value>();
    assert_eq!(metadata["issuer"], BASE);
    assert_eq!(metadata["token_endpoint"], format!("{BASE}/oauth/token"));
    assert!(metadata.get("registration_endpoint").is_none());

    let response = server.get("/.well-known/oauth-protected-resource").await;
    let resource = response.json::<Value>();
    assert_eq!(resource["resource"], BASE);
    assert_eq!(resource["authorization_servers"][0], BASE);

    let response = server.get("/.well-known/jwks.json").await;
    assert_eq!(
        header_str(&response, header::CACHE_CONTROL),
        Some("public, max-age=3600")
    );
    assert_eq!(response.json::<Value>()["keys"][0]["alg"], "RS256");
}

#[tokio::test]
async fn test_registration_follows_feature_flag() {
    let disabled = test_server(false).await;
    let response = disabled
        .post("/oauth/register")
        .json(&serde_json::json!({ "redirect_uris": ["https://new.example/cb"] }))
        .await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);

    let enabled = test_server(true).await;
    let response = enabled
        .post("/oauth/register")
        .json(&serde_json::json!({
            "redirect_uris": ["https://new.example/cb"],
            "token_endpoint_auth_method": "none",
            "scope": "mcp.read"
        }))
        .await;
    assert_eq!(response.status_code(), StatusCode::CREATED);
    let body = response.json::<Value>();
    assert!(body["client_id"].as_str().is_some());
    assert!(body.get("client_secret").is_none());
}

#[tokio::test]
async fn test_login_post_without_csrf_is_rejected() {
    let server = test_server(false).await;
    let page = server.get("/oauth/login").await;
    assert_eq!(page.status_code(), StatusCode::OK);
    let cookies = set_cookies(&page);

    let response = server
        .post("/oauth/login")
        .add_header(header::COOKIE, cookie_header(&cookies))
        .form(&[
            ("username", "alice"),
            ("password", "wonderland"),
            ("csrf_token", "forged"),
        ])
        .await;
    assert_eq!(response.status_code(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_browser_flow_end_to_end() {
    let server = test_server(false).await;
    let challenge = pkce::s256_challenge(VERIFIER);
    let authorize_params = [
        ("response_type", "code"),
        ("client_id", "pkce-client-1"),
        ("redirect_uri", "https://app.example/cb"),
        ("scope", "mcp.read profile"),
        ("state", "xyz"),
        ("code_challenge", challenge.as_str()),
        ("code_challenge_method", "S256"),
    ];

    // Anonymous users are sent to the login page with the request stashed.
    let response = server
        .get("/oauth/authorize")
        .add_query_params(&authorize_params)
        .await;
    assert_eq!(response.status_code(), StatusCode::SEE_OTHER);
    assert_eq!(location(&response), "/oauth/login");
    let cookies = set_cookies(&response);
    let csrf = cookies["authgate_csrf"].clone();
    let first_session = cookies["authgate_session"].clone();

    let response = server
        .post("/oauth/login")
        .add_header(header::COOKIE, cookie_header(&cookies))
        .form(&[
            ("username", "alice"),
            ("password", "wonderland"),
            ("csrf_token", csrf.as_str()),
        ])
        .await;
    assert_eq!(response.status_code(), StatusCode::SEE_OTHER);
    let replay = location(&response);
    assert!(replay.starts_with("/oauth/authorize?"));
    let cookies = set_cookies(&response);
    assert_ne!(cookies["authgate_session"], first_session);
    let csrf = cookies["authgate_csrf"].clone();

    // Signed in: the replayed request renders the consent screen.
    let response = server
        .get(&replay)
        .add_header(header::COOKIE, cookie_header(&cookies))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert!(response.text().contains("Test App"));

    let mut consent: Vec<(&str, &str)> = authorize_params.to_vec();
    consent.push(("csrf_token", csrf.as_str()));
    consent.push(("decision", "approve"));
    let response = server
        .post("/oauth/authorize")
        .add_header(header::COOKIE, cookie_header(&cookies))
        .form(&consent)
        .await;
    assert_eq!(response.status_code(), StatusCode::SEE_OTHER);
    let redirect = Url::parse(&location(&response)).unwrap();
    assert_eq!(redirect.host_str(), Some("app.example"));
    let params: HashMap<String, String> = redirect.query_pairs().into_owned().collect();
    assert_eq!(params["state"], "xyz");
    assert_eq!(params["iss"], BASE);

    let response = server
        .post("/oauth/token")
        .form(&[
            ("grant_type", "authorization_code"),
            ("code", params["code"].as_str()),
            ("redirect_uri", "https://app.example/cb"),
            ("code_verifier", VERIFIER),
            ("client_id", "pkce-client-1"),
        ])
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let access_token = response.json::<Value>()["access_token"]
        .as_str()
        .unwrap()
        .to_string();

    let response = server
        .get("/api/whoami")
        .add_header(header::AUTHORIZATION, bearer(&access_token))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let whoami = response.json::<Value>();
    assert_eq!(whoami["sub"], "user-1");
    assert_eq!(whoami["client_id"], "pkce-client-1");

    let response = server
        .get("/oauth/userinfo")
        .add_header(header::AUTHORIZATION, bearer(&access_token))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let userinfo = response.json::<Value>();
    assert_eq!(userinfo["sub"], "user-1");
    assert_eq!(userinfo["name"], "Alice");
    assert!(userinfo.get("email").is_none());
}

#[tokio::test]
async fn test_denied_consent_redirects_with_access_denied() {
    let server = test_server(false).await;
    let challenge = pkce::s256_challenge(VERIFIER);
    let authorize_params = [
        ("response_type", "code"),
        ("client_id", "pkce-client-1"),
        ("redirect_uri", "https://app.example/cb"),
        ("scope", "mcp.read"),
        ("state", "abc"),
        ("code_challenge", challenge.as_str()),
        ("code_challenge_method", "S256"),
    ];

    let page = server.get("/oauth/login").await;
    let cookies = set_cookies(&page);
    let response = server
        .post("/oauth/login")
        .add_header(header::COOKIE, cookie_header(&cookies))
        .form(&[
            ("username", "alice"),
            ("password", "wonderland"),
            ("csrf_token", cookies["authgate_csrf"].as_str()),
        ])
        .await;
    assert_eq!(location(&response), "/");
    let cookies = set_cookies(&response);

    let mut consent: Vec<(&str, &str)> = authorize_params.to_vec();
    consent.push(("csrf_token", cookies["authgate_csrf"].as_str()));
    consent.push(("decision", "deny"));
    let response = server
        .post("/oauth/authorize")
        .add_header(header::COOKIE, cookie_header(&cookies))
        .form(&consent)
        .await;
    assert_eq!(response.status_code(), StatusCode::SEE_OTHER);
    let redirect = Url::parse(&location(&response)).unwrap();
    let params: HashMap<String, String> = redirect.query_pairs().into_owned().collect();
    assert_eq!(params["error"], "access_denied");
    assert_eq!(params["state"], "abc");
}

#[tokio::test]
async fn test_unregistered_redirect_uri_is_not_followed() {
    let server = test_server(false).await;
    let response = server
        .get("/oauth/authorize")
        .add_query_params(&[
            ("response_type", "code"),
            ("client_id", "pkce-client-1"),
            ("redirect_uri", "https://evil.example/cb"),
            ("code_challenge", VERIFIER),
            ("code_challenge_method", "S256"),
        ])
        .await;

    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    assert!(response.headers().get(header::LOCATION).is_none());
}
