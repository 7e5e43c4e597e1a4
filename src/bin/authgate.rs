//! authgate server binary.
//!
//! Wires configuration, storage, signing keys, and the token validation strategy into the
//! HTTP router, then serves until SIGINT or SIGTERM.

use anyhow::Result;
use authgate::{
    clock::{SharedClock, system_clock},
    config::{Config, TokenValidationMode},
    http::{AppEngine, AppState, WebSettings, build_router},
    oauth::{
        AuthorizationCodeStore, AuthorizationServer, ClientMetadata, ClientRegistry,
        IntrospectionVerifier, JwksVerifier, KeyManager, LocalVerifier, MemoryUserDirectory,
        RateLimiter, RefreshTokenStore, ServerSettings, SessionManager, TokenCodec, TokenService,
        TokenSettings, TokenValidator, TokenVerifier, keys::generate_private_key_pem,
        users::UserSeed, validator::IntrospectionCredentials,
    },
    storage::{Store, create_store, parse_storage_backend},
    templates::build_env,
};
use clap::{Parser, Subcommand};
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[command(name = "authgate", version = authgate_version(), about = "OAuth 2.0 authorization server")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server (default)
    Serve,
    /// Write a new PKCS#8 RSA signing key
    GenerateKey {
        /// Destination file; stdout when omitted
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

fn authgate_version() -> &'static str {
    option_env!("GIT_HASH").unwrap_or(env!("CARGO_PKG_VERSION"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "authgate=debug,info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().pretty())
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve().await,
        Command::GenerateKey { out } => {
            let pem = generate_private_key_pem()?;
            match out {
                Some(path) => {
                    std::fs::write(&path, pem)?;
                    tracing::info!(path = %path.display(), "wrote signing key");
                }
                None => print!("{pem}"),
            }
            Ok(())
        }
    }
}

async fn serve() -> Result<()> {
    let version = authgate::config::version()?;
    tracing::info!(?version, "Starting authgate");

    let config = Config::new()?;
    let clock = system_clock();

    let http_client = reqwest::Client::builder()
        .user_agent(config.user_agent.clone())
        .timeout(*config.http_client_timeout.as_ref())
        .build()?;

    let template_env = AppEngine::from(build_env(
        config.external_base.clone(),
        config.version.clone(),
    ));

    let storage_backend =
        parse_storage_backend(&config.storage_backend, config.redis_url.as_deref())?;
    let store = create_store(storage_backend, clock.clone())?;

    let keys = Arc::new(KeyManager::load_or_generate(
        config.signing_key_path.as_deref(),
    )?);
    let codec = TokenCodec::new(keys.clone(), config.external_base.clone(), clock.clone());

    let supported_scopes = config.supported_scopes.as_ref().clone();
    let clients = ClientRegistry::new(store.clone(), clock.clone(), supported_scopes.clone());
    let codes = AuthorizationCodeStore::new(
        store.clone(),
        clock.clone(),
        *config.authorization_code_expiration.as_ref(),
    );
    let refresh_tokens = RefreshTokenStore::new(
        store.clone(),
        clock.clone(),
        *config.refresh_token_expiration.as_ref(),
    );
    let tokens = TokenService::new(
        codec.clone(),
        refresh_tokens,
        TokenSettings {
            resource_uri: config.resource_uri.clone(),
            access_token_ttl: *config.access_token_expiration.as_ref(),
            rotate_refresh_tokens: *config.refresh_token_rotation.as_ref(),
        },
    );
    let rate_limiter = RateLimiter::new(
        store.clone(),
        *config.rate_limit_max_attempts.as_ref(),
        *config.rate_limit_window.as_ref(),
    );

    let users = Arc::new(MemoryUserDirectory::new());
    seed_clients(&clients, config.bootstrap_clients_path.as_ref()).await?;
    seed_users(&users, config.bootstrap_users_path.as_ref())?;

    let settings = ServerSettings {
        issuer: config.external_base.clone(),
        resource_uri: config.resource_uri.clone(),
        supported_scopes,
        path_prefix: config.oauth_path_prefix.as_ref().to_string(),
        registration_enabled: *config.enable_client_registration.as_ref(),
    };
    let auth_server = Arc::new(AuthorizationServer::new(
        clients,
        codes,
        tokens,
        users,
        rate_limiter,
        settings,
    ));

    let validator = Arc::new(build_validator(&config, codec, http_client, clock.clone()));

    let app_context = AppState {
        auth_server,
        sessions: SessionManager::new(
            store.clone(),
            clock.clone(),
            *config.session_expiration.as_ref(),
        ),
        validator: validator.clone(),
        keys,
        template_env,
        web: WebSettings {
            external_base: config.external_base.clone(),
            secure_cookies: config.secure_cookies(),
            api_required_scopes: vec!["mcp.read".to_string()],
        },
    };

    let app = build_router(app_context);

    // Setup graceful shutdown
    let tracker = TaskTracker::new();
    let token = CancellationToken::new();

    {
        let tracker = tracker.clone();
        let inner_token = token.clone();

        let ctrl_c = async {
            if let Err(err) = signal::ctrl_c().await {
                tracing::error!("failed to install Ctrl+C handler: {}", err);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(err) => {
                    tracing::error!("failed to install signal handler: {}", err);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::spawn(async move {
            tokio::select! {
                () = inner_token.cancelled() => { },
                _ = terminate => {},
                _ = ctrl_c => {},
            }

            tracker.close();
            inner_token.cancel();
        });
    }

    // Periodic purge of expired records and cached validations
    {
        let store = store.clone();
        let validator = validator.clone();
        let interval = *config.cleanup_interval.as_ref();
        let inner_token = token.clone();
        tracker.spawn(async move {
            run_cleanup(store, validator, interval, inner_token).await;
        });
    }

    // Start HTTP server
    {
        let http_port = *config.http_port.as_ref();
        let inner_token = token.clone();
        tracker.spawn(async move {
            let bind_address = format!("0.0.0.0:{http_port}");
            tracing::info!("Starting server on {bind_address}");
            let listener = match TcpListener::bind(&bind_address).await {
                Ok(listener) => listener,
                Err(err) => {
                    tracing::error!("failed to bind {bind_address}: {}", err);
                    inner_token.cancel();
                    return;
                }
            };

            let shutdown_token = inner_token.clone();
            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
                .with_graceful_shutdown(async move {
                    tokio::select! {
                        () = shutdown_token.cancelled() => { }
                    }
                    tracing::info!("axum graceful shutdown complete");
                })
                .await;
            if let Err(err) = result {
                tracing::error!("axum task failed: {}", err);
            }

            inner_token.cancel();
        });
    }

    tracker.wait().await;

    Ok(())
}

fn build_validator(
    config: &Config,
    codec: TokenCodec,
    http_client: reqwest::Client,
    clock: SharedClock,
) -> TokenValidator {
    let verifier: Option<Arc<dyn TokenVerifier>> = match &config.token_validation_mode {
        TokenValidationMode::Local => Some(Arc::new(LocalVerifier::new(codec))),
        TokenValidationMode::Jwks { jwks_uri } => Some(Arc::new(JwksVerifier::new(
            http_client,
            jwks_uri.clone(),
            None,
            clock.clone(),
        ))),
        TokenValidationMode::Introspection {
            endpoint,
            client_id,
            client_secret,
        } => Some(Arc::new(IntrospectionVerifier::new(
            http_client,
            endpoint.clone(),
            IntrospectionCredentials {
                client_id: client_id.clone(),
                client_secret: client_secret.clone(),
            },
            *config.introspection_timeout.as_ref(),
            clock.clone(),
        ))),
        TokenValidationMode::None => None,
    };

    TokenValidator::new(
        verifier,
        Some(config.resource_uri.clone()),
        *config.validation_cache_ttl.as_ref(),
        clock,
    )
}

async fn seed_clients(clients: &ClientRegistry, path: Option<&PathBuf>) -> Result<()> {
    let Some(path) = path else {
        return Ok(());
    };
    let raw = std::fs::read_to_string(path)?;
    let seeds: Vec<ClientMetadata> = serde_json::from_str(&raw)?;
    for metadata in seeds {
        if let Some(client) = clients.seed(metadata).await? {
            tracing::info!(client_id = %client.client_id, "seeded client");
        }
    }
    Ok(())
}

fn seed_users(users: &MemoryUserDirectory, path: Option<&PathBuf>) -> Result<()> {
    let Some(path) = path else {
        tracing::warn!("no BOOTSTRAP_USERS_PATH configured; nobody can sign in");
        return Ok(());
    };
    let raw = std::fs::read_to_string(path)?;
    let seeds: Vec<UserSeed> = serde_json::from_str(&raw)?;
    for seed in seeds {
        let user = users.add_user(seed)?;
        tracing::info!(user_id = %user.id, "seeded user");
    }
    Ok(())
}

async fn run_cleanup(
    store: Arc<dyn Store>,
    validator: Arc<TokenValidator>,
    interval: std::time::Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = token.cancelled() => break,
            _ = ticker.tick() => {
                match store.purge_expired().await {
                    Ok(purged) if purged > 0 => tracing::debug!(purged, "purged expired records"),
                    Ok(_) => {}
                    Err(err) => tracing::error!(error = %err, "store cleanup failed"),
                }
                let evicted = validator.purge_cache();
                if evicted > 0 {
                    tracing::debug!(evicted, "evicted cached validations");
                }
            }
        }
    }
}
