use std::sync::Arc;

use anyhow::Context;
use axum::http::{
    header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE},
    HeaderName, HeaderValue, Method,
};
use identity_core::{
    Authenticator, KeyManager, RedisSessionStore, Repositories, SessionCache, TokenService,
};
use identity_service::config::load_service_config;
use identity_service::handlers::APPLICATION_HEADER;
use identity_service::metrics::IdentityMetrics;
use identity_service::pg::PgDirectory;
use identity_service::{build_router, AppState};
use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = load_service_config()?;

    let keys = Arc::new(KeyManager::load(&config.keys).context("Failed to load signing keys")?);
    let tokens = TokenService::new(keys, config.jwt.clone());

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to Postgres")?;
    let directory = Arc::new(PgDirectory::new(pool));
    directory
        .apply_schema()
        .await
        .context("Failed to apply identity schema")?;

    let store = RedisSessionStore::connect(&config.redis.url())
        .await
        .context("Failed to connect to Redis")?;
    let sessions = SessionCache::new(Arc::new(store), &config.session);

    let authenticator = Authenticator::new(Repositories::from_backend(directory), tokens, sessions);
    let metrics = Arc::new(IdentityMetrics::new()?);
    let state = AppState::new(authenticator, metrics, config.request_timeout);

    let origins = config
        .cors_origins
        .iter()
        .map(|origin| {
            HeaderValue::from_str(origin).with_context(|| format!("Invalid CORS origin '{origin}'"))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            ACCEPT,
            CONTENT_TYPE,
            AUTHORIZATION,
            HeaderName::from_static(APPLICATION_HEADER),
        ]);

    let app = build_router(state).layer(cors);

    info!(addr = %config.listen_addr, issuer = %config.jwt.issuer, "starting identity-service");
    let listener = TcpListener::bind(config.listen_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
