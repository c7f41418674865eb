//! Courier API server binary entrypoint.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use courier_common::config::AppConfig;
use courier_common::db::{create_pool, run_migrations};
use courier_common::redis_pool::create_redis_pool;
use courier_engine::ratelimit::RedisCounterStore;
use courier_engine::repository::PgStore;
use courier_engine::{DispatchConfig, Dispatcher, RateLimiter, Telemetry};
use courier_notifier::{EmailProvider, GatewayClient, PushProvider, SmsProvider, WebhookProvider};

use courier_api::routes::create_router;
use courier_api::state::AppState;

/// Upper bound on one outbound gateway call.
const GATEWAY_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("courier_api=debug,courier_engine=debug,tower_http=debug")
        }))
        .init();

    tracing::info!("Starting Courier API server...");

    let config = AppConfig::from_env()?;
    tracing::info!(
        trust_gateway_headers = config.trust_gateway_headers,
        trust_proxy_headers = config.trust_proxy_headers,
        "Caller identification configured"
    );

    let pool = create_pool(&config.database_url, config.db_max_connections).await?;
    run_migrations(&pool).await?;
    tracing::info!("Database pool created, migrations applied");

    let redis = create_redis_pool(&config.redis_url).await?;
    tracing::info!("Redis connection established");

    let store_timeout = Duration::from_millis(config.store_timeout_ms);
    let rate_limiter = RateLimiter::new(
        Arc::new(RedisCounterStore::new(redis, store_timeout)),
        config.service_name.clone(),
        config.rate_limit_fail_open,
    );

    let store = Arc::new(PgStore::new(pool));
    let dispatcher = Dispatcher::new(
        store.clone(),
        store.clone(),
        store,
        rate_limiter.clone(),
        Arc::new(Telemetry::new()),
        DispatchConfig {
            max_concurrent_recipients: config.max_concurrent_recipients,
            max_concurrent_deliveries: config.max_concurrent_deliveries,
            store_timeout,
            ..Default::default()
        },
    );
    register_providers(&dispatcher, &config)?;

    let addr: SocketAddr = config.bind_addr.parse()?;
    let state = AppState::new(dispatcher, rate_limiter, config);

    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    tracing::info!("API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

/// Register a provider for every channel the configuration enables.
fn register_providers(dispatcher: &Dispatcher, config: &AppConfig) -> anyhow::Result<()> {
    let client = GatewayClient::new(GATEWAY_TIMEOUT)?;

    match &config.email_gateway_url {
        Some(url) => dispatcher.register_provider(Arc::new(EmailProvider::new(
            client.clone(),
            url.clone(),
            config.email_api_key.clone(),
            config.email_from.clone().unwrap_or_default(),
        ))),
        None => tracing::warn!("EMAIL_GATEWAY_URL not set, email delivery disabled"),
    }

    match &config.sms_gateway_url {
        Some(url) => {
            dispatcher.register_provider(Arc::new(SmsProvider::new(client.clone(), url.clone())))
        }
        None => tracing::warn!("SMS_GATEWAY_URL not set, SMS delivery disabled"),
    }

    match &config.push_gateway_url {
        Some(url) => {
            dispatcher.register_provider(Arc::new(PushProvider::new(client.clone(), url.clone())))
        }
        None => tracing::warn!("PUSH_GATEWAY_URL not set, push delivery disabled"),
    }

    dispatcher.register_provider(Arc::new(WebhookProvider::new(
        client,
        config.webhook_enabled,
    )));

    tracing::info!(channels = ?dispatcher.available_channels(), "Channel providers ready");
    Ok(())
}
