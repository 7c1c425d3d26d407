//! Signal pipeline server.
//!
//! Composition root: wires the Redis queue, the exchange registry, the
//! webhook ingress and the worker pool together, then serves HTTP until
//! interrupted. Strategy and key storage default to the in-memory demo
//! implementations; deployments with real storage embed the library and
//! inject their own `StrategyStore` / `KeyStore`.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use signalpipe::application::ingress::SignalIngress;
use signalpipe::application::signal_processor::SignalProcessor;
use signalpipe::config::Config;
use signalpipe::domain::ports::{
    ExchangeCredentials, ExchangeRegistry, KeyStore, NotificationSink, SignalQueue, Strategy,
    StrategyStore, Subscription,
};
use signalpipe::infrastructure::exchanges::VenueRegistry;
use signalpipe::infrastructure::mock::{InMemoryKeyStore, InMemoryStrategyStore};
use signalpipe::infrastructure::queue::RedisSignalQueue;
use signalpipe::infrastructure::sink::LogNotificationSink;
use signalpipe::interfaces::http::{AppState, RateLimiter, router};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Signalpipe {} starting...", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    info!(
        "Configuration loaded: workers={}, redis={}, execution budget={}ms",
        config.worker_count, config.redis_url, config.max_execution_time_ms
    );

    // 1. Queue. Signals stranded in processing by a previous crash are
    //    re-queued before any worker starts.
    let queue: Arc<dyn SignalQueue> = Arc::new(RedisSignalQueue::from_url(&config.redis_url).await?);
    let recovered = queue.recover_processing(config.recovery_max_age()).await?;
    if recovered > 0 {
        warn!("Recovered {} signals stuck in processing", recovered);
    }

    // 2. Collaborator stores (in-memory demo implementations).
    let strategy_store = InMemoryStrategyStore::new();
    let key_store = InMemoryKeyStore::new();
    if let Some(token) = &config.demo_webhook_token {
        seed_demo(&strategy_store, &key_store, token).await;
    }
    let strategies: Arc<dyn StrategyStore> = Arc::new(strategy_store);
    let keys: Arc<dyn KeyStore> = Arc::new(key_store);

    // 3. Venue registry and notification sink.
    let exchanges: Arc<dyn ExchangeRegistry> = Arc::new(VenueRegistry::new(
        config.binance_base_url.clone(),
        config.default_slippage_percent,
    ));
    let sink: Arc<dyn NotificationSink> = Arc::new(LogNotificationSink::new());

    // 4. Ingress + worker pool.
    let ingress = Arc::new(SignalIngress::new(
        strategies.clone(),
        queue.clone(),
        sink.clone(),
        config.dedup_ttl(),
    ));
    let processor = Arc::new(SignalProcessor::new(
        queue.clone(),
        strategies,
        keys,
        exchanges,
        sink,
        config.max_execution(),
    ));
    let workers = processor.start(config.worker_count);

    // 5. HTTP server.
    let state = AppState {
        ingress,
        queue,
        limiter: Arc::new(RateLimiter::new(config.webhook_rate_limit)),
    };
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(config.bind_addr())
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr()))?;
    info!("Webhook server listening on {}", config.bind_addr());

    tokio::spawn(async move {
        if let Err(e) = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        {
            error!("HTTP server failed: {}", e);
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;

    warn!("Shutdown signal received, stopping gracefully");
    workers.stop().await;
    info!("Signalpipe shut down complete.");
    Ok(())
}

/// Seed a demo strategy, subscriber and key against the mock venue.
async fn seed_demo(strategies: &InMemoryStrategyStore, keys: &InMemoryKeyStore, token: &str) {
    strategies
        .insert_strategy(Strategy {
            id: "demo-strategy".into(),
            name: "Demo strategy".into(),
            webhook_token: token.into(),
            exchange: "mock".into(),
            is_active: true,
        })
        .await;
    strategies
        .insert_subscription(Subscription {
            id: "demo-subscription".into(),
            user_id: "demo-user".into(),
            strategy_id: "demo-strategy".into(),
            auto_trade: true,
            exchange_key_id: Some("demo-key".into()),
            is_active: true,
        })
        .await;
    keys.insert(
        "demo-user",
        "mock",
        ExchangeCredentials {
            api_key: "demo".into(),
            api_secret: "demo".into(),
            passphrase: None,
            key_id: "demo-key".into(),
        },
    )
    .await;
    info!("Demo strategy seeded (strategy_id=demo-strategy, exchange=mock)");
}
