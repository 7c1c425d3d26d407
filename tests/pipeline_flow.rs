//! End-to-end pipeline scenarios: ingress -> queue -> worker -> executor
//! against the mock venue and in-memory stores.

use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;

use signalpipe::application::ingress::{SignalIngress, WebhookSignal};
use signalpipe::application::signal_processor::{ProcessorHandle, SignalProcessor};
use signalpipe::domain::errors::ExchangeError;
use signalpipe::domain::ports::{
    DailyStats, ExchangeCredentials, ExchangeRegistry, KeyStore, NotificationEvent,
    NotificationSink, SignalQueue, SignalRecordStatus, Strategy, StrategyStore, Subscription,
};
use signalpipe::domain::signal::ExecutionStatus;
use signalpipe::domain::trading::{OrderSide, OrderType, Position, PositionSide};
use signalpipe::infrastructure::mock::{
    InMemoryKeyStore, InMemorySignalQueue, InMemoryStrategyStore, MockExchangeAdapter,
    MockExchangeRegistry, RecordingSink,
};

const TOKEN: &str = "T0123456789abcdef";

struct Pipeline {
    queue: InMemorySignalQueue,
    store: InMemoryStrategyStore,
    keys: InMemoryKeyStore,
    venue: MockExchangeAdapter,
    sink: RecordingSink,
    ingress: Arc<SignalIngress>,
    workers: ProcessorHandle,
}

async fn pipeline() -> Pipeline {
    let queue = InMemorySignalQueue::new();
    let store = InMemoryStrategyStore::new();
    let keys = InMemoryKeyStore::new();
    let venue = MockExchangeAdapter::new();
    let sink = RecordingSink::new();

    store
        .insert_strategy(Strategy {
            id: "strat-1".into(),
            name: "Momentum breakout".into(),
            webhook_token: TOKEN.into(),
            exchange: "mock".into(),
            is_active: true,
        })
        .await;
    // user-1 auto-trades, user-2 only watches.
    store
        .insert_subscription(Subscription {
            id: "sub-1".into(),
            user_id: "user-1".into(),
            strategy_id: "strat-1".into(),
            auto_trade: true,
            exchange_key_id: Some("key-1".into()),
            is_active: true,
        })
        .await;
    store
        .insert_subscription(Subscription {
            id: "sub-2".into(),
            user_id: "user-2".into(),
            strategy_id: "strat-1".into(),
            auto_trade: false,
            exchange_key_id: None,
            is_active: true,
        })
        .await;
    keys.insert(
        "user-1",
        "mock",
        ExchangeCredentials {
            api_key: "k".into(),
            api_secret: "s".into(),
            passphrase: None,
            key_id: "key-1".into(),
        },
    )
    .await;

    venue.set_ticker("ETHUSDT", dec!(2000)).await;
    venue.set_ticker("BTCUSDT", dec!(50000)).await;

    let queue_port: Arc<dyn SignalQueue> = Arc::new(queue.clone());
    let store_port: Arc<dyn StrategyStore> = Arc::new(store.clone());
    let keys_port: Arc<dyn KeyStore> = Arc::new(keys.clone());
    let sink_port: Arc<dyn NotificationSink> = Arc::new(sink.clone());
    let registry: Arc<dyn ExchangeRegistry> =
        Arc::new(MockExchangeRegistry::new(venue.clone()));

    let ingress = Arc::new(SignalIngress::new(
        store_port.clone(),
        queue_port.clone(),
        sink_port.clone(),
        Duration::from_secs(30),
    ));
    let processor = Arc::new(SignalProcessor::new(
        queue_port,
        store_port,
        keys_port,
        registry,
        sink_port,
        Duration::from_secs(2),
    ));
    let workers = processor.start(2);

    Pipeline {
        queue,
        store,
        keys,
        venue,
        sink,
        ingress,
        workers,
    }
}

fn entry_payload() -> WebhookSignal {
    WebhookSignal {
        strategy_id: "strat-1".into(),
        secret: Some(TOKEN.into()),
        symbol: "ETHUSDT".into(),
        action: "long_entry".into(),
        price: Some("2000".into()),
        stop_loss: Some("1960".into()),
        take_profit: Some("2080".into()),
        quantity: None,
        leverage: Some(3),
    }
}

fn exit_payload() -> WebhookSignal {
    WebhookSignal {
        strategy_id: "strat-1".into(),
        secret: Some(TOKEN.into()),
        symbol: "BTCUSDT".into(),
        action: "long_exit".into(),
        price: None,
        stop_loss: None,
        take_profit: None,
        quantity: None,
        leverage: None,
    }
}

async fn wait_for<F, Fut>(what: &str, mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !cond().await {
        assert!(
            std::time::Instant::now() < deadline,
            "timed out waiting for {}",
            what
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn happy_path_entry_places_order_with_protective_brackets() {
    let p = pipeline().await;

    let outcome = p
        .ingress
        .ingest(entry_payload(), b"{}", None, "10.0.0.1")
        .await
        .unwrap();
    // Only the auto-trade subscriber gets a copy.
    assert_eq!(outcome.subscribers, 1);
    assert_eq!(outcome.queued, 1);
    assert!(outcome.queued_any());

    let sink = p.sink.clone();
    wait_for("trade execution", || {
        let sink = sink.clone();
        async move {
            !sink
                .events_of(NotificationEvent::TradeExecuted)
                .await
                .is_empty()
        }
    })
    .await;

    // Balance 10000, risk 2% over a 40-point stop -> 5, capped by the $1000
    // position limit to 0.5.
    let orders = p.venue.placed_orders().await;
    assert_eq!(orders.len(), 3);

    assert_eq!(orders[0].side, OrderSide::Buy);
    assert_eq!(orders[0].order_type, OrderType::Market);
    assert_eq!(orders[0].quantity, dec!(0.5));
    assert_eq!(orders[0].leverage, 3);
    assert!(!orders[0].reduce_only);

    assert_eq!(orders[1].side, OrderSide::Sell);
    assert_eq!(orders[1].order_type, OrderType::StopMarket);
    assert_eq!(orders[1].stop_price, Some(dec!(1960)));
    assert!(orders[1].reduce_only);

    assert_eq!(orders[2].side, OrderSide::Sell);
    assert_eq!(orders[2].order_type, OrderType::Limit);
    assert_eq!(orders[2].price, Some(dec!(2080)));
    assert!(orders[2].reduce_only);

    // Terminal state: nothing queued, nothing dead, record marked executed.
    let stats = p.queue.stats().await.unwrap();
    assert_eq!(stats.queued, 0);
    assert_eq!(stats.processing, 0);
    assert_eq!(stats.dead_letter, 0);

    let signal_id = format!("{}:user-1", outcome.request_id);
    assert_eq!(
        p.store.record_status(&signal_id).await,
        Some(SignalRecordStatus::Executed)
    );
    assert_eq!(p.keys.used_keys().await, vec!["key-1"]);

    let executed = p.sink.events_of(NotificationEvent::TradeExecuted).await;
    assert_eq!(executed[0].0, "user-1");
    assert_eq!(executed[0].1["status"], "filled");
}

#[tokio::test]
async fn duplicate_webhook_within_window_is_deduplicated() {
    let p = pipeline().await;

    let first = p
        .ingress
        .ingest(entry_payload(), b"{}", None, "10.0.0.1")
        .await
        .unwrap();
    assert!(first.queued_any());

    let second = p
        .ingress
        .ingest(entry_payload(), b"{}", None, "10.0.0.1")
        .await
        .unwrap();
    assert!(!second.queued_any());
    assert_eq!(second.deduplicated, 1);
    assert!(second.message().contains("deduplicated"));
}

#[tokio::test]
async fn daily_loss_breach_rejects_without_retry() {
    let p = pipeline().await;

    // Realized -1000 on a 10000 balance = 10% daily loss, at the limit.
    p.store
        .set_daily_stats(
            "user-1",
            DailyStats {
                trades: 3,
                realized_pnl: dec!(-1000),
            },
        )
        .await;

    let outcome = p
        .ingress
        .ingest(entry_payload(), b"{}", None, "10.0.0.1")
        .await
        .unwrap();

    let queue = p.queue.clone();
    wait_for("dead letter entry", || {
        let queue = queue.clone();
        async move { queue.stats().await.unwrap().dead_letter == 1 }
    })
    .await;

    // Risk rejections never reach the venue and never retry.
    assert!(p.venue.placed_orders().await.is_empty());
    let snap = p.queue.snapshot().await;
    assert_eq!(snap.dead_letter.len(), 1);
    assert!(snap.dead_letter[0].error.starts_with("Daily loss limit"));
    assert_eq!(snap.dead_letter[0].signal.retry_count, 0);

    let signal_id = format!("{}:user-1", outcome.request_id);
    assert_eq!(
        p.store.record_status(&signal_id).await,
        Some(SignalRecordStatus::Failed)
    );
    let result = p.store.execution_result(&signal_id).await.unwrap();
    assert_eq!(result.status, ExecutionStatus::RiskCheckFailed);

    let rejections = p.sink.events_of(NotificationEvent::OrderUpdate).await;
    assert_eq!(rejections.len(), 1);
    assert_eq!(rejections[0].1["status"], "rejected");
}

#[tokio::test]
async fn rate_limited_entry_retries_then_dead_letters() {
    let p = pipeline().await;

    p.venue
        .fail_next_orders(vec![
            ExchangeError::RateLimit("too many requests".into()),
            ExchangeError::RateLimit("too many requests".into()),
            ExchangeError::RateLimit("too many requests".into()),
            ExchangeError::RateLimit("too many requests".into()),
        ])
        .await;

    p.ingress
        .ingest(entry_payload(), b"{}", None, "10.0.0.1")
        .await
        .unwrap();

    let queue = p.queue.clone();
    wait_for("retries to exhaust", || {
        let queue = queue.clone();
        async move { queue.stats().await.unwrap().dead_letter == 1 }
    })
    .await;

    let snap = p.queue.snapshot().await;
    assert!(snap.dead_letter[0].error.starts_with("RateLimitError"));
    assert_eq!(snap.dead_letter[0].signal.retry_count, 3);
}

#[tokio::test]
async fn exit_without_position_fails_without_retry() {
    let p = pipeline().await;

    p.ingress
        .ingest(exit_payload(), b"{}", None, "10.0.0.1")
        .await
        .unwrap();

    let queue = p.queue.clone();
    wait_for("dead letter entry", || {
        let queue = queue.clone();
        async move { queue.stats().await.unwrap().dead_letter == 1 }
    })
    .await;

    let snap = p.queue.snapshot().await;
    assert_eq!(snap.dead_letter[0].error, "No long position for BTCUSDT");
    assert_eq!(snap.dead_letter[0].signal.retry_count, 0);
    assert!(p.venue.placed_orders().await.is_empty());
}

#[tokio::test]
async fn exit_closes_position_reduce_only_and_reports_pnl() {
    let p = pipeline().await;

    p.venue
        .set_positions(vec![Position {
            symbol: "BTCUSDT".into(),
            side: PositionSide::Long,
            quantity: dec!(0.4),
            entry_price: dec!(48000),
            current_price: Some(dec!(50000)),
            unrealized_pnl: None,
            leverage: 3,
            liquidation_price: None,
            margin: None,
        }])
        .await;

    let outcome = p
        .ingress
        .ingest(exit_payload(), b"{}", None, "10.0.0.1")
        .await
        .unwrap();

    let sink = p.sink.clone();
    wait_for("trade execution", || {
        let sink = sink.clone();
        async move {
            !sink
                .events_of(NotificationEvent::TradeExecuted)
                .await
                .is_empty()
        }
    })
    .await;

    let orders = p.venue.placed_orders().await;
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].side, OrderSide::Sell);
    assert!(orders[0].reduce_only);
    assert_eq!(orders[0].quantity, dec!(0.4));

    // Filled at the 50000 ticker against a 48000 entry.
    let signal_id = format!("{}:user-1", outcome.request_id);
    let result = p.store.execution_result(&signal_id).await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Filled);
    assert_eq!(result.realized_pnl, Some(dec!(800)));
}

#[tokio::test]
async fn invalid_credentials_mark_key_and_dead_letter() {
    let p = pipeline().await;
    p.venue.set_credentials_valid(false).await;

    p.ingress
        .ingest(entry_payload(), b"{}", None, "10.0.0.1")
        .await
        .unwrap();

    let queue = p.queue.clone();
    wait_for("dead letter entry", || {
        let queue = queue.clone();
        async move { queue.stats().await.unwrap().dead_letter == 1 }
    })
    .await;

    assert!(p.keys.is_invalid("key-1").await);
    let snap = p.queue.snapshot().await;
    assert!(snap.dead_letter[0].error.contains("credentials"));
}

#[tokio::test]
async fn worker_pool_stops_gracefully() {
    let p = pipeline().await;

    tokio::time::timeout(Duration::from_secs(7), p.workers.stop())
        .await
        .expect("workers did not stop within the dequeue timeout");
}
