//! Ingress authentication and validation behaviour, without workers.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;

use signalpipe::application::ingress::{SignalIngress, WebhookSignal};
use signalpipe::domain::errors::IngressError;
use signalpipe::domain::ports::{
    NotificationSink, SignalQueue, SignalRecordStatus, Strategy, StrategyStore, Subscription,
};
use signalpipe::infrastructure::mock::{
    InMemorySignalQueue, InMemoryStrategyStore, RecordingSink,
};

const TOKEN: &str = "T0123456789abcdef";

struct Harness {
    queue: InMemorySignalQueue,
    store: InMemoryStrategyStore,
    ingress: SignalIngress,
}

async fn harness() -> Harness {
    let queue = InMemorySignalQueue::new();
    let store = InMemoryStrategyStore::new();
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
    store
        .insert_strategy(Strategy {
            id: "strat-retired".into(),
            name: "Retired".into(),
            webhook_token: TOKEN.into(),
            exchange: "mock".into(),
            is_active: false,
        })
        .await;
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

    let store_port: Arc<dyn StrategyStore> = Arc::new(store.clone());
    let queue_port: Arc<dyn SignalQueue> = Arc::new(queue.clone());
    let sink_port: Arc<dyn NotificationSink> = Arc::new(sink.clone());
    let ingress = SignalIngress::new(
        store_port,
        queue_port,
        sink_port,
        Duration::from_secs(30),
    );

    Harness {
        queue,
        store,
        ingress,
    }
}

fn payload(strategy_id: &str, secret: Option<&str>) -> WebhookSignal {
    WebhookSignal {
        strategy_id: strategy_id.into(),
        secret: secret.map(String::from),
        symbol: "eth/usdt".into(),
        action: "long_entry".into(),
        price: Some("2000".into()),
        stop_loss: Some("1960".into()),
        take_profit: None,
        quantity: None,
        leverage: Some(3),
    }
}

#[tokio::test]
async fn unknown_strategy_is_not_found() {
    let h = harness().await;
    let err = h
        .ingress
        .ingest(payload("strat-missing", Some(TOKEN)), b"{}", None, "ip")
        .await
        .unwrap_err();
    assert!(matches!(err, IngressError::StrategyNotFound));
}

#[tokio::test]
async fn inactive_strategy_is_rejected() {
    let h = harness().await;
    let err = h
        .ingress
        .ingest(payload("strat-retired", Some(TOKEN)), b"{}", None, "ip")
        .await
        .unwrap_err();
    assert!(matches!(err, IngressError::StrategyInactive));
}

#[tokio::test]
async fn short_or_missing_secret_is_unauthorized() {
    let h = harness().await;

    let err = h
        .ingress
        .ingest(payload("strat-1", Some("short")), b"{}", None, "ip")
        .await
        .unwrap_err();
    assert!(matches!(err, IngressError::InvalidSecret));

    let err = h
        .ingress
        .ingest(payload("strat-1", None), b"{}", None, "ip")
        .await
        .unwrap_err();
    assert!(matches!(err, IngressError::InvalidSecret));
}

#[tokio::test]
async fn wrong_secret_is_unauthorized() {
    let h = harness().await;
    let err = h
        .ingress
        .ingest(
            payload("strat-1", Some("X0123456789abcdef")),
            b"{}",
            None,
            "ip",
        )
        .await
        .unwrap_err();
    assert!(matches!(err, IngressError::InvalidSecret));
}

#[tokio::test]
async fn hmac_signature_replaces_payload_secret() {
    let h = harness().await;

    let body = br#"{"strategy_id":"strat-1","symbol":"ETHUSDT","action":"long_entry"}"#;
    let mut mac = Hmac::<Sha256>::new_from_slice(TOKEN.as_bytes()).unwrap();
    mac.update(body);
    let signature = hex::encode(mac.finalize().into_bytes());

    let outcome = h
        .ingress
        .ingest(payload("strat-1", None), body, Some(&signature), "ip")
        .await
        .unwrap();
    assert_eq!(outcome.queued, 1);

    // A tampered body fails verification.
    let err = h
        .ingress
        .ingest(
            payload("strat-1", None),
            b"tampered",
            Some(&signature),
            "ip",
        )
        .await
        .unwrap_err();
    assert!(matches!(err, IngressError::InvalidSecret));
}

#[tokio::test]
async fn invalid_action_and_leverage_are_validation_errors() {
    let h = harness().await;

    let mut bad_action = payload("strat-1", Some(TOKEN));
    bad_action.action = "hold".into();
    let err = h
        .ingress
        .ingest(bad_action, b"{}", None, "ip")
        .await
        .unwrap_err();
    assert!(matches!(err, IngressError::Validation(_)));

    let mut bad_leverage = payload("strat-1", Some(TOKEN));
    bad_leverage.leverage = Some(126);
    let err = h
        .ingress
        .ingest(bad_leverage, b"{}", None, "ip")
        .await
        .unwrap_err();
    assert!(matches!(err, IngressError::Validation(_)));
}

#[tokio::test]
async fn malformed_decimal_is_a_price_error() {
    let h = harness().await;
    let mut bad_price = payload("strat-1", Some(TOKEN));
    bad_price.stop_loss = Some("nineteen-sixty".into());
    let err = h
        .ingress
        .ingest(bad_price, b"{}", None, "ip")
        .await
        .unwrap_err();
    assert!(matches!(err, IngressError::InvalidPrice(_)));
}

#[tokio::test]
async fn symbol_is_normalized_before_enqueue() {
    let h = harness().await;

    h.ingress
        .ingest(payload("strat-1", Some(TOKEN)), b"{}", None, "ip")
        .await
        .unwrap();

    let queued = h
        .queue
        .dequeue(Duration::ZERO)
        .await
        .unwrap()
        .expect("signal should be queued");
    assert_eq!(queued.symbol, "ETHUSDT");
    assert_eq!(queued.leverage, 3);
}

#[tokio::test]
async fn no_subscribers_records_signal_and_queues_nothing() {
    let h = harness().await;

    // Retire the only subscriber by using a strategy with none.
    h.store
        .insert_strategy(Strategy {
            id: "strat-lonely".into(),
            name: "No followers".into(),
            webhook_token: TOKEN.into(),
            exchange: "mock".into(),
            is_active: true,
        })
        .await;

    let outcome = h
        .ingress
        .ingest(payload("strat-lonely", Some(TOKEN)), b"{}", None, "ip")
        .await
        .unwrap();
    assert_eq!(outcome.subscribers, 0);
    assert!(!outcome.queued_any());
    assert_eq!(h.queue.stats().await.unwrap().queued, 0);

    // The signal is still recorded for the audit trail, without a user.
    let records = h.store.records().await;
    let record = records
        .iter()
        .find(|r| r.strategy_id == "strat-lonely")
        .expect("signal should be recorded");
    assert!(record.user_id.is_none());
    assert_eq!(record.status, SignalRecordStatus::Received);
}

#[tokio::test]
async fn subscriber_check_short_circuits_before_price_parsing() {
    let h = harness().await;

    h.store
        .insert_strategy(Strategy {
            id: "strat-lonely".into(),
            name: "No followers".into(),
            webhook_token: TOKEN.into(),
            exchange: "mock".into(),
            is_active: true,
        })
        .await;

    // A malformed price that would be a 400 for a subscribed strategy is
    // never parsed when there is nobody to fan out to.
    let mut bad_price = payload("strat-lonely", Some(TOKEN));
    bad_price.price = Some("not-a-number".into());

    let outcome = h
        .ingress
        .ingest(bad_price, b"{}", None, "ip")
        .await
        .expect("zero-subscriber delivery must succeed regardless of price");
    assert_eq!(outcome.subscribers, 0);
    assert!(!outcome.queued_any());
    assert_eq!(h.queue.stats().await.unwrap().queued, 0);

    // The audit record still lands, minus the unparseable price.
    let records = h.store.records().await;
    let record = records
        .iter()
        .find(|r| r.strategy_id == "strat-lonely")
        .expect("signal should be recorded");
    assert!(record.user_id.is_none());
    assert!(record.price.is_none());
    assert_eq!(record.stop_loss, Some(rust_decimal_macros::dec!(1960)));
}

#[tokio::test]
async fn per_user_signal_ids_derive_from_request_id() {
    let h = harness().await;

    let outcome = h
        .ingress
        .ingest(payload("strat-1", Some(TOKEN)), b"{}", None, "ip")
        .await
        .unwrap();

    let queued = h.queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
    assert_eq!(
        queued.signal_id,
        format!("{}:user-1", outcome.request_id)
    );
    assert_eq!(
        h.store.record_status(&queued.signal_id).await,
        Some(SignalRecordStatus::Queued)
    );
}
