//! In-process implementations of the pipeline's ports.
//!
//! These back the test suite and the demo composition: a deterministic mock
//! venue with a configurable fill model, an in-memory queue with the same
//! scoring semantics as the Redis queue, and in-memory strategy/key stores.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{info, warn};

use crate::domain::errors::ExchangeError;
use crate::domain::ports::{
    DailyStats, ExchangeAdapter, ExchangeCredentials, ExchangeRegistry, KeyStore,
    NotificationEvent, NotificationSink, PositionTotals, QueueStats, SignalQueue, SignalRecord,
    SignalRecordStatus, StrategyStore, Strategy, Subscription, secret_matches,
};
use crate::domain::risk::RiskSettings;
use crate::domain::signal::{ExecutionResult, QueuePriority, QueuedSignal};
use crate::domain::trading::{
    Balance, OrderRequest, OrderResult, OrderStatus, OrderType, Position, Ticker,
};
use crate::infrastructure::queue::{queue_score, retry_backoff};

// =========================================================================
// Mock venue
// =========================================================================

#[derive(Default)]
struct MockVenueState {
    tickers: HashMap<String, Decimal>,
    balances: Vec<Balance>,
    positions: Vec<Position>,
    placed_orders: Vec<OrderRequest>,
    scripted_failures: VecDeque<ExchangeError>,
    leverage_calls: Vec<(String, u32)>,
    credentials_valid: bool,
    next_order_id: u64,
}

/// Deterministic venue: market orders fill immediately at the ticker price
/// adjusted by a flat slippage percentage. Clones share state so a test can
/// inspect orders placed through registry-created copies.
#[derive(Clone)]
pub struct MockExchangeAdapter {
    state: Arc<RwLock<MockVenueState>>,
    slippage_percent: Decimal,
    spot_only: bool,
}

impl MockExchangeAdapter {
    pub fn new() -> Self {
        let state = MockVenueState {
            balances: vec![Balance {
                asset: "USDT".into(),
                free: dec!(10000),
                locked: Decimal::ZERO,
                total: dec!(10000),
            }],
            credentials_valid: true,
            next_order_id: 1,
            ..MockVenueState::default()
        };
        Self {
            state: Arc::new(RwLock::new(state)),
            slippage_percent: Decimal::ZERO,
            spot_only: false,
        }
    }

    pub fn with_slippage(mut self, slippage_percent: Decimal) -> Self {
        self.slippage_percent = slippage_percent;
        self
    }

    pub fn spot_only(mut self) -> Self {
        self.spot_only = true;
        self
    }

    pub async fn set_ticker(&self, symbol: &str, price: Decimal) {
        self.state
            .write()
            .await
            .tickers
            .insert(symbol.to_string(), price);
    }

    pub async fn set_balance(&self, asset: &str, total: Decimal) {
        let mut state = self.state.write().await;
        state.balances.retain(|b| b.asset != asset);
        state.balances.push(Balance {
            asset: asset.to_string(),
            free: total,
            locked: Decimal::ZERO,
            total,
        });
    }

    pub async fn set_positions(&self, positions: Vec<Position>) {
        self.state.write().await.positions = positions;
    }

    pub async fn set_credentials_valid(&self, valid: bool) {
        self.state.write().await.credentials_valid = valid;
    }

    /// Queue an error for each upcoming `place_order` call.
    pub async fn fail_next_orders(&self, errors: Vec<ExchangeError>) {
        self.state.write().await.scripted_failures.extend(errors);
    }

    pub async fn placed_orders(&self) -> Vec<OrderRequest> {
        self.state.read().await.placed_orders.clone()
    }

    pub async fn leverage_calls(&self) -> Vec<(String, u32)> {
        self.state.read().await.leverage_calls.clone()
    }
}

impl Default for MockExchangeAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExchangeAdapter for MockExchangeAdapter {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn supports_futures(&self) -> bool {
        !self.spot_only
    }

    async fn connect(&mut self) -> Result<(), ExchangeError> {
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), ExchangeError> {
        Ok(())
    }

    async fn validate_credentials(&self) -> Result<bool, ExchangeError> {
        Ok(self.state.read().await.credentials_valid)
    }

    async fn get_ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError> {
        let symbol = self.normalize_symbol(symbol);
        let state = self.state.read().await;
        let last_price = state
            .tickers
            .get(&symbol)
            .copied()
            .ok_or_else(|| ExchangeError::Exchange(format!("no ticker for {}", symbol)))?;
        Ok(Ticker {
            symbol,
            last_price,
            bid: Some(last_price),
            ask: Some(last_price),
            volume_24h: None,
            change_24h: None,
        })
    }

    async fn get_balance(&self, asset: Option<&str>) -> Result<Vec<Balance>, ExchangeError> {
        let state = self.state.read().await;
        Ok(state
            .balances
            .iter()
            .filter(|b| asset.is_none_or(|a| b.asset == a))
            .cloned()
            .collect())
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderResult, ExchangeError> {
        let mut state = self.state.write().await;

        if let Some(error) = state.scripted_failures.pop_front() {
            return Err(error);
        }

        if order.leverage > 1 {
            state
                .leverage_calls
                .push((order.symbol.clone(), order.leverage));
        }

        let reference_price = order
            .price
            .or(order.stop_price)
            .or_else(|| state.tickers.get(&order.symbol).copied())
            .ok_or_else(|| {
                ExchangeError::InvalidOrder(format!("no price available for {}", order.symbol))
            })?;

        // Market fills slip against the taker; resting orders fill at their
        // own price.
        let fill_price = if order.order_type == OrderType::Market {
            let slip = reference_price * self.slippage_percent / dec!(100);
            match order.side {
                crate::domain::trading::OrderSide::Buy => reference_price + slip,
                crate::domain::trading::OrderSide::Sell => reference_price - slip,
            }
        } else {
            reference_price
        };

        let order_id = state.next_order_id;
        state.next_order_id += 1;
        state.placed_orders.push(order.clone());

        Ok(OrderResult {
            order_id: format!("mock-{}", order_id),
            status: OrderStatus::Filled,
            filled_quantity: order.quantity,
            avg_fill_price: Some(fill_price),
            fee: None,
            fee_currency: None,
        })
    }

    async fn cancel_order(&self, _order_id: &str, _symbol: &str) -> Result<bool, ExchangeError> {
        Ok(true)
    }

    async fn get_order(&self, order_id: &str, _symbol: &str) -> Result<OrderResult, ExchangeError> {
        Err(ExchangeError::InvalidOrder(format!(
            "Order not found: {}",
            order_id
        )))
    }

    async fn get_open_orders(
        &self,
        _symbol: Option<&str>,
    ) -> Result<Vec<OrderResult>, ExchangeError> {
        Ok(Vec::new())
    }

    async fn get_positions(&self, symbol: Option<&str>) -> Result<Vec<Position>, ExchangeError> {
        if self.spot_only {
            return Ok(Vec::new());
        }
        let state = self.state.read().await;
        Ok(state
            .positions
            .iter()
            .filter(|p| !p.quantity.is_zero())
            .filter(|p| symbol.is_none_or(|s| p.symbol == s))
            .cloned()
            .collect())
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<bool, ExchangeError> {
        if self.spot_only {
            return Ok(false);
        }
        self.state
            .write()
            .await
            .leverage_calls
            .push((symbol.to_string(), leverage));
        Ok(true)
    }
}

/// Registry that hands out clones of one shared mock venue, so tests can
/// script failures and inspect orders across worker-created adapters.
pub struct MockExchangeRegistry {
    adapter: MockExchangeAdapter,
}

impl MockExchangeRegistry {
    pub fn new(adapter: MockExchangeAdapter) -> Self {
        Self { adapter }
    }
}

impl ExchangeRegistry for MockExchangeRegistry {
    fn supported(&self) -> Vec<&'static str> {
        vec!["mock"]
    }

    fn create(
        &self,
        _exchange: &str,
        _credentials: &ExchangeCredentials,
    ) -> Result<Box<dyn ExchangeAdapter>, ExchangeError> {
        Ok(Box::new(self.adapter.clone()))
    }
}

// =========================================================================
// In-memory queue
// =========================================================================

#[derive(Debug, Clone)]
pub struct DeadLetterEntry {
    pub signal: QueuedSignal,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct QueueSnapshot {
    pub queued: Vec<String>,
    pub processing: Vec<String>,
    pub dead_letter: Vec<DeadLetterEntry>,
}

#[derive(Default)]
struct InMemoryQueueState {
    // Keyed by (score bits, insertion seq); scores are non-negative so the
    // bit pattern preserves the float ordering.
    queue: BTreeMap<(u64, u64), String>,
    bodies: HashMap<String, QueuedSignal>,
    processing: HashSet<String>,
    dead_letter: Vec<DeadLetterEntry>,
    dedup: HashMap<String, Instant>,
    seq: u64,
}

impl InMemoryQueueState {
    fn push(&mut self, signal_id: String, priority: QueuePriority, at: DateTime<Utc>) {
        let key = (queue_score(priority, at).to_bits(), self.seq);
        self.seq += 1;
        self.queue.insert(key, signal_id);
    }
}

/// The Redis queue's semantics without the Redis: same score function, same
/// retry/dead-letter transitions, same body-before-index invariant.
#[derive(Clone, Default)]
pub struct InMemorySignalQueue {
    state: Arc<Mutex<InMemoryQueueState>>,
    notify: Arc<Notify>,
}

impl InMemorySignalQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> QueueSnapshot {
        let state = self.state.lock().await;
        QueueSnapshot {
            queued: state.queue.values().cloned().collect(),
            processing: state.processing.iter().cloned().collect(),
            dead_letter: state.dead_letter.clone(),
        }
    }

    pub async fn has_body(&self, signal_id: &str) -> bool {
        self.state.lock().await.bodies.contains_key(signal_id)
    }
}

#[async_trait]
impl SignalQueue for InMemorySignalQueue {
    async fn enqueue(
        &self,
        signal: &QueuedSignal,
        dedup: Option<&str>,
        dedup_ttl: Duration,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;

        if let Some(key) = dedup {
            let now = Instant::now();
            state.dedup.retain(|_, expires| *expires > now);
            if state.dedup.contains_key(key) {
                info!("Signal {} deduplicated (key {})", signal.signal_id, key);
                return Ok(false);
            }
            state.dedup.insert(key.to_string(), now + dedup_ttl);
        }

        state
            .bodies
            .insert(signal.signal_id.clone(), signal.clone());
        state.push(signal.signal_id.clone(), signal.priority, Utc::now());
        drop(state);

        self.notify.notify_one();
        Ok(true)
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<QueuedSignal>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let mut state = self.state.lock().await;
                if let Some((_, signal_id)) = state.queue.pop_first() {
                    let Some(signal) = state.bodies.get(&signal_id).cloned() else {
                        warn!("Signal body missing for dequeued id {}", signal_id);
                        return Ok(None);
                    };
                    state.processing.insert(signal_id);
                    return Ok(Some(signal));
                }
            }

            if timeout.is_zero() {
                return Ok(None);
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
            }
        }
    }

    async fn complete(&self, signal_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.processing.remove(signal_id);
        state.bodies.remove(signal_id);
        Ok(())
    }

    async fn fail(&self, signal_id: &str, error_msg: &str, retry: bool) -> Result<bool> {
        let mut state = self.state.lock().await;
        state.processing.remove(signal_id);

        let Some(mut signal) = state.bodies.get(signal_id).cloned() else {
            warn!("Signal {} not found for failure", signal_id);
            return Ok(false);
        };

        if retry && signal.retry_count < signal.max_retries {
            signal.retry_count += 1;
            let delay = retry_backoff(signal.retry_count);
            let scheduled = Utc::now() + chrono::Duration::seconds(delay.as_secs() as i64);

            state.bodies.insert(signal_id.to_string(), signal);
            state.push(signal_id.to_string(), QueuePriority::Low, scheduled);
            drop(state);
            self.notify.notify_one();
            Ok(true)
        } else {
            state.bodies.remove(signal_id);
            state.dead_letter.push(DeadLetterEntry {
                signal,
                error: error_msg.to_string(),
                failed_at: Utc::now(),
            });
            Ok(false)
        }
    }

    async fn stats(&self) -> Result<QueueStats> {
        let state = self.state.lock().await;
        Ok(QueueStats {
            queued: state.queue.len() as u64,
            processing: state.processing.len() as u64,
            dead_letter: state.dead_letter.len() as u64,
        })
    }

    async fn recover_processing(&self, max_age: Duration) -> Result<u32> {
        let mut state = self.state.lock().await;
        let mut recovered = 0u32;

        let ids: Vec<String> = state.processing.iter().cloned().collect();
        for signal_id in ids {
            let Some(mut signal) = state.bodies.get(&signal_id).cloned() else {
                state.processing.remove(&signal_id);
                continue;
            };
            let age = Utc::now() - signal.created_at;
            if age.num_seconds() > max_age.as_secs() as i64 {
                signal.retry_count += 1;
                state.bodies.insert(signal_id.clone(), signal);
                state.push(signal_id.clone(), QueuePriority::High, Utc::now());
                state.processing.remove(&signal_id);
                recovered += 1;
            }
        }

        if recovered > 0 {
            self.notify.notify_one();
        }
        Ok(recovered)
    }
}

// =========================================================================
// In-memory stores
// =========================================================================

#[derive(Default)]
struct StrategyStoreState {
    strategies: HashMap<String, Strategy>,
    subscriptions: Vec<Subscription>,
    records: HashMap<String, SignalRecord>,
    results: HashMap<String, ExecutionResult>,
    risk_settings: HashMap<String, RiskSettings>,
    positions: HashMap<String, PositionTotals>,
    daily: HashMap<String, DailyStats>,
}

#[derive(Clone, Default)]
pub struct InMemoryStrategyStore {
    state: Arc<RwLock<StrategyStoreState>>,
}

impl InMemoryStrategyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_strategy(&self, strategy: Strategy) {
        self.state
            .write()
            .await
            .strategies
            .insert(strategy.id.clone(), strategy);
    }

    pub async fn insert_subscription(&self, subscription: Subscription) {
        self.state.write().await.subscriptions.push(subscription);
    }

    pub async fn set_risk_settings(&self, user_id: &str, settings: RiskSettings) {
        self.state
            .write()
            .await
            .risk_settings
            .insert(user_id.to_string(), settings);
    }

    pub async fn set_open_positions(&self, user_id: &str, totals: PositionTotals) {
        self.state
            .write()
            .await
            .positions
            .insert(user_id.to_string(), totals);
    }

    pub async fn set_daily_stats(&self, user_id: &str, stats: DailyStats) {
        self.state
            .write()
            .await
            .daily
            .insert(user_id.to_string(), stats);
    }

    pub async fn record_status(&self, signal_id: &str) -> Option<SignalRecordStatus> {
        self.state
            .read()
            .await
            .records
            .get(signal_id)
            .map(|r| r.status)
    }

    pub async fn execution_result(&self, signal_id: &str) -> Option<ExecutionResult> {
        self.state.read().await.results.get(signal_id).cloned()
    }

    pub async fn records(&self) -> Vec<SignalRecord> {
        self.state.read().await.records.values().cloned().collect()
    }
}

#[async_trait]
impl StrategyStore for InMemoryStrategyStore {
    async fn get(&self, strategy_id: &str) -> Result<Option<Strategy>> {
        Ok(self.state.read().await.strategies.get(strategy_id).cloned())
    }

    async fn subscribers(
        &self,
        strategy_id: &str,
        auto_trade_only: bool,
    ) -> Result<Vec<Subscription>> {
        Ok(self
            .state
            .read()
            .await
            .subscriptions
            .iter()
            .filter(|s| s.strategy_id == strategy_id && s.is_active)
            .filter(|s| !auto_trade_only || s.auto_trade)
            .cloned()
            .collect())
    }

    async fn verify_secret(&self, strategy_id: &str, secret: &str) -> Result<bool> {
        let state = self.state.read().await;
        Ok(state
            .strategies
            .get(strategy_id)
            .is_some_and(|s| secret_matches(s.webhook_token.as_bytes(), secret.as_bytes())))
    }

    async fn record_signal(&self, record: SignalRecord) -> Result<()> {
        self.state
            .write()
            .await
            .records
            .insert(record.signal_id.clone(), record);
        Ok(())
    }

    async fn update_signal_status(
        &self,
        signal_id: &str,
        status: SignalRecordStatus,
        result: Option<&ExecutionResult>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(record) = state.records.get_mut(signal_id) {
            record.status = status;
        }
        if let Some(result) = result {
            state.results.insert(signal_id.to_string(), result.clone());
        }
        Ok(())
    }

    async fn risk_settings(&self, user_id: &str) -> Result<RiskSettings> {
        Ok(self
            .state
            .read()
            .await
            .risk_settings
            .get(user_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn open_positions_summary(&self, user_id: &str) -> Result<PositionTotals> {
        Ok(self
            .state
            .read()
            .await
            .positions
            .get(user_id)
            .copied()
            .unwrap_or_default())
    }

    async fn daily_stats(&self, user_id: &str) -> Result<DailyStats> {
        Ok(self
            .state
            .read()
            .await
            .daily
            .get(user_id)
            .copied()
            .unwrap_or_default())
    }
}

#[derive(Default)]
struct KeyStoreState {
    keys: HashMap<(String, String), ExchangeCredentials>,
    invalid: HashSet<String>,
    used: Vec<String>,
}

#[derive(Clone, Default)]
pub struct InMemoryKeyStore {
    state: Arc<RwLock<KeyStoreState>>,
}

impl InMemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, user_id: &str, exchange: &str, credentials: ExchangeCredentials) {
        self.state
            .write()
            .await
            .keys
            .insert((user_id.to_string(), exchange.to_string()), credentials);
    }

    pub async fn is_invalid(&self, key_id: &str) -> bool {
        self.state.read().await.invalid.contains(key_id)
    }

    pub async fn used_keys(&self) -> Vec<String> {
        self.state.read().await.used.clone()
    }
}

#[async_trait]
impl KeyStore for InMemoryKeyStore {
    async fn credentials(
        &self,
        user_id: &str,
        exchange: &str,
    ) -> Result<Option<ExchangeCredentials>> {
        let state = self.state.read().await;
        Ok(state
            .keys
            .get(&(user_id.to_string(), exchange.to_string()))
            .filter(|c| !state.invalid.contains(&c.key_id))
            .cloned())
    }

    async fn mark_used(&self, key_id: &str) -> Result<()> {
        self.state.write().await.used.push(key_id.to_string());
        Ok(())
    }

    async fn mark_invalid(&self, key_id: &str) -> Result<()> {
        self.state.write().await.invalid.insert(key_id.to_string());
        Ok(())
    }
}

// =========================================================================
// Recording sink
// =========================================================================

/// Captures published events for assertions.
#[derive(Clone, Default)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<(String, NotificationEvent, serde_json::Value)>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<(String, NotificationEvent, serde_json::Value)> {
        self.events.lock().await.clone()
    }

    pub async fn events_of(&self, event: NotificationEvent) -> Vec<(String, serde_json::Value)> {
        self.events
            .lock()
            .await
            .iter()
            .filter(|(_, e, _)| *e == event)
            .map(|(user, _, payload)| (user.clone(), payload.clone()))
            .collect()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn publish(&self, user_id: &str, event: NotificationEvent, payload: serde_json::Value) {
        self.events
            .lock()
            .await
            .push((user_id.to_string(), event, payload));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::trading::OrderSide;

    #[tokio::test]
    async fn spot_only_venue_reports_no_positions_and_refuses_leverage() {
        let venue = MockExchangeAdapter::new().spot_only();
        assert!(!venue.supports_futures());
        assert!(venue.get_positions(None).await.unwrap().is_empty());
        assert!(!venue.set_leverage("BTCUSDT", 5).await.unwrap());
    }

    #[tokio::test]
    async fn market_fills_slip_against_the_taker() {
        let venue = MockExchangeAdapter::new().with_slippage(dec!(0.1));
        venue.set_ticker("BTCUSDT", dec!(50000)).await;

        let buy = OrderRequest {
            symbol: "BTCUSDT".into(),
            side: OrderSide::Buy,
            order_type: OrderType::Market,
            quantity: dec!(0.01),
            price: None,
            stop_price: None,
            leverage: 1,
            reduce_only: false,
        };
        let result = venue.place_order(&buy).await.unwrap();
        assert_eq!(result.avg_fill_price, Some(dec!(50050)));

        let sell = OrderRequest {
            side: OrderSide::Sell,
            ..buy
        };
        let result = venue.place_order(&sell).await.unwrap();
        assert_eq!(result.avg_fill_price, Some(dec!(49950)));
    }

    #[tokio::test]
    async fn resting_orders_fill_at_their_own_price() {
        let venue = MockExchangeAdapter::new().with_slippage(dec!(0.5));
        let stop = OrderRequest {
            symbol: "ETHUSDT".into(),
            side: OrderSide::Sell,
            order_type: OrderType::StopMarket,
            quantity: dec!(1),
            price: None,
            stop_price: Some(dec!(1960)),
            leverage: 1,
            reduce_only: true,
        };
        let result = venue.place_order(&stop).await.unwrap();
        assert_eq!(result.avg_fill_price, Some(dec!(1960)));
    }
}
