//! Capability traits the pipeline is wired through.
//!
//! Ingress, the workers and the executor only ever see these traits; the
//! composition root decides which implementations back them. Storage and the
//! WebSocket fabric live entirely behind `StrategyStore` / `KeyStore` /
//! `NotificationSink` and are not implemented here.

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::domain::errors::ExchangeError;
use crate::domain::risk::RiskSettings;
use crate::domain::signal::{ExecutionResult, QueuedSignal, SignalAction};
use crate::domain::trading::{
    self, Balance, OrderRequest, OrderResult, Position, Ticker,
};

/// Uniform operations over heterogeneous trading venues.
///
/// Adapters are cheap to construct and are not shared across signals; the
/// worker builds one per signal, connects, trades and tears it down.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    fn supports_futures(&self) -> bool;

    async fn connect(&mut self) -> Result<(), ExchangeError>;

    async fn disconnect(&mut self) -> Result<(), ExchangeError>;

    async fn validate_credentials(&self) -> Result<bool, ExchangeError>;

    async fn get_ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError>;

    async fn get_balance(&self, asset: Option<&str>) -> Result<Vec<Balance>, ExchangeError>;

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderResult, ExchangeError>;

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<bool, ExchangeError>;

    async fn get_order(&self, order_id: &str, symbol: &str) -> Result<OrderResult, ExchangeError>;

    async fn get_open_orders(&self, symbol: Option<&str>)
        -> Result<Vec<OrderResult>, ExchangeError>;

    /// Open positions with a non-zero contract count. Spot-only venues
    /// return an empty list.
    async fn get_positions(&self, symbol: Option<&str>) -> Result<Vec<Position>, ExchangeError>;

    /// Spot-only venues return `false`.
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<bool, ExchangeError>;

    fn normalize_symbol(&self, symbol: &str) -> String {
        trading::normalize_symbol(symbol)
    }

    /// Round a quantity down to the venue's lot size before submission.
    fn format_quantity(&self, quantity: Decimal, _symbol: &str) -> Decimal {
        quantity
    }

    /// Round a price to the venue's tick size before submission.
    fn format_price(&self, price: Decimal, _symbol: &str) -> Decimal {
        price
    }
}

impl fmt::Debug for dyn ExchangeAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangeAdapter").field("name", &self.name()).finish()
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub queued: u64,
    pub processing: u64,
    pub dead_letter: u64,
}

/// Priority queue with deduplication, retry and dead letter semantics.
///
/// Delivery is at-most-once per dequeue (single popper per signal id) but
/// at-least-once overall: a crash between venue fill and `complete` makes
/// `recover_processing` re-queue a signal whose order already went through.
/// Strategies should therefore condition entries and exits on the current
/// position state rather than assume exactly-once execution.
#[async_trait]
pub trait SignalQueue: Send + Sync {
    /// Returns `false` when the dedup window suppressed the signal; no queue
    /// state is touched in that case.
    async fn enqueue(
        &self,
        signal: &QueuedSignal,
        dedup_key: Option<&str>,
        dedup_ttl: Duration,
    ) -> Result<bool>;

    /// Pop the lowest-score signal. A zero timeout polls without blocking.
    async fn dequeue(&self, timeout: Duration) -> Result<Option<QueuedSignal>>;

    async fn complete(&self, signal_id: &str) -> Result<()>;

    /// Returns `true` when the signal was re-queued for retry, `false` when
    /// it moved to the dead letter queue.
    async fn fail(&self, signal_id: &str, error: &str, retry: bool) -> Result<bool>;

    async fn stats(&self) -> Result<QueueStats>;

    /// Re-queue signals stuck in processing longer than `max_age` at HIGH
    /// priority. Invoked on startup and by operator tasks.
    async fn recover_processing(&self, max_age: Duration) -> Result<u32>;
}

/// Builds venue adapters by exchange id. Creation fails for unknown venues
/// and for venues that require a passphrase when none is supplied.
pub trait ExchangeRegistry: Send + Sync {
    fn supported(&self) -> Vec<&'static str>;

    fn create(
        &self,
        exchange: &str,
        credentials: &ExchangeCredentials,
    ) -> Result<Box<dyn ExchangeAdapter>, ExchangeError>;
}

/// Decrypted venue credentials handed out by the key store.
#[derive(Debug, Clone)]
pub struct ExchangeCredentials {
    pub api_key: String,
    pub api_secret: String,
    pub passphrase: Option<String>,
    pub key_id: String,
}

#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn credentials(
        &self,
        user_id: &str,
        exchange: &str,
    ) -> Result<Option<ExchangeCredentials>>;

    async fn mark_used(&self, key_id: &str) -> Result<()>;

    /// Flag a key after an authentication failure so it is never handed out
    /// again until the user rotates it.
    async fn mark_invalid(&self, key_id: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct Strategy {
    pub id: String,
    pub name: String,
    pub webhook_token: String,
    pub exchange: String,
    pub is_active: bool,
}

#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: String,
    pub user_id: String,
    pub strategy_id: String,
    pub auto_trade: bool,
    pub exchange_key_id: Option<String>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalRecordStatus {
    Received,
    Queued,
    Skipped,
    Executed,
    Failed,
}

impl fmt::Display for SignalRecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SignalRecordStatus::Received => "received",
            SignalRecordStatus::Queued => "queued",
            SignalRecordStatus::Skipped => "skipped",
            SignalRecordStatus::Executed => "executed",
            SignalRecordStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Audit row for a received signal, keyed by the per-user signal id (or the
/// bare request id when there was no subscriber to fan out to).
#[derive(Debug, Clone)]
pub struct SignalRecord {
    pub signal_id: String,
    pub strategy_id: String,
    pub user_id: Option<String>,
    pub action: SignalAction,
    pub symbol: String,
    pub exchange: String,
    pub price: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub source: String,
    pub status: SignalRecordStatus,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PositionTotals {
    pub count: u32,
    pub value_usd: Decimal,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DailyStats {
    pub trades: u32,
    pub realized_pnl: Decimal,
}

/// Strategy metadata, subscriptions and signal audit trail.
#[async_trait]
pub trait StrategyStore: Send + Sync {
    async fn get(&self, strategy_id: &str) -> Result<Option<Strategy>>;

    async fn subscribers(
        &self,
        strategy_id: &str,
        auto_trade_only: bool,
    ) -> Result<Vec<Subscription>>;

    /// Constant-time comparison against the strategy's webhook token.
    async fn verify_secret(&self, strategy_id: &str, secret: &str) -> Result<bool>;

    async fn record_signal(&self, record: SignalRecord) -> Result<()>;

    async fn update_signal_status(
        &self,
        signal_id: &str,
        status: SignalRecordStatus,
        result: Option<&ExecutionResult>,
    ) -> Result<()>;

    async fn risk_settings(&self, user_id: &str) -> Result<RiskSettings>;

    /// Open position count and entry-priced value for the exposure check.
    async fn open_positions_summary(&self, user_id: &str) -> Result<PositionTotals>;

    /// Today's filled trade count and realized pnl.
    async fn daily_stats(&self, user_id: &str) -> Result<DailyStats>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationEvent {
    TradeExecuted,
    PositionUpdate,
    OrderUpdate,
    SignalReceived,
}

impl fmt::Display for NotificationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NotificationEvent::TradeExecuted => "trade_executed",
            NotificationEvent::PositionUpdate => "position_update",
            NotificationEvent::OrderUpdate => "order_update",
            NotificationEvent::SignalReceived => "signal_received",
        };
        write!(f, "{}", s)
    }
}

/// One-way push of execution events towards a subscriber. Delivery is
/// best-effort; implementations log failures and never propagate them, so a
/// broken sink cannot fail a trade outcome.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn publish(&self, user_id: &str, event: NotificationEvent, payload: serde_json::Value);
}

/// Compare two secrets in constant time. Every byte of both slices is
/// examined even after a mismatch so the comparison does not leak a match
/// prefix length through timing.
pub fn secret_matches(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_matches_identical() {
        assert!(secret_matches(b"T0123456789abcdef", b"T0123456789abcdef"));
    }

    #[test]
    fn secret_matches_rejects_difference() {
        assert!(!secret_matches(b"T0123456789abcdef", b"T0123456789abcdeX"));
    }

    #[test]
    fn secret_matches_rejects_length_mismatch() {
        assert!(!secret_matches(b"short", b"longer-secret"));
    }

    #[test]
    fn secret_matches_single_bit() {
        assert!(!secret_matches(b"\x00", b"\x01"));
    }
}
