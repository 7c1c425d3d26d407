//! Webhook ingress: authenticate an incoming signal, look up the strategy
//! and its subscribers, and fan the signal out to the queue one copy per
//! auto-trading subscriber.

use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::Sha256;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::errors::IngressError;
use crate::domain::ports::{
    NotificationEvent, NotificationSink, SignalQueue, SignalRecord, SignalRecordStatus,
    StrategyStore,
};
use crate::domain::signal::{QueuePriority, QueuedSignal, SignalAction};
use crate::domain::trading::normalize_symbol;

const MIN_SECRET_LEN: usize = 16;
const MAX_LEVERAGE: u32 = 125;

/// Raw webhook payload as the charting service posts it. Prices arrive as
/// decimal strings and are parsed after authentication.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookSignal {
    pub strategy_id: String,
    #[serde(default)]
    pub secret: Option<String>,
    pub symbol: String,
    pub action: String,
    #[serde(default)]
    pub price: Option<String>,
    #[serde(default)]
    pub stop_loss: Option<String>,
    #[serde(default)]
    pub take_profit: Option<String>,
    #[serde(default)]
    pub quantity: Option<String>,
    #[serde(default)]
    pub leverage: Option<u32>,
}

/// Fan-out summary returned to the webhook caller.
#[derive(Debug, Clone)]
pub struct IngressOutcome {
    pub request_id: String,
    pub subscribers: u32,
    pub queued: u32,
    pub deduplicated: u32,
}

impl IngressOutcome {
    pub fn queued_any(&self) -> bool {
        self.queued > 0
    }

    pub fn message(&self) -> String {
        if self.subscribers == 0 {
            "Signal received, no auto-trade subscribers".to_string()
        } else if self.queued == 0 {
            format!(
                "Signal deduplicated for all {} subscribers (duplicate within dedup window)",
                self.deduplicated
            )
        } else if self.deduplicated == 0 {
            format!("Signal queued for {} subscribers", self.queued)
        } else {
            format!(
                "Signal queued for {} subscribers ({} deduplicated)",
                self.queued, self.deduplicated
            )
        }
    }
}

pub struct SignalIngress {
    strategies: Arc<dyn StrategyStore>,
    queue: Arc<dyn SignalQueue>,
    sink: Arc<dyn NotificationSink>,
    dedup_ttl: Duration,
}

impl SignalIngress {
    pub fn new(
        strategies: Arc<dyn StrategyStore>,
        queue: Arc<dyn SignalQueue>,
        sink: Arc<dyn NotificationSink>,
        dedup_ttl: Duration,
    ) -> Self {
        Self {
            strategies,
            queue,
            sink,
            dedup_ttl,
        }
    }

    /// Authenticate and fan out one webhook delivery.
    ///
    /// `signature` is the optional `X-Signature` header: an HMAC-SHA256 of
    /// the raw request body keyed by the strategy's webhook token. When
    /// present it replaces the in-payload secret entirely.
    #[tracing::instrument(skip_all, fields(strategy_id = %payload.strategy_id, client_ip = %client_ip))]
    pub async fn ingest(
        &self,
        payload: WebhookSignal,
        raw_body: &[u8],
        signature: Option<&str>,
        client_ip: &str,
    ) -> Result<IngressOutcome, IngressError> {
        let request_id = Uuid::new_v4().to_string();

        let symbol = normalize_symbol(&payload.symbol);
        if symbol.is_empty() {
            return Err(IngressError::Validation("symbol must not be empty".into()));
        }
        let action = SignalAction::from_str(&payload.action)
            .map_err(|e| IngressError::Validation(e.to_string()))?;
        let leverage = payload.leverage.unwrap_or(1);
        if leverage == 0 || leverage > MAX_LEVERAGE {
            return Err(IngressError::Validation(format!(
                "leverage must be between 1 and {}",
                MAX_LEVERAGE
            )));
        }

        info!("Received signal {} {} from {}", action, symbol, client_ip);

        // A payload secret is required unless the caller signed the body.
        if signature.is_none() {
            match payload.secret.as_deref() {
                Some(secret) if secret.len() >= MIN_SECRET_LEN => {}
                _ => {
                    warn!("Invalid webhook secret from {}", client_ip);
                    return Err(IngressError::InvalidSecret);
                }
            }
        }

        let strategy = self
            .strategies
            .get(&payload.strategy_id)
            .await?
            .ok_or(IngressError::StrategyNotFound)?;
        if !strategy.is_active {
            return Err(IngressError::StrategyInactive);
        }

        let authenticated = match signature {
            Some(sig) => verify_signature(raw_body, sig, &strategy.webhook_token),
            None => {
                let secret = payload.secret.as_deref().unwrap_or_default();
                self.strategies
                    .verify_secret(&strategy.id, secret)
                    .await?
            }
        };
        if !authenticated {
            warn!("Webhook authentication failed from {}", client_ip);
            return Err(IngressError::InvalidSecret);
        }

        let subscriptions = self
            .strategies
            .subscribers(&strategy.id, true)
            .await?;

        if subscriptions.is_empty() {
            info!("No auto-trade subscribers for strategy {}", strategy.id);
            // Nothing will be queued, so price fields are recorded
            // best-effort instead of failing the delivery on a parse error.
            self.strategies
                .record_signal(SignalRecord {
                    signal_id: request_id.clone(),
                    strategy_id: strategy.id.clone(),
                    user_id: None,
                    action,
                    symbol,
                    exchange: strategy.exchange.clone(),
                    price: parse_price(payload.price.as_deref()).ok().flatten(),
                    stop_loss: parse_price(payload.stop_loss.as_deref()).ok().flatten(),
                    take_profit: parse_price(payload.take_profit.as_deref()).ok().flatten(),
                    source: "tradingview".into(),
                    status: SignalRecordStatus::Received,
                })
                .await?;
            return Ok(IngressOutcome {
                request_id,
                subscribers: 0,
                queued: 0,
                deduplicated: 0,
            });
        }

        let price = parse_price(payload.price.as_deref())?;
        let stop_loss = parse_price(payload.stop_loss.as_deref())?;
        let take_profit = parse_price(payload.take_profit.as_deref())?;
        let quantity = parse_price(payload.quantity.as_deref())?;

        let priority = QueuePriority::for_action(action);

        let mut queued = 0u32;
        let mut deduplicated = 0u32;

        for subscription in &subscriptions {
            let signal_id = format!("{}:{}", request_id, subscription.user_id);

            self.strategies
                .record_signal(SignalRecord {
                    signal_id: signal_id.clone(),
                    strategy_id: strategy.id.clone(),
                    user_id: Some(subscription.user_id.clone()),
                    action,
                    symbol: symbol.clone(),
                    exchange: strategy.exchange.clone(),
                    price,
                    stop_loss,
                    take_profit,
                    source: "tradingview".into(),
                    status: SignalRecordStatus::Received,
                })
                .await?;

            let mut signal = QueuedSignal::new(
                signal_id.clone(),
                subscription.user_id.clone(),
                strategy.id.clone(),
                symbol.clone(),
                action,
            );
            signal.price = price;
            signal.stop_loss = stop_loss;
            signal.take_profit = take_profit;
            signal.quantity = quantity;
            signal.leverage = leverage;
            signal.priority = priority;

            let dedup_key = signal.dedup_key();
            let was_queued = self
                .queue
                .enqueue(&signal, Some(&dedup_key), self.dedup_ttl)
                .await?;

            let status = if was_queued {
                queued += 1;
                SignalRecordStatus::Queued
            } else {
                deduplicated += 1;
                info!("Signal deduplicated for {} ({})", subscription.user_id, dedup_key);
                SignalRecordStatus::Skipped
            };
            self.strategies
                .update_signal_status(&signal_id, status, None)
                .await?;

            self.sink
                .publish(
                    &subscription.user_id,
                    NotificationEvent::SignalReceived,
                    serde_json::json!({
                        "signal_id": signal_id,
                        "symbol": symbol,
                        "action": action.to_string(),
                        "queued": was_queued,
                    }),
                )
                .await;
        }

        info!(
            "Signal fan-out complete: {} queued, {} deduplicated of {} subscribers",
            queued,
            deduplicated,
            subscriptions.len()
        );

        Ok(IngressOutcome {
            request_id,
            subscribers: subscriptions.len() as u32,
            queued,
            deduplicated,
        })
    }
}

fn parse_price(value: Option<&str>) -> Result<Option<Decimal>, IngressError> {
    match value {
        None => Ok(None),
        Some(raw) => Decimal::from_str(raw.trim())
            .map(Some)
            .map_err(|_| IngressError::InvalidPrice(raw.to_string())),
    }
}

/// Verify an HMAC-SHA256 hex signature over the raw request body.
pub fn verify_signature(body: &[u8], signature_hex: &str, token: &str) -> bool {
    let Ok(signature) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(token.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature).is_ok()
}
