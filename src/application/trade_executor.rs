//! Signal execution against a venue.
//!
//! Translates an abstract entry/exit signal into concrete order submissions:
//! resolves price and size, gates through the risk manager, submits the
//! market order and hangs protective stop / take-profit orders off a filled
//! entry. The executor is stateless and built fresh per signal; it is not
//! idempotent (every call places new orders), so single ownership of a
//! signal id is the queue's job.

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::application::risk_manager::RiskManager;
use crate::domain::errors::ExchangeError;
use crate::domain::ports::ExchangeAdapter;
use crate::domain::risk::{PortfolioState, TradeRequest};
use crate::domain::signal::{ExecutionResult, ExecutionStatus, QueuedSignal};
use crate::domain::trading::{
    OrderRequest, OrderResult, OrderSide, OrderStatus, OrderType, PositionSide,
};

const HYPOTHETICAL_STOP_DISTANCE: Decimal = dec!(0.02);

pub struct TradeExecutor {
    exchange: Arc<dyn ExchangeAdapter>,
    risk_manager: RiskManager,
}

impl TradeExecutor {
    pub fn new(exchange: Arc<dyn ExchangeAdapter>, risk_manager: RiskManager) -> Self {
        Self {
            exchange,
            risk_manager,
        }
    }

    /// Drive a signal to an outcome. Errors are folded into the returned
    /// `ExecutionResult`; this never fails outright.
    #[tracing::instrument(skip_all, fields(
        signal_id = %signal.signal_id,
        user_id = %signal.user_id,
        strategy_id = %signal.strategy_id,
        symbol = %signal.symbol,
    ))]
    pub async fn execute_signal(
        &self,
        signal: &QueuedSignal,
        portfolio: &PortfolioState,
    ) -> ExecutionResult {
        info!(
            "Executing signal: {} leverage {}x",
            signal.action, signal.leverage
        );

        let is_long = signal.action.position_side() == PositionSide::Long;
        if signal.action.is_entry() {
            self.execute_entry(signal, portfolio, is_long).await
        } else {
            self.execute_exit(signal, is_long).await
        }
    }

    async fn execute_entry(
        &self,
        signal: &QueuedSignal,
        portfolio: &PortfolioState,
        is_long: bool,
    ) -> ExecutionResult {
        // Resolve the entry price: signal price wins, ticker otherwise.
        let entry_price = match signal.price {
            Some(price) => price,
            None => match self.exchange.get_ticker(&signal.symbol).await {
                Ok(ticker) => ticker.last_price,
                Err(e) => {
                    error!("Ticker lookup failed: {}", e);
                    return self.failed_from_exchange(signal, e, None);
                }
            },
        };

        // Resolve the quantity: explicit, sized off the stop, or sized off a
        // hypothetical stop 2% away.
        let quantity = match (signal.quantity, signal.stop_loss) {
            (Some(qty), _) => qty,
            (None, Some(stop)) => self.risk_manager.calculate_position_size(
                portfolio.total_balance_usd,
                entry_price,
                stop,
                None,
            ),
            (None, None) => {
                let stop_distance = entry_price * HYPOTHETICAL_STOP_DISTANCE;
                let hypothetical_stop = if is_long {
                    entry_price - stop_distance
                } else {
                    entry_price + stop_distance
                };
                self.risk_manager.calculate_position_size(
                    portfolio.total_balance_usd,
                    entry_price,
                    hypothetical_stop,
                    None,
                )
            }
        };

        if quantity.is_zero() {
            warn!("Calculated position size is zero, rejecting entry");
            return ExecutionResult::failed(
                &signal.signal_id,
                "Calculated position size is zero",
                false,
            );
        }

        let trade_request = TradeRequest {
            user_id: signal.user_id.clone(),
            symbol: signal.symbol.clone(),
            side: signal.action.position_side(),
            quantity,
            entry_price,
            stop_loss: signal.stop_loss,
            take_profit: signal.take_profit,
            leverage: signal.leverage,
        };

        let risk_result = self.risk_manager.check_trade(&trade_request, portfolio);
        if !risk_result.passed {
            warn!(
                "Risk check failed: {}",
                risk_result.reason.as_deref().unwrap_or("unspecified")
            );
            return ExecutionResult::risk_rejected(&signal.signal_id, risk_result);
        }

        let quantity = risk_result.adjusted_quantity.unwrap_or(quantity);
        let quantity = self.exchange.format_quantity(quantity, &signal.symbol);

        let order = OrderRequest {
            symbol: signal.symbol.clone(),
            side: if is_long { OrderSide::Buy } else { OrderSide::Sell },
            order_type: OrderType::Market,
            quantity,
            price: None,
            stop_price: None,
            leverage: signal.leverage,
            reduce_only: false,
        };

        info!("Placing {} MARKET order for {}", order.side, quantity);
        let order_result = match self.exchange.place_order(&order).await {
            Ok(result) => result,
            Err(e) => {
                error!("Entry order failed: {}", e);
                return self.failed_from_exchange(signal, e, Some(risk_result));
            }
        };

        // Protective orders only hang off a fully filled entry; failures are
        // logged and never demote the entry itself.
        if order_result.status == OrderStatus::Filled {
            if signal.stop_loss.is_some() {
                self.place_stop_loss(signal, order_result.filled_quantity, is_long)
                    .await;
            }
            if signal.take_profit.is_some() {
                self.place_take_profit(signal, order_result.filled_quantity, is_long)
                    .await;
            }
        }

        let status = map_order_status(order_result.status);
        info!(
            "Entry executed: {} order {} filled {}",
            status, order_result.order_id, order_result.filled_quantity
        );

        ExecutionResult {
            signal_id: signal.signal_id.clone(),
            status,
            order_id: Some(order_result.order_id),
            filled_quantity: Some(order_result.filled_quantity),
            avg_price: order_result.avg_fill_price,
            fee: order_result.fee,
            realized_pnl: None,
            risk_check: Some(risk_result.clone()),
            error: None,
            warnings: risk_result.warnings,
            retryable: !status.is_success(),
            executed_at: Some(Utc::now()),
        }
    }

    async fn execute_exit(&self, signal: &QueuedSignal, is_long: bool) -> ExecutionResult {
        let positions = match self.exchange.get_positions(Some(&signal.symbol)).await {
            Ok(positions) => positions,
            Err(e) => {
                error!("Position lookup failed: {}", e);
                return self.failed_from_exchange(signal, e, None);
            }
        };

        let target_side = if is_long {
            PositionSide::Long
        } else {
            PositionSide::Short
        };
        let Some(position) = positions.iter().find(|p| p.side == target_side) else {
            warn!("No {} position found for {}", target_side, signal.symbol);
            return ExecutionResult::failed(
                &signal.signal_id,
                format!("No {} position for {}", target_side, signal.symbol),
                false,
            );
        };

        let quantity = signal.quantity.unwrap_or(position.quantity);
        let order = OrderRequest {
            symbol: signal.symbol.clone(),
            side: if is_long { OrderSide::Sell } else { OrderSide::Buy },
            order_type: OrderType::Market,
            quantity: self.exchange.format_quantity(quantity, &signal.symbol),
            price: None,
            stop_price: None,
            leverage: 1,
            reduce_only: true,
        };

        info!(
            "Closing {} position: {} at entry {}",
            target_side, quantity, position.entry_price
        );
        let order_result = match self.exchange.place_order(&order).await {
            Ok(result) => result,
            Err(e) => {
                error!("Exit order failed: {}", e);
                return self.failed_from_exchange(signal, e, None);
            }
        };

        let realized_pnl = realized_pnl(&order_result, position.entry_price, is_long);
        let status = map_order_status(order_result.status);
        info!(
            "Exit executed: {} order {} pnl {:?}",
            status, order_result.order_id, realized_pnl
        );

        ExecutionResult {
            signal_id: signal.signal_id.clone(),
            status,
            order_id: Some(order_result.order_id),
            filled_quantity: Some(order_result.filled_quantity),
            avg_price: order_result.avg_fill_price,
            fee: order_result.fee,
            realized_pnl,
            risk_check: None,
            error: None,
            warnings: Vec::new(),
            retryable: !status.is_success(),
            executed_at: Some(Utc::now()),
        }
    }

    async fn place_stop_loss(&self, signal: &QueuedSignal, quantity: Decimal, is_long: bool) {
        let Some(stop_price) = signal.stop_loss else {
            return;
        };
        let order = OrderRequest {
            symbol: signal.symbol.clone(),
            side: if is_long { OrderSide::Sell } else { OrderSide::Buy },
            order_type: OrderType::StopMarket,
            quantity,
            price: None,
            stop_price: Some(self.exchange.format_price(stop_price, &signal.symbol)),
            leverage: 1,
            reduce_only: true,
        };
        match self.exchange.place_order(&order).await {
            Ok(result) => info!("Stop loss placed: order {} @ {}", result.order_id, stop_price),
            Err(e) => warn!("Failed to place stop loss: {}", e),
        }
    }

    async fn place_take_profit(&self, signal: &QueuedSignal, quantity: Decimal, is_long: bool) {
        let Some(take_profit) = signal.take_profit else {
            return;
        };
        let order = OrderRequest {
            symbol: signal.symbol.clone(),
            side: if is_long { OrderSide::Sell } else { OrderSide::Buy },
            order_type: OrderType::Limit,
            quantity,
            price: Some(self.exchange.format_price(take_profit, &signal.symbol)),
            stop_price: None,
            leverage: 1,
            reduce_only: true,
        };
        match self.exchange.place_order(&order).await {
            Ok(result) => info!(
                "Take profit placed: order {} @ {}",
                result.order_id, take_profit
            ),
            Err(e) => warn!("Failed to place take profit: {}", e),
        }
    }

    fn failed_from_exchange(
        &self,
        signal: &QueuedSignal,
        error: ExchangeError,
        risk_check: Option<crate::domain::risk::RiskCheckResult>,
    ) -> ExecutionResult {
        let mut result =
            ExecutionResult::failed(&signal.signal_id, error.to_string(), error.is_transient());
        result.risk_check = risk_check;
        result
    }
}

fn realized_pnl(order: &OrderResult, entry_price: Decimal, is_long: bool) -> Option<Decimal> {
    let avg_fill = order.avg_fill_price?;
    let mut price_diff = avg_fill - entry_price;
    if !is_long {
        price_diff = -price_diff;
    }
    Some(price_diff * order.filled_quantity)
}

fn map_order_status(status: OrderStatus) -> ExecutionStatus {
    match status {
        OrderStatus::Pending => ExecutionStatus::Pending,
        OrderStatus::Open => ExecutionStatus::Executing,
        OrderStatus::Filled => ExecutionStatus::Filled,
        OrderStatus::PartiallyFilled => ExecutionStatus::PartiallyFilled,
        OrderStatus::Canceled => ExecutionStatus::Canceled,
        OrderStatus::Failed => ExecutionStatus::Failed,
    }
}
