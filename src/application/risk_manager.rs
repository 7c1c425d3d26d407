//! Trade gating against per-user risk limits.
//!
//! All checks are pure functions over the candidate trade and a portfolio
//! snapshot; the manager holds nothing but the settings and is rebuilt per
//! signal. Checks run in a fixed order and the first failure short-circuits,
//! with one exception: an oversized trade is shrunk to the position cap and
//! accepted on the spot, skipping the remaining checks.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, info, warn};

use crate::domain::risk::{PortfolioState, RiskCheckResult, RiskSettings, TradeRequest};
use crate::domain::trading::PositionSide;

const DEFAULT_MAX_STOP_DISTANCE_PERCENT: Decimal = dec!(5);

#[derive(Debug, Clone)]
pub struct RiskManager {
    settings: RiskSettings,
}

impl RiskManager {
    pub fn new(settings: RiskSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &RiskSettings {
        &self.settings
    }

    /// Run all risk checks on a candidate trade.
    pub fn check_trade(&self, trade: &TradeRequest, portfolio: &PortfolioState) -> RiskCheckResult {
        // Check 1: daily loss limit
        if portfolio.daily_loss_percent >= self.settings.max_daily_loss_percent {
            warn!(
                "Trade rejected for {}: daily loss {}% >= limit {}%",
                trade.user_id, portfolio.daily_loss_percent, self.settings.max_daily_loss_percent
            );
            return RiskCheckResult::reject(format!(
                "Daily loss limit reached ({}% >= {}%)",
                portfolio.daily_loss_percent, self.settings.max_daily_loss_percent
            ));
        }

        // Check 2: daily trade count
        if portfolio.daily_trades_count >= self.settings.max_daily_trades {
            warn!(
                "Trade rejected for {}: {} trades today, limit {}",
                trade.user_id, portfolio.daily_trades_count, self.settings.max_daily_trades
            );
            return RiskCheckResult::reject(format!(
                "Daily trade limit reached ({} >= {})",
                portfolio.daily_trades_count, self.settings.max_daily_trades
            ));
        }

        // Check 3: open positions count
        if portfolio.open_positions_count >= self.settings.max_open_positions {
            warn!(
                "Trade rejected for {}: {} open positions, limit {}",
                trade.user_id, portfolio.open_positions_count, self.settings.max_open_positions
            );
            return RiskCheckResult::reject(format!(
                "Max open positions reached ({} >= {})",
                portfolio.open_positions_count, self.settings.max_open_positions
            ));
        }

        // Check 4: leverage limit
        if trade.leverage > self.settings.max_leverage {
            warn!(
                "Trade rejected for {}: leverage {}x > max {}x",
                trade.user_id, trade.leverage, self.settings.max_leverage
            );
            return RiskCheckResult::reject(format!(
                "Leverage {}x exceeds maximum {}x",
                trade.leverage, self.settings.max_leverage
            ));
        }

        // Check 5: position size. An oversized trade is shrunk to the cap and
        // accepted immediately; checks 6-7 do not run on the adjusted trade.
        let position_value_usd = trade.quantity * trade.entry_price;
        if position_value_usd > self.settings.max_position_size_usd {
            let adjusted_qty = self.settings.max_position_size_usd / trade.entry_price;
            info!(
                "Position size adjusted for {}: {} -> {}",
                trade.user_id, trade.quantity, adjusted_qty
            );
            let mut result = RiskCheckResult::pass();
            result.adjusted_quantity = Some(adjusted_qty);
            result.warnings.push(format!(
                "Position size reduced from ${} to ${}",
                position_value_usd, self.settings.max_position_size_usd
            ));
            return result;
        }

        // Check 6: portfolio exposure. Zero balance counts as fully exposed.
        let new_exposure = portfolio.open_positions_value_usd + position_value_usd;
        let exposure_percent = if portfolio.total_balance_usd > Decimal::ZERO {
            new_exposure / portfolio.total_balance_usd * dec!(100)
        } else {
            dec!(100)
        };
        if exposure_percent > self.settings.max_portfolio_exposure_percent {
            warn!(
                "Trade rejected for {}: exposure {}% > limit {}%",
                trade.user_id,
                exposure_percent.round_dp(1),
                self.settings.max_portfolio_exposure_percent
            );
            return RiskCheckResult::reject(format!(
                "Portfolio exposure {}% exceeds maximum {}%",
                exposure_percent.round_dp(1),
                self.settings.max_portfolio_exposure_percent
            ));
        }

        // Check 7: stop loss required
        if self.settings.require_stop_loss && trade.stop_loss.is_none() {
            warn!(
                "Trade rejected for {}: stop loss required for {}",
                trade.user_id, trade.symbol
            );
            return RiskCheckResult::reject("Stop loss is required but not provided");
        }

        debug!(
            "Risk check passed for {} {} {} qty {}",
            trade.user_id, trade.side, trade.symbol, trade.quantity
        );
        RiskCheckResult::pass()
    }

    /// Size a position from the account risk budget and the stop distance:
    /// `(balance * risk% / 100) / |entry - stop|`, capped so the position
    /// value never exceeds `max_position_size_usd`. A zero stop distance
    /// yields zero; callers must reject the resulting zero-size trade.
    pub fn calculate_position_size(
        &self,
        balance_usd: Decimal,
        entry_price: Decimal,
        stop_loss: Decimal,
        risk_percent: Option<Decimal>,
    ) -> Decimal {
        if entry_price <= Decimal::ZERO {
            return Decimal::ZERO;
        }

        let risk = risk_percent.unwrap_or(self.settings.default_risk_per_trade_percent);
        let risk_amount = balance_usd * (risk / dec!(100));

        let stop_distance = (entry_price - stop_loss).abs();
        if stop_distance.is_zero() {
            return Decimal::ZERO;
        }

        let position_size = risk_amount / stop_distance;
        let max_qty = self.settings.max_position_size_usd / entry_price;
        let position_size = position_size.min(max_qty);

        debug!(
            "Position size calculated: risk {}% of {} over stop distance {} -> {}",
            risk, balance_usd, stop_distance, position_size
        );
        position_size
    }

    /// Sanity-check a stop loss: on the protective side of entry, and not so
    /// far that the trade risks more than `max_loss_percent` of entry.
    pub fn validate_stop_loss(
        &self,
        side: PositionSide,
        entry_price: Decimal,
        stop_loss: Decimal,
        max_loss_percent: Option<Decimal>,
    ) -> RiskCheckResult {
        if entry_price <= Decimal::ZERO {
            return RiskCheckResult::reject("Entry price must be positive");
        }
        let max_loss = max_loss_percent.unwrap_or(DEFAULT_MAX_STOP_DISTANCE_PERCENT);

        let loss_percent = match side {
            PositionSide::Long => {
                if stop_loss >= entry_price {
                    return RiskCheckResult::reject(
                        "Stop loss must be below entry price for long positions",
                    );
                }
                (entry_price - stop_loss) / entry_price * dec!(100)
            }
            PositionSide::Short => {
                if stop_loss <= entry_price {
                    return RiskCheckResult::reject(
                        "Stop loss must be above entry price for short positions",
                    );
                }
                (stop_loss - entry_price) / entry_price * dec!(100)
            }
        };

        if loss_percent > max_loss {
            return RiskCheckResult::reject(format!(
                "Stop loss too far ({}% > {}% max)",
                loss_percent.round_dp(1),
                max_loss
            ));
        }

        RiskCheckResult::pass()
    }
}
