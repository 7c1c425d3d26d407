use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::domain::trading::PositionSide;

/// Per-user risk limits. Defaults match the platform tier baseline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskSettings {
    pub max_position_size_usd: Decimal,
    pub max_leverage: u32,
    pub max_open_positions: u32,
    pub max_daily_trades: u32,
    pub max_daily_loss_percent: Decimal,
    pub max_portfolio_exposure_percent: Decimal,
    pub default_risk_per_trade_percent: Decimal,
    pub require_stop_loss: bool,
}

impl Default for RiskSettings {
    fn default() -> Self {
        Self {
            max_position_size_usd: dec!(1000),
            max_leverage: 10,
            max_open_positions: 5,
            max_daily_trades: 50,
            max_daily_loss_percent: dec!(10),
            max_portfolio_exposure_percent: dec!(80),
            default_risk_per_trade_percent: dec!(2),
            require_stop_loss: true,
        }
    }
}

/// Candidate trade derived from a signal, the shape the risk checks run on.
#[derive(Debug, Clone)]
pub struct TradeRequest {
    pub user_id: String,
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub leverage: u32,
}

/// Snapshot of the user's portfolio at check time. `daily_loss_percent` is
/// non-negative and equals `|daily_pnl_percent|` when the day is red.
/// `open_positions_value_usd` values positions at entry price, not mark.
#[derive(Debug, Clone)]
pub struct PortfolioState {
    pub total_balance_usd: Decimal,
    pub open_positions_count: u32,
    pub open_positions_value_usd: Decimal,
    pub daily_trades_count: u32,
    pub daily_pnl_percent: Decimal,
    pub daily_loss_percent: Decimal,
}

impl PortfolioState {
    /// Derive the pnl percentages from the day's realized pnl and balance.
    pub fn from_daily_pnl(
        total_balance_usd: Decimal,
        open_positions_count: u32,
        open_positions_value_usd: Decimal,
        daily_trades_count: u32,
        daily_realized_pnl: Decimal,
    ) -> Self {
        let mut daily_pnl_percent = Decimal::ZERO;
        let mut daily_loss_percent = Decimal::ZERO;
        if total_balance_usd > Decimal::ZERO {
            daily_pnl_percent = daily_realized_pnl / total_balance_usd * dec!(100);
            if daily_realized_pnl < Decimal::ZERO {
                daily_loss_percent = daily_pnl_percent.abs();
            }
        }
        Self {
            total_balance_usd,
            open_positions_count,
            open_positions_value_usd,
            daily_trades_count,
            daily_pnl_percent,
            daily_loss_percent,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskCheckResult {
    pub passed: bool,
    pub reason: Option<String>,
    pub adjusted_quantity: Option<Decimal>,
    pub warnings: Vec<String>,
}

impl RiskCheckResult {
    pub fn pass() -> Self {
        Self {
            passed: true,
            reason: None,
            adjusted_quantity: None,
            warnings: Vec::new(),
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            reason: Some(reason.into()),
            adjusted_quantity: None,
            warnings: Vec::new(),
        }
    }
}
