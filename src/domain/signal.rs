use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::domain::risk::RiskCheckResult;
use crate::domain::trading::PositionSide;

pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalAction {
    LongEntry,
    LongExit,
    ShortEntry,
    ShortExit,
}

impl SignalAction {
    pub fn is_entry(self) -> bool {
        matches!(self, SignalAction::LongEntry | SignalAction::ShortEntry)
    }

    pub fn is_exit(self) -> bool {
        !self.is_entry()
    }

    pub fn position_side(self) -> PositionSide {
        match self {
            SignalAction::LongEntry | SignalAction::LongExit => PositionSide::Long,
            SignalAction::ShortEntry | SignalAction::ShortExit => PositionSide::Short,
        }
    }
}

impl FromStr for SignalAction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "long_entry" => Ok(SignalAction::LongEntry),
            "long_exit" => Ok(SignalAction::LongExit),
            "short_entry" => Ok(SignalAction::ShortEntry),
            "short_exit" => Ok(SignalAction::ShortExit),
            _ => anyhow::bail!(
                "Invalid action: {}. Must be one of long_entry, long_exit, short_entry, short_exit",
                s
            ),
        }
    }
}

impl fmt::Display for SignalAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalAction::LongEntry => write!(f, "long_entry"),
            SignalAction::LongExit => write!(f, "long_exit"),
            SignalAction::ShortEntry => write!(f, "short_entry"),
            SignalAction::ShortExit => write!(f, "short_exit"),
        }
    }
}

/// Queue scheduling class. Lower value dequeues first; exit signals always
/// ride HIGH so position closes beat new entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum QueuePriority {
    High = 0,
    Normal = 1,
    Low = 2,
}

impl QueuePriority {
    pub fn for_action(action: SignalAction) -> Self {
        if action.is_exit() {
            QueuePriority::High
        } else {
            QueuePriority::Normal
        }
    }
}

impl From<QueuePriority> for u8 {
    fn from(p: QueuePriority) -> u8 {
        p as u8
    }
}

impl TryFrom<u8> for QueuePriority {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(QueuePriority::High),
            1 => Ok(QueuePriority::Normal),
            2 => Ok(QueuePriority::Low),
            _ => Err(format!("invalid queue priority: {}", v)),
        }
    }
}

/// A signal in flight through the queue. Immutable after enqueue except for
/// `retry_count`, which the queue bumps on failure and orphan recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedSignal {
    pub signal_id: String,
    pub user_id: String,
    pub strategy_id: String,
    pub symbol: String,
    pub action: SignalAction,
    pub price: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub quantity: Option<Decimal>,
    pub leverage: u32,
    pub priority: QueuePriority,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
}

impl QueuedSignal {
    pub fn new(
        signal_id: impl Into<String>,
        user_id: impl Into<String>,
        strategy_id: impl Into<String>,
        symbol: impl Into<String>,
        action: SignalAction,
    ) -> Self {
        Self {
            signal_id: signal_id.into(),
            user_id: user_id.into(),
            strategy_id: strategy_id.into(),
            symbol: symbol.into(),
            action,
            price: None,
            stop_loss: None,
            take_profit: None,
            quantity: None,
            leverage: 1,
            priority: QueuePriority::for_action(action),
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            created_at: Utc::now(),
        }
    }

    pub fn dedup_key(&self) -> String {
        format!("{}:{}:{}", self.user_id, self.symbol, self.action)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    RiskCheckFailed,
    Executing,
    Filled,
    PartiallyFilled,
    Failed,
    Canceled,
}

impl ExecutionStatus {
    pub fn is_success(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Filled | ExecutionStatus::PartiallyFilled
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::RiskCheckFailed => "risk_check_failed",
            ExecutionStatus::Executing => "executing",
            ExecutionStatus::Filled => "filled",
            ExecutionStatus::PartiallyFilled => "partially_filled",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Canceled => "canceled",
        };
        write!(f, "{}", s)
    }
}

/// Outcome of driving one signal through the executor.
///
/// `retryable` is the executor's verdict on whether the failure is worth
/// another attempt: transient venue trouble (rate limits, generic errors,
/// timeouts) is, permanent rejections (insufficient funds, invalid order,
/// bad credentials, missing position, zero size) are not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub signal_id: String,
    pub status: ExecutionStatus,
    pub order_id: Option<String>,
    pub filled_quantity: Option<Decimal>,
    pub avg_price: Option<Decimal>,
    pub fee: Option<Decimal>,
    pub realized_pnl: Option<Decimal>,
    pub risk_check: Option<RiskCheckResult>,
    pub error: Option<String>,
    pub warnings: Vec<String>,
    pub retryable: bool,
    pub executed_at: Option<DateTime<Utc>>,
}

impl ExecutionResult {
    pub fn failed(signal_id: impl Into<String>, error: impl Into<String>, retryable: bool) -> Self {
        Self {
            signal_id: signal_id.into(),
            status: ExecutionStatus::Failed,
            order_id: None,
            filled_quantity: None,
            avg_price: None,
            fee: None,
            realized_pnl: None,
            risk_check: None,
            error: Some(error.into()),
            warnings: Vec::new(),
            retryable,
            executed_at: None,
        }
    }

    pub fn risk_rejected(signal_id: impl Into<String>, check: RiskCheckResult) -> Self {
        let error = check.reason.clone();
        Self {
            signal_id: signal_id.into(),
            status: ExecutionStatus::RiskCheckFailed,
            order_id: None,
            filled_quantity: None,
            avg_price: None,
            fee: None,
            realized_pnl: None,
            risk_check: Some(check),
            error,
            warnings: Vec::new(),
            retryable: false,
            executed_at: None,
        }
    }
}
