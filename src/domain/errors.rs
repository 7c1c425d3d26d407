use thiserror::Error;

/// Errors surfaced by exchange adapters. Variant display names follow the
/// venue-error convention so dead letter entries read as
/// `"RateLimitError: ..."` etc.
#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    #[error("AuthenticationError: {0}")]
    Authentication(String),

    #[error("InsufficientFundsError: {0}")]
    InsufficientFunds(String),

    #[error("InvalidOrderError: {0}")]
    InvalidOrder(String),

    #[error("RateLimitError: {0}")]
    RateLimit(String),

    #[error("ExchangeError: {0}")]
    Exchange(String),
}

impl ExchangeError {
    /// Whether a retry could plausibly succeed. Rate limits and generic
    /// venue errors are transient; the rest reject the same order every time.
    pub fn is_transient(&self) -> bool {
        matches!(self, ExchangeError::RateLimit(_) | ExchangeError::Exchange(_))
    }
}

/// Errors reported to the webhook caller. The HTTP layer maps each variant
/// onto its status code.
#[derive(Debug, Error)]
pub enum IngressError {
    #[error("Invalid or missing webhook secret")]
    InvalidSecret,

    #[error("Strategy not found")]
    StrategyNotFound,

    #[error("Strategy is not active")]
    StrategyInactive,

    #[error("Invalid price format: {0}")]
    InvalidPrice(String),

    #[error("Invalid payload: {0}")]
    Validation(String),

    #[error("Internal error processing signal")]
    Internal(#[from] anyhow::Error),
}
