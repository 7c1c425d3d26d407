//! Venue adapters and the registry that builds them.

pub mod binance;

use rust_decimal::Decimal;

use crate::domain::errors::ExchangeError;
use crate::domain::ports::{ExchangeAdapter, ExchangeCredentials, ExchangeRegistry};
use crate::infrastructure::exchanges::binance::BinanceAdapter;
use crate::infrastructure::mock::MockExchangeAdapter;

/// Venues that refuse API access without a passphrase.
const PASSPHRASE_VENUES: &[&str] = &["okx", "coinbase", "kucoin"];

/// Default registry: live venues plus the deterministic `mock` venue used by
/// demo deployments.
pub struct VenueRegistry {
    binance_base_url: String,
    mock_slippage_percent: Decimal,
}

impl VenueRegistry {
    pub fn new(binance_base_url: String, mock_slippage_percent: Decimal) -> Self {
        Self {
            binance_base_url,
            mock_slippage_percent,
        }
    }
}

impl ExchangeRegistry for VenueRegistry {
    fn supported(&self) -> Vec<&'static str> {
        vec!["binance", "mock"]
    }

    fn create(
        &self,
        exchange: &str,
        credentials: &ExchangeCredentials,
    ) -> Result<Box<dyn ExchangeAdapter>, ExchangeError> {
        let exchange = exchange.to_lowercase();

        if PASSPHRASE_VENUES.contains(&exchange.as_str()) && credentials.passphrase.is_none() {
            return Err(ExchangeError::Authentication(format!(
                "exchange {} requires a passphrase and none was supplied",
                exchange
            )));
        }

        match exchange.as_str() {
            "binance" => Ok(Box::new(BinanceAdapter::new(
                credentials.api_key.clone(),
                credentials.api_secret.clone(),
                self.binance_base_url.clone(),
            ))),
            "mock" => Ok(Box::new(
                MockExchangeAdapter::new().with_slippage(self.mock_slippage_percent),
            )),
            other => Err(ExchangeError::Exchange(format!(
                "Unsupported exchange: {}. Supported: {}",
                other,
                self.supported().join(", ")
            ))),
        }
    }
}
