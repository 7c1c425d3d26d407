//! Binance USDT-M futures adapter.
//!
//! Talks to the futures REST API directly: public market data endpoints plus
//! HMAC-SHA256 signed account and order endpoints. The secret key is used
//! only for signing and never logged.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, HeaderValue};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Deserialize;
use sha2::Sha256;
use tracing::{debug, info, warn};

use crate::domain::errors::ExchangeError;
use crate::domain::ports::ExchangeAdapter;
use crate::domain::trading::{
    Balance, OrderRequest, OrderResult, OrderStatus, OrderType, Position, PositionSide, Ticker,
};

type HmacSha256 = Hmac<Sha256>;

/// Tolerated clock drift for signed requests (milliseconds).
const RECV_WINDOW: u64 = 5000;
const REQUEST_TIMEOUT_SECS: u64 = 10;

// Conservative submission precision. Most USDT-M contracts use a 0.001 step
// and two-decimal prices.
// TODO: pull per-symbol stepSize/tickSize from /fapi/v1/exchangeInfo instead.
const QUANTITY_DECIMALS: u32 = 3;
const PRICE_DECIMALS: u32 = 2;

pub struct BinanceAdapter {
    api_key: String,
    api_secret: String,
    base_url: String,
    client: Option<reqwest::Client>,
}

impl BinanceAdapter {
    pub fn new(api_key: String, api_secret: String, base_url: String) -> Self {
        Self {
            api_key,
            api_secret,
            base_url,
            client: None,
        }
    }

    fn client(&self) -> Result<&reqwest::Client, ExchangeError> {
        self.client
            .as_ref()
            .ok_or_else(|| ExchangeError::Exchange("adapter is not connected".into()))
    }

    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn signed_query(&self, params: &str) -> String {
        let timestamp = chrono::Utc::now().timestamp_millis();
        let base = if params.is_empty() {
            format!("timestamp={}&recvWindow={}", timestamp, RECV_WINDOW)
        } else {
            format!("{}&timestamp={}&recvWindow={}", params, timestamp, RECV_WINDOW)
        };
        let signature = self.sign(&base);
        format!("{}&signature={}", base, signature)
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        params: &str,
        signed: bool,
    ) -> Result<serde_json::Value, ExchangeError> {
        let query = if signed {
            self.signed_query(params)
        } else {
            params.to_string()
        };
        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };

        let response = self
            .client()?
            .request(method, &url)
            .send()
            .await
            .map_err(|e| ExchangeError::Exchange(format!("request to {} failed: {}", path, e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ExchangeError::Exchange(format!("failed to read response: {}", e)))?;

        if !status.is_success() {
            return Err(map_api_error(status, &body));
        }

        serde_json::from_str(&body)
            .map_err(|e| ExchangeError::Exchange(format!("invalid response from {}: {}", path, e)))
    }

    fn parse_order(&self, value: &serde_json::Value) -> Result<OrderResult, ExchangeError> {
        let order: FuturesOrder = serde_json::from_value(value.clone())
            .map_err(|e| ExchangeError::Exchange(format!("invalid order response: {}", e)))?;
        Ok(order.into_result())
    }
}

#[async_trait]
impl ExchangeAdapter for BinanceAdapter {
    fn name(&self) -> &'static str {
        "binance"
    }

    fn supports_futures(&self) -> bool {
        true
    }

    async fn connect(&mut self) -> Result<(), ExchangeError> {
        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(&self.api_key)
            .map_err(|_| ExchangeError::Authentication("API key is not a valid header".into()))?;
        headers.insert("X-MBX-APIKEY", key);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| ExchangeError::Exchange(format!("failed to build client: {}", e)))?;

        self.client = Some(client);
        info!("Connected to Binance futures at {}", self.base_url);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), ExchangeError> {
        self.client = None;
        debug!("Disconnected from Binance");
        Ok(())
    }

    async fn validate_credentials(&self) -> Result<bool, ExchangeError> {
        match self
            .request(reqwest::Method::GET, "/fapi/v2/account", "", true)
            .await
        {
            Ok(_) => Ok(true),
            Err(ExchangeError::Authentication(e)) => {
                warn!("Binance credential validation failed: {}", e);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn get_ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError> {
        let symbol = self.normalize_symbol(symbol);
        let params = format!("symbol={}", symbol);

        let day: Ticker24hr = serde_json::from_value(
            self.request(reqwest::Method::GET, "/fapi/v1/ticker/24hr", &params, false)
                .await?,
        )
        .map_err(|e| ExchangeError::Exchange(format!("invalid ticker response: {}", e)))?;

        let book: BookTicker = serde_json::from_value(
            self.request(
                reqwest::Method::GET,
                "/fapi/v1/ticker/bookTicker",
                &params,
                false,
            )
            .await?,
        )
        .map_err(|e| ExchangeError::Exchange(format!("invalid book ticker response: {}", e)))?;

        Ok(Ticker {
            symbol,
            last_price: day.last_price,
            bid: Some(book.bid_price),
            ask: Some(book.ask_price),
            volume_24h: Some(day.quote_volume),
            change_24h: Some(day.price_change_percent),
        })
    }

    async fn get_balance(&self, asset: Option<&str>) -> Result<Vec<Balance>, ExchangeError> {
        let value = self
            .request(reqwest::Method::GET, "/fapi/v2/balance", "", true)
            .await?;
        let balances: Vec<FuturesBalance> = serde_json::from_value(value)
            .map_err(|e| ExchangeError::Exchange(format!("invalid balance response: {}", e)))?;

        Ok(balances
            .into_iter()
            .filter(|b| match asset {
                Some(wanted) => b.asset == wanted,
                None => b.balance > Decimal::ZERO,
            })
            .map(|b| Balance {
                free: b.available_balance,
                locked: b.balance - b.available_balance,
                total: b.balance,
                asset: b.asset,
            })
            .collect())
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderResult, ExchangeError> {
        let symbol = self.normalize_symbol(&order.symbol);

        // Leverage is set best-effort before the order; if it fails the
        // order proceeds with whatever leverage the venue already has.
        if order.leverage > 1 && !self.set_leverage(&symbol, order.leverage).await? {
            warn!("Could not set {}x leverage for {}", order.leverage, symbol);
        }

        let order_type = match order.order_type {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
            OrderType::StopMarket => "STOP_MARKET",
            OrderType::StopLimit => "STOP",
        };

        let mut params = format!(
            "symbol={}&side={}&type={}&quantity={}",
            symbol,
            order.side,
            order_type,
            self.format_quantity(order.quantity, &symbol),
        );
        if let Some(price) = order.price {
            params.push_str(&format!("&price={}", self.format_price(price, &symbol)));
            params.push_str("&timeInForce=GTC");
        }
        if let Some(stop_price) = order.stop_price {
            params.push_str(&format!(
                "&stopPrice={}",
                self.format_price(stop_price, &symbol)
            ));
        }
        if order.reduce_only {
            params.push_str("&reduceOnly=true");
        }

        info!(
            "Placing {} {} order on {}: qty {}",
            order.side, order_type, symbol, order.quantity
        );
        let value = self
            .request(reqwest::Method::POST, "/fapi/v1/order", &params, true)
            .await?;
        let result = self.parse_order(&value)?;

        info!(
            "Order placed: {} status {:?} filled {}",
            result.order_id, result.status, result.filled_quantity
        );
        Ok(result)
    }

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<bool, ExchangeError> {
        let params = format!(
            "symbol={}&orderId={}",
            self.normalize_symbol(symbol),
            order_id
        );
        match self
            .request(reqwest::Method::DELETE, "/fapi/v1/order", &params, true)
            .await
        {
            Ok(_) => {
                info!("Order {} cancelled", order_id);
                Ok(true)
            }
            Err(ExchangeError::InvalidOrder(e)) => {
                warn!("Order {} not found for cancellation: {}", order_id, e);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn get_order(&self, order_id: &str, symbol: &str) -> Result<OrderResult, ExchangeError> {
        let params = format!(
            "symbol={}&orderId={}",
            self.normalize_symbol(symbol),
            order_id
        );
        let value = self
            .request(reqwest::Method::GET, "/fapi/v1/order", &params, true)
            .await?;
        self.parse_order(&value)
    }

    async fn get_open_orders(
        &self,
        symbol: Option<&str>,
    ) -> Result<Vec<OrderResult>, ExchangeError> {
        let params = match symbol {
            Some(s) => format!("symbol={}", self.normalize_symbol(s)),
            None => String::new(),
        };
        let value = self
            .request(reqwest::Method::GET, "/fapi/v1/openOrders", &params, true)
            .await?;
        let orders = value
            .as_array()
            .ok_or_else(|| ExchangeError::Exchange("expected an array of orders".into()))?;
        orders.iter().map(|o| self.parse_order(o)).collect()
    }

    async fn get_positions(&self, symbol: Option<&str>) -> Result<Vec<Position>, ExchangeError> {
        let params = match symbol {
            Some(s) => format!("symbol={}", self.normalize_symbol(s)),
            None => String::new(),
        };
        let value = self
            .request(reqwest::Method::GET, "/fapi/v2/positionRisk", &params, true)
            .await?;
        let positions: Vec<PositionRisk> = serde_json::from_value(value)
            .map_err(|e| ExchangeError::Exchange(format!("invalid position response: {}", e)))?;

        Ok(positions
            .into_iter()
            .filter(|p| !p.position_amt.is_zero())
            .map(|p| {
                let side = if p.position_amt > Decimal::ZERO {
                    PositionSide::Long
                } else {
                    PositionSide::Short
                };
                Position {
                    symbol: p.symbol,
                    side,
                    quantity: p.position_amt.abs(),
                    entry_price: p.entry_price,
                    current_price: Some(p.mark_price),
                    unrealized_pnl: Some(p.un_realized_profit),
                    leverage: p.leverage.to_u32().unwrap_or(1),
                    liquidation_price: Some(p.liquidation_price),
                    margin: None,
                }
            })
            .collect())
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<bool, ExchangeError> {
        let params = format!(
            "symbol={}&leverage={}",
            self.normalize_symbol(symbol),
            leverage
        );
        match self
            .request(reqwest::Method::POST, "/fapi/v1/leverage", &params, true)
            .await
        {
            Ok(_) => {
                debug!("Leverage set to {}x for {}", leverage, symbol);
                Ok(true)
            }
            Err(e) => {
                warn!("Failed to set leverage for {}: {}", symbol, e);
                Ok(false)
            }
        }
    }

    fn format_quantity(&self, quantity: Decimal, _symbol: &str) -> Decimal {
        quantity
            .round_dp_with_strategy(QUANTITY_DECIMALS, RoundingStrategy::ToZero)
            .normalize()
    }

    fn format_price(&self, price: Decimal, _symbol: &str) -> Decimal {
        price
            .round_dp_with_strategy(PRICE_DECIMALS, RoundingStrategy::ToZero)
            .normalize()
    }
}

/// Map a failed response onto the error taxonomy. Binance error bodies carry
/// `{"code": ..., "msg": ...}`; the HTTP status alone settles the auth and
/// throttle cases.
fn map_api_error(status: StatusCode, body: &str) -> ExchangeError {
    #[derive(Deserialize)]
    struct ApiError {
        #[serde(default)]
        code: i64,
        #[serde(default)]
        msg: String,
    }

    let parsed: Option<ApiError> = serde_json::from_str(body).ok();
    let (code, msg) = match &parsed {
        Some(e) => (e.code, e.msg.as_str()),
        None => (0, body),
    };
    let message = format!("{} (code {})", msg, code);

    if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 418 || code == -1003 {
        return ExchangeError::RateLimit(message);
    }
    if status == StatusCode::UNAUTHORIZED
        || status == StatusCode::FORBIDDEN
        || matches!(code, -2014 | -2015 | -1022)
    {
        return ExchangeError::Authentication(message);
    }
    match code {
        -2018 | -2019 => ExchangeError::InsufficientFunds(message),
        -1013 | -1106 | -1111 | -1121 | -2010 | -2011 | -4164 => {
            ExchangeError::InvalidOrder(message)
        }
        _ => ExchangeError::Exchange(message),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Ticker24hr {
    last_price: Decimal,
    price_change_percent: Decimal,
    quote_volume: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BookTicker {
    bid_price: Decimal,
    ask_price: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FuturesBalance {
    asset: String,
    balance: Decimal,
    available_balance: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FuturesOrder {
    order_id: u64,
    status: String,
    #[serde(default)]
    executed_qty: Decimal,
    #[serde(default)]
    avg_price: Decimal,
}

impl FuturesOrder {
    fn into_result(self) -> OrderResult {
        let status = match self.status.as_str() {
            "NEW" => OrderStatus::Open,
            "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
            "FILLED" => OrderStatus::Filled,
            "CANCELED" | "EXPIRED" => OrderStatus::Canceled,
            "REJECTED" => OrderStatus::Failed,
            _ => OrderStatus::Pending,
        };
        let avg_fill_price = if self.avg_price.is_zero() {
            None
        } else {
            Some(self.avg_price)
        };
        OrderResult {
            order_id: self.order_id.to_string(),
            status,
            filled_quantity: self.executed_qty,
            avg_fill_price,
            // Fees are not part of the order response on this venue.
            fee: None,
            fee_currency: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionRisk {
    symbol: String,
    position_amt: Decimal,
    entry_price: Decimal,
    mark_price: Decimal,
    un_realized_profit: Decimal,
    liquidation_price: Decimal,
    // The venue sends leverage as a decimal string like every other field.
    leverage: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn api_error_mapping() {
        let err = map_api_error(
            StatusCode::BAD_REQUEST,
            r#"{"code":-2019,"msg":"Margin is insufficient."}"#,
        );
        assert!(matches!(err, ExchangeError::InsufficientFunds(_)));

        let err = map_api_error(
            StatusCode::BAD_REQUEST,
            r#"{"code":-1111,"msg":"Precision is over the maximum defined for this asset."}"#,
        );
        assert!(matches!(err, ExchangeError::InvalidOrder(_)));

        let err = map_api_error(StatusCode::TOO_MANY_REQUESTS, r#"{"code":-1003,"msg":"..."}"#);
        assert!(matches!(err, ExchangeError::RateLimit(_)));

        let err = map_api_error(
            StatusCode::UNAUTHORIZED,
            r#"{"code":-2014,"msg":"API-key format invalid."}"#,
        );
        assert!(matches!(err, ExchangeError::Authentication(_)));

        let err = map_api_error(StatusCode::INTERNAL_SERVER_ERROR, "oops");
        assert!(matches!(err, ExchangeError::Exchange(_)));
    }

    #[test]
    fn order_response_parses_and_maps_status() {
        let raw = serde_json::json!({
            "orderId": 283194212u64,
            "status": "FILLED",
            "executedQty": "0.5",
            "avgPrice": "2001.10",
            "symbol": "ETHUSDT",
        });
        let order: FuturesOrder = serde_json::from_value(raw).unwrap();
        let result = order.into_result();
        assert_eq!(result.order_id, "283194212");
        assert_eq!(result.status, OrderStatus::Filled);
        assert_eq!(result.filled_quantity, dec!(0.5));
        assert_eq!(result.avg_fill_price, Some(dec!(2001.10)));
    }

    #[test]
    fn unfilled_order_has_no_average_price() {
        let raw = serde_json::json!({
            "orderId": 1u64,
            "status": "NEW",
            "executedQty": "0",
            "avgPrice": "0",
        });
        let order: FuturesOrder = serde_json::from_value(raw).unwrap();
        let result = order.into_result();
        assert_eq!(result.status, OrderStatus::Open);
        assert_eq!(result.avg_fill_price, None);
    }

    #[test]
    fn quantity_rounds_toward_zero() {
        let adapter = BinanceAdapter::new("k".into(), "s".into(), "http://localhost".into());
        assert_eq!(
            adapter.format_quantity(dec!(0.0019), "BTCUSDT"),
            dec!(0.001)
        );
        assert_eq!(adapter.format_quantity(dec!(0.5), "ETHUSDT"), dec!(0.5));
    }
}
