use anyhow::Result;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Runtime configuration, read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub redis_url: String,
    pub host: String,
    pub port: u16,
    pub worker_count: usize,
    pub max_execution_time_ms: u64,
    pub webhook_rate_limit: u32,
    pub dedup_ttl_seconds: u64,
    pub recovery_max_age_seconds: u64,
    pub default_slippage_percent: Decimal,
    pub binance_base_url: String,
    /// When set, the composition root seeds a demo strategy with this
    /// webhook token against the mock venue.
    pub demo_webhook_token: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".into(),
            host: "0.0.0.0".into(),
            port: 8000,
            worker_count: 2,
            max_execution_time_ms: 5000,
            webhook_rate_limit: 30,
            dedup_ttl_seconds: 30,
            recovery_max_age_seconds: 300,
            default_slippage_percent: dec!(0.1),
            binance_base_url: "https://fapi.binance.com".into(),
            demo_webhook_token: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let defaults = Config::default();
        Ok(Self {
            redis_url: env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            host: env::var("HOST").unwrap_or(defaults.host),
            port: parse_env("PORT", defaults.port)?,
            worker_count: parse_env("WORKER_COUNT", defaults.worker_count)?,
            max_execution_time_ms: parse_env(
                "MAX_EXECUTION_TIME_MS",
                defaults.max_execution_time_ms,
            )?,
            webhook_rate_limit: parse_env("WEBHOOK_RATE_LIMIT", defaults.webhook_rate_limit)?,
            dedup_ttl_seconds: parse_env("DEDUP_TTL_SECONDS", defaults.dedup_ttl_seconds)?,
            recovery_max_age_seconds: parse_env(
                "RECOVERY_MAX_AGE_SECONDS",
                defaults.recovery_max_age_seconds,
            )?,
            default_slippage_percent: parse_env(
                "DEFAULT_SLIPPAGE_PERCENT",
                defaults.default_slippage_percent,
            )?,
            binance_base_url: env::var("BINANCE_BASE_URL").unwrap_or(defaults.binance_base_url),
            demo_webhook_token: env::var("DEMO_WEBHOOK_TOKEN").ok().filter(|t| !t.is_empty()),
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn max_execution(&self) -> Duration {
        Duration::from_millis(self.max_execution_time_ms)
    }

    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_secs(self.dedup_ttl_seconds)
    }

    pub fn recovery_max_age(&self) -> Duration {
        Duration::from_secs(self.recovery_max_age_seconds)
    }
}

fn parse_env<T: FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("invalid value for {}: {}", key, e)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_platform_baseline() {
        let config = Config::default();
        assert_eq!(config.worker_count, 2);
        assert_eq!(config.max_execution(), Duration::from_secs(5));
        assert_eq!(config.dedup_ttl(), Duration::from_secs(30));
        assert_eq!(config.recovery_max_age(), Duration::from_secs(300));
        assert_eq!(config.bind_addr(), "0.0.0.0:8000");
    }
}
