//! Environment-driven engine configuration

use crate::types::RiskLimits;
use serde::{Deserialize, Serialize};

/// API credentials for one venue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueCredentials {
    pub api_key: String,
    /// Never logged; redacted from Debug-adjacent output by convention
    pub api_secret: String,
}

/// Engine configuration, loaded from environment variables with defaults
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub bybit: Option<VenueCredentials>,
    pub binance: Option<VenueCredentials>,

    /// Fallback re-evaluation interval per pair when no ticks arrive
    pub poll_interval_ms: u64,
    /// Quotes older than this are treated as unusable (REST fallback kicks in)
    pub quote_freshness_ms: u64,

    pub reconnect_interval_ms: u64,
    pub max_reconnect_attempts: u32,

    /// Token-bucket rate limit: requests per window
    pub rate_limit_requests: u32,
    pub rate_limit_window_ms: u64,

    pub risk_limits: RiskLimits,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bybit: None,
            binance: None,
            poll_interval_ms: 1000,
            quote_freshness_ms: 2000,
            reconnect_interval_ms: 5000,
            max_reconnect_attempts: 10,
            rate_limit_requests: 120,
            rate_limit_window_ms: 1000,
            risk_limits: RiskLimits::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables. Missing venue
    /// credentials put that venue into public-data-only mode.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let risk_defaults = RiskLimits::default();

        Self {
            bybit: credentials_from_env("BYBIT_API_KEY", "BYBIT_API_SECRET"),
            binance: credentials_from_env("BINANCE_API_KEY", "BINANCE_API_SECRET"),
            poll_interval_ms: env_parse("POLL_INTERVAL_MS", defaults.poll_interval_ms),
            quote_freshness_ms: env_parse("QUOTE_FRESHNESS_MS", defaults.quote_freshness_ms),
            reconnect_interval_ms: env_parse("RECONNECT_INTERVAL_MS", defaults.reconnect_interval_ms),
            max_reconnect_attempts: env_parse("MAX_RECONNECT_ATTEMPTS", defaults.max_reconnect_attempts),
            rate_limit_requests: env_parse("RATE_LIMIT_REQUESTS", defaults.rate_limit_requests),
            rate_limit_window_ms: env_parse("RATE_LIMIT_WINDOW_MS", defaults.rate_limit_window_ms),
            risk_limits: RiskLimits {
                max_position_size: env_parse("MAX_POSITION_SIZE", risk_defaults.max_position_size),
                max_daily_loss: env_parse("MAX_DAILY_LOSS", risk_defaults.max_daily_loss),
                price_deviation_threshold: env_parse(
                    "PRICE_DEVIATION_THRESHOLD",
                    risk_defaults.price_deviation_threshold,
                ),
                max_trades_per_minute: env_parse(
                    "MAX_TRADES_PER_MINUTE",
                    risk_defaults.max_trades_per_minute,
                ),
            },
        }
    }
}

fn credentials_from_env(key_var: &str, secret_var: &str) -> Option<VenueCredentials> {
    match (std::env::var(key_var), std::env::var(secret_var)) {
        (Ok(api_key), Ok(api_secret)) if !api_key.is_empty() && !api_secret.is_empty() => {
            Some(VenueCredentials { api_key, api_secret })
        }
        _ => None,
    }
}

fn env_parse<T: std::str::FromStr>(var: &str, default: T) -> T {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
