//! Type definitions for the spread arbitrage engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Instrument category for a leg
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstrumentType {
    Spot,
    Linear,
    Inverse,
}

impl std::fmt::Display for InstrumentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstrumentType::Spot => write!(f, "spot"),
            InstrumentType::Linear => write!(f, "linear"),
            InstrumentType::Inverse => write!(f, "inverse"),
        }
    }
}

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(&self) -> OrderSide {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "buy"),
            OrderSide::Sell => write!(f, "sell"),
        }
    }
}

/// Single price level (price + quantity)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: f64,
    pub qty: f64,
}

/// Best bid/ask for a (venue, symbol). Ephemeral, overwritten on every tick;
/// age determines staleness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopOfBook {
    pub venue: String,
    pub symbol: String,
    pub bid: Option<PriceLevel>,
    pub ask: Option<PriceLevel>,
    pub observed_at: DateTime<Utc>,
}

impl TopOfBook {
    pub fn age_ms(&self) -> i64 {
        (Utc::now() - self.observed_at).num_milliseconds()
    }

    pub fn is_fresh(&self, window_ms: u64) -> bool {
        let age = self.age_ms();
        age >= 0 && (age as u64) <= window_ms
    }
}

/// Full order-book snapshot for a (venue, symbol)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub venue: String,
    pub symbol: String,
    /// Sorted descending by price
    pub bids: Vec<PriceLevel>,
    /// Sorted ascending by price
    pub asks: Vec<PriceLevel>,
    pub sequence: u64,
    pub observed_at: DateTime<Utc>,
}

impl OrderBookSnapshot {
    pub fn best_bid(&self) -> Option<PriceLevel> {
        self.bids.first().copied()
    }

    pub fn best_ask(&self) -> Option<PriceLevel> {
        self.asks.first().copied()
    }

    pub fn top_of_book(&self) -> TopOfBook {
        TopOfBook {
            venue: self.venue.clone(),
            symbol: self.symbol.clone(),
            bid: self.best_bid(),
            ask: self.best_ask(),
            observed_at: self.observed_at,
        }
    }
}

/// One side of a monitored position
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegSpec {
    pub venue: String,
    pub symbol: String,
    pub instrument: InstrumentType,
    /// Configured side; when absent the side is derived from the detected
    /// spread direction at execution time.
    pub side: Option<OrderSide>,
}

/// How a pair triggers execution
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Trigger when |spread%| reaches the configured threshold
    #[default]
    Threshold,
    /// Trigger on every evaluation regardless of spread
    Market,
}

/// A monitored two-leg pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringPair {
    pub id: String,
    pub leg1: LegSpec,
    pub leg2: LegSpec,
    pub threshold_percent: f64,
    pub amount: f64,
    pub enabled: bool,
    pub execution_mode: ExecutionMode,
    /// Disable the pair after this many triggered executions (None = unlimited)
    pub max_executions: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub total_triggers: u32,
}

/// Which way the spread points
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpreadDirection {
    Leg1BuyLeg2Sell,
    Leg1SellLeg2Buy,
}

/// Detected spread for a pair. Derived, never persisted beyond the most
/// recent value; recomputed on every qualifying tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Opportunity {
    pub pair_id: String,
    pub leg1_quote: TopOfBook,
    pub leg2_quote: TopOfBook,
    pub spread: f64,
    pub spread_percent: f64,
    pub direction: SpreadDirection,
    pub should_trigger: bool,
    pub computed_at: DateTime<Utc>,
}

/// Outcome of a dual-leg execution attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Partial,
    Failed,
}

/// Result of one leg's order placement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegOrderResult {
    pub venue: String,
    pub symbol: String,
    pub side: OrderSide,
    pub qty: f64,
    pub price: Option<f64>,
    pub order_id: Option<String>,
    pub error: Option<String>,
}

/// Immutable record of one execution attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub pair_id: String,
    pub leg1_order: LegOrderResult,
    pub leg2_order: LegOrderResult,
    pub status: ExecutionStatus,
    /// Spread realized from the order prices returned, not the pre-trade quote
    pub realized_spread: Option<f64>,
    pub estimated_profit: Option<f64>,
    pub executed_at: DateTime<Utc>,
}

/// TWAP plan lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TwapStatus {
    Active,
    Paused,
    Completed,
    Cancelled,
}

impl TwapStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TwapStatus::Completed | TwapStatus::Cancelled)
    }
}

/// A TWAP slicing plan over a leg pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwapPlan {
    pub id: String,
    pub leg1: LegSpec,
    pub leg2: LegSpec,
    pub total_amount: f64,
    pub order_count: u32,
    pub time_interval_ms: u64,
    pub amount_per_order: f64,
    pub consumed_amount: f64,
    pub executed_orders: u32,
    pub next_execution_at: Option<DateTime<Utc>>,
    pub status: TwapStatus,
    pub created_at: DateTime<Utc>,
}

/// Process-wide risk limits. Hot-reloadable; read on every decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLimits {
    pub max_position_size: f64,
    pub max_daily_loss: f64,
    /// Upper sanity bound on |spread%|; guards against erroneous or stale
    /// quotes producing absurd spreads.
    pub price_deviation_threshold: f64,
    pub max_trades_per_minute: u32,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_position_size: 10000.0,
            max_daily_loss: 1000.0,
            price_deviation_threshold: 5.0,
            max_trades_per_minute: 10,
        }
    }
}

/// Connectivity state of one venue. Owned exclusively by its
/// ConnectionManager; read-only elsewhere.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueConnectionState {
    pub venue: String,
    pub authenticated: bool,
    pub ws_connected: bool,
    pub reconnect_attempts: u32,
    pub last_error: Option<String>,
}

impl VenueConnectionState {
    pub fn new(venue: &str) -> Self {
        Self {
            venue: venue.to_string(),
            authenticated: false,
            ws_connected: false,
            reconnect_attempts: 0,
            last_error: None,
        }
    }
}

/// Per-venue request statistics snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionStats {
    pub requests_total: u64,
    pub requests_failed: u64,
    pub avg_latency_ms: f64,
    pub ws_messages: u64,
    pub ws_reconnects: u64,
}

/// Engine-wide counters snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineStats {
    pub ticks_evaluated: u64,
    pub opportunities_found: u64,
    pub executions_attempted: u64,
    pub executions_succeeded: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_top_of_book_freshness() {
        let mut top = TopOfBook {
            venue: "bybit".to_string(),
            symbol: "BTCUSDT".to_string(),
            bid: Some(PriceLevel { price: 50000.0, qty: 1.0 }),
            ask: Some(PriceLevel { price: 50001.0, qty: 1.0 }),
            observed_at: Utc::now(),
        };
        assert!(top.is_fresh(2000));

        top.observed_at = Utc::now() - Duration::milliseconds(5000);
        assert!(!top.is_fresh(2000));
    }

    #[test]
    fn test_order_book_top() {
        let book = OrderBookSnapshot {
            venue: "bybit".to_string(),
            symbol: "BTCUSDT".to_string(),
            bids: vec![
                PriceLevel { price: 50000.0, qty: 1.0 },
                PriceLevel { price: 49999.0, qty: 2.0 },
            ],
            asks: vec![
                PriceLevel { price: 50001.0, qty: 1.5 },
                PriceLevel { price: 50002.0, qty: 2.5 },
            ],
            sequence: 1,
            observed_at: Utc::now(),
        };
        let top = book.top_of_book();
        assert_eq!(top.bid.unwrap().price, 50000.0);
        assert_eq!(top.ask.unwrap().price, 50001.0);
    }

    #[test]
    fn test_side_opposite() {
        assert_eq!(OrderSide::Buy.opposite(), OrderSide::Sell);
        assert_eq!(OrderSide::Sell.opposite(), OrderSide::Buy);
    }
}
