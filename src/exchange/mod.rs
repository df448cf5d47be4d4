//! Venue adapter contract
//!
//! Every venue implements the same capability set behind `ExchangeAdapter`.
//! REST operations go through the trait directly; the WebSocket socket is
//! owned by the venue's ConnectionManager, which uses the framing hooks
//! (`ws_endpoint`, `subscribe_tickers`, `parse_ws_message`) so the reconnect
//! loop stays venue-agnostic. Test doubles implement this trait too: stubbed
//! clients never masquerade as production behavior.

pub mod binance;
pub mod bybit;
#[cfg(test)]
pub mod mock;

use crate::error::EngineError;
use crate::market_data::BookUpdate;
use crate::types::{InstrumentType, OrderBookSnapshot, OrderSide, TopOfBook};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One ticker/book channel subscription
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TickerSubscription {
    pub symbol: String,
    pub category: InstrumentType,
}

/// Parameters for a single order placement
#[derive(Debug, Clone)]
pub struct OrderParams {
    pub symbol: String,
    pub category: InstrumentType,
    pub side: OrderSide,
    pub qty: f64,
    /// Client-supplied idempotency token where the venue supports one
    /// (Bybit orderLinkId, Binance newClientOrderId). Callers must not
    /// blindly retry placement without one.
    pub client_order_id: Option<String>,
}

/// Acknowledgement of an accepted order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    /// Average fill price when the venue reports one; market orders on some
    /// venues acknowledge without a price.
    pub price: Option<f64>,
}

/// One asset balance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetBalance {
    pub asset: String,
    pub free: f64,
}

/// One open position (derivatives venues only)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: OrderSide,
    pub size: f64,
    pub entry_price: f64,
}

/// Capability interface every venue implements
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    /// Registered venue name, e.g. "bybit"
    fn venue(&self) -> &str;

    /// Whether trading operations are available
    fn is_authenticated(&self) -> bool;

    /// Whether this venue serves the instrument category at all. Checked at
    /// registration time so an unsupported leg fails there, not on its
    /// first quote fetch.
    fn supports_category(&self, _category: InstrumentType) -> bool {
        true
    }

    /// Validate configuration and connectivity. Fails with
    /// `EngineError::Config` when credentials are required but absent;
    /// a venue without credentials runs in public-data-only mode.
    async fn initialize(&self) -> Result<(), EngineError>;

    async fn get_top_of_book(
        &self,
        symbol: &str,
        category: InstrumentType,
    ) -> Result<TopOfBook, EngineError>;

    async fn get_order_book(
        &self,
        symbol: &str,
        category: InstrumentType,
        depth: u32,
    ) -> Result<OrderBookSnapshot, EngineError>;

    async fn place_order(&self, params: &OrderParams) -> Result<OrderAck, EngineError>;

    async fn cancel_order(
        &self,
        symbol: &str,
        order_id: &str,
        category: InstrumentType,
    ) -> Result<(), EngineError>;

    async fn get_balance(&self) -> Result<Vec<AssetBalance>, EngineError>;

    async fn get_position(&self, symbol: &str) -> Result<Option<Position>, EngineError>;

    async fn test_connection(&self) -> Result<bool, EngineError>;

    /// Release venue-side resources (tokens, sessions). Idempotent.
    async fn cleanup(&self) -> Result<(), EngineError>;

    /// Public stream endpoint for a category
    fn ws_endpoint(&self, category: InstrumentType) -> String;

    /// Frames to send for a set of ticker/book subscriptions. The socket
    /// itself is owned by the ConnectionManager.
    fn subscribe_tickers(&self, items: &[TickerSubscription]) -> Vec<String>;

    /// Frames to send to drop subscriptions
    fn unsubscribe_tickers(&self, items: &[TickerSubscription]) -> Vec<String>;

    /// Parse one raw stream message into a book update, or None for
    /// heartbeats/acks/unrelated topics.
    fn parse_ws_message(&self, category: InstrumentType, text: &str) -> Option<BookUpdate>;

    /// Application-level keepalive frame, for venues that expect one
    fn heartbeat_frame(&self) -> Option<String> {
        None
    }
}
