//! Scripted adapter test double
//!
//! Fabricated responses live here and only here, injected through the
//! ExchangeAdapter trait. The WS endpoint points at a closed local port so
//! connection tests exercise the real reconnect path without a network.

use super::{
    AssetBalance, ExchangeAdapter, OrderAck, OrderParams, Position, TickerSubscription,
};
use crate::error::EngineError;
use crate::market_data::BookUpdate;
use crate::types::{InstrumentType, OrderBookSnapshot, PriceLevel, TopOfBook};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub struct MockAdapter {
    venue: String,
    authenticated: bool,
    books: Mutex<HashMap<String, (Vec<PriceLevel>, Vec<PriceLevel>)>>,
    /// Scripted per-symbol order outcomes; empty queue means default success
    order_scripts: Mutex<HashMap<String, VecDeque<Result<OrderAck, EngineError>>>>,
    /// Response delay so tests can catch a submission while it is in flight
    order_delay: Mutex<Option<Duration>>,
    placed: Mutex<Vec<OrderParams>>,
    completed: AtomicU64,
    cancelled: Mutex<Vec<String>>,
    order_counter: AtomicU64,
}

impl MockAdapter {
    pub fn new(venue: &str) -> Self {
        Self {
            venue: venue.to_string(),
            authenticated: true,
            books: Mutex::new(HashMap::new()),
            order_scripts: Mutex::new(HashMap::new()),
            order_delay: Mutex::new(None),
            placed: Mutex::new(Vec::new()),
            completed: AtomicU64::new(0),
            cancelled: Mutex::new(Vec::new()),
            order_counter: AtomicU64::new(1),
        }
    }

    pub fn public_only(venue: &str) -> Self {
        Self {
            authenticated: false,
            ..Self::new(venue)
        }
    }

    pub fn set_order_book(&self, symbol: &str, bids: Vec<PriceLevel>, asks: Vec<PriceLevel>) {
        self.books.lock().insert(symbol.to_string(), (bids, asks));
    }

    /// Queue the next place_order outcome for a symbol
    pub fn script_order(&self, symbol: &str, result: Result<OrderAck, EngineError>) {
        self.order_scripts
            .lock()
            .entry(symbol.to_string())
            .or_default()
            .push_back(result);
    }

    /// Hold every place_order response for this long
    pub fn set_order_delay(&self, delay: Duration) {
        *self.order_delay.lock() = Some(delay);
    }

    pub fn placed_orders(&self) -> Vec<OrderParams> {
        self.placed.lock().clone()
    }

    /// Placements whose response has been returned (scripted failures count)
    pub fn completed_orders(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn cancelled_orders(&self) -> Vec<String> {
        self.cancelled.lock().clone()
    }
}

#[async_trait]
impl ExchangeAdapter for MockAdapter {
    fn venue(&self) -> &str {
        &self.venue
    }

    fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    async fn initialize(&self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn get_top_of_book(
        &self,
        symbol: &str,
        category: InstrumentType,
    ) -> Result<TopOfBook, EngineError> {
        Ok(self.get_order_book(symbol, category, 1).await?.top_of_book())
    }

    async fn get_order_book(
        &self,
        symbol: &str,
        _category: InstrumentType,
        _depth: u32,
    ) -> Result<OrderBookSnapshot, EngineError> {
        let books = self.books.lock();
        let (bids, asks) = books.get(symbol).cloned().ok_or_else(|| {
            EngineError::api(&self.venue, "get_order_book", -1, "unknown symbol")
        })?;
        Ok(OrderBookSnapshot {
            venue: self.venue.clone(),
            symbol: symbol.to_string(),
            bids,
            asks,
            sequence: 1,
            observed_at: Utc::now(),
        })
    }

    async fn place_order(&self, params: &OrderParams) -> Result<OrderAck, EngineError> {
        if !self.authenticated {
            return Err(EngineError::not_authenticated(&self.venue, "place_order"));
        }
        self.placed.lock().push(params.clone());

        let delay = *self.order_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self
            .order_scripts
            .lock()
            .get_mut(&params.symbol)
            .and_then(|queue| queue.pop_front());

        self.completed.fetch_add(1, Ordering::Relaxed);
        match scripted {
            Some(result) => result,
            None => {
                let id = self.order_counter.fetch_add(1, Ordering::Relaxed);
                Ok(OrderAck {
                    order_id: format!("mock-{}", id),
                    price: None,
                })
            }
        }
    }

    async fn cancel_order(
        &self,
        _symbol: &str,
        order_id: &str,
        _category: InstrumentType,
    ) -> Result<(), EngineError> {
        self.cancelled.lock().push(order_id.to_string());
        Ok(())
    }

    async fn get_balance(&self) -> Result<Vec<AssetBalance>, EngineError> {
        Ok(Vec::new())
    }

    async fn get_position(&self, _symbol: &str) -> Result<Option<Position>, EngineError> {
        Ok(None)
    }

    async fn test_connection(&self) -> Result<bool, EngineError> {
        Ok(true)
    }

    async fn cleanup(&self) -> Result<(), EngineError> {
        Ok(())
    }

    fn ws_endpoint(&self, _category: InstrumentType) -> String {
        // Discard port: connect always fails fast, driving the reconnect path
        "ws://127.0.0.1:9".to_string()
    }

    fn subscribe_tickers(&self, _items: &[TickerSubscription]) -> Vec<String> {
        Vec::new()
    }

    fn unsubscribe_tickers(&self, _items: &[TickerSubscription]) -> Vec<String> {
        Vec::new()
    }

    fn parse_ws_message(&self, _category: InstrumentType, _text: &str) -> Option<BookUpdate> {
        None
    }
}
