//! Per-venue connection management
//!
//! One ConnectionManager per venue. Wraps the venue adapter with:
//! - a token-bucket rate limiter consulted before every REST call
//! - request/latency statistics
//! - the venue's connection state (owned here, read-only elsewhere)
//! - one WebSocket task per instrument category: subscribe, pump book
//!   updates into the market data cache, reconnect with a capped attempt
//!   count, re-subscribe the preserved subscription set after reconnect
//!
//! REST calls keep working independently of WebSocket state; the
//! `fresh_top_of_book` fallback covers stale or missing stream data.

use crate::error::EngineError;
use crate::exchange::{ExchangeAdapter, OrderAck, OrderParams, TickerSubscription};
use crate::market_data::{BookKey, MarketDataCache};
use crate::types::{
    ConnectionStats, InstrumentType, OrderBookSnapshot, TopOfBook, VenueConnectionState,
};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

const REST_FALLBACK_DEPTH: u32 = 5;

/// Connection tuning, sliced out of EngineConfig
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub reconnect_interval_ms: u64,
    pub max_reconnect_attempts: u32,
    pub rate_limit_requests: u32,
    pub rate_limit_window_ms: u64,
    pub quote_freshness_ms: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            reconnect_interval_ms: 5000,
            max_reconnect_attempts: 10,
            rate_limit_requests: 120,
            rate_limit_window_ms: 1000,
            quote_freshness_ms: 2000,
        }
    }
}

/// Fixed-window token bucket. Callers back off on denial; requests are
/// never queued.
pub struct RateLimiter {
    max_requests: u32,
    window: Duration,
    inner: Mutex<RateLimiterWindow>,
}

struct RateLimiterWindow {
    window_start: Instant,
    count: u32,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            inner: Mutex::new(RateLimiterWindow {
                window_start: Instant::now(),
                count: 0,
            }),
        }
    }

    /// Take one token, or report how long until the window rolls over
    pub fn check(&self) -> Result<(), u64> {
        let mut inner = self.inner.lock();
        let elapsed = inner.window_start.elapsed();
        if elapsed >= self.window {
            inner.window_start = Instant::now();
            inner.count = 0;
        }
        if inner.count < self.max_requests {
            inner.count += 1;
            Ok(())
        } else {
            let retry_after = self.window.saturating_sub(elapsed);
            Err(retry_after.as_millis() as u64)
        }
    }

    /// Fresh window (used after reconnects)
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.window_start = Instant::now();
        inner.count = 0;
    }
}

#[derive(Default)]
struct StatsInner {
    requests_total: AtomicU64,
    requests_failed: AtomicU64,
    total_latency_us: AtomicU64,
    ws_messages: AtomicU64,
    ws_reconnects: AtomicU64,
}

struct WsChannel {
    outbound_tx: mpsc::UnboundedSender<String>,
    shutdown_tx: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<()>,
}

/// Per-venue REST + WebSocket connection manager
pub struct ConnectionManager {
    adapter: Arc<dyn ExchangeAdapter>,
    cache: Arc<MarketDataCache>,
    settings: ConnectionSettings,
    rate_limiter: Arc<RateLimiter>,
    state: Arc<RwLock<VenueConnectionState>>,
    stats: Arc<StatsInner>,
    subscriptions: Arc<Mutex<HashSet<TickerSubscription>>>,
    channels: Mutex<Vec<(InstrumentType, WsChannel)>>,
}

impl ConnectionManager {
    pub fn new(
        adapter: Arc<dyn ExchangeAdapter>,
        cache: Arc<MarketDataCache>,
        settings: ConnectionSettings,
    ) -> Self {
        let venue = adapter.venue().to_string();
        let rate_limiter = Arc::new(RateLimiter::new(
            settings.rate_limit_requests,
            Duration::from_millis(settings.rate_limit_window_ms),
        ));
        Self {
            adapter,
            cache,
            settings,
            rate_limiter,
            state: Arc::new(RwLock::new(VenueConnectionState::new(&venue))),
            stats: Arc::new(StatsInner::default()),
            subscriptions: Arc::new(Mutex::new(HashSet::new())),
            channels: Mutex::new(Vec::new()),
        }
    }

    pub fn venue(&self) -> &str {
        self.adapter.venue()
    }

    pub fn supports_category(&self, category: InstrumentType) -> bool {
        self.adapter.supports_category(category)
    }

    pub fn state(&self) -> VenueConnectionState {
        self.state.read().clone()
    }

    pub fn stats(&self) -> ConnectionStats {
        let total = self.stats.requests_total.load(Ordering::Relaxed);
        let latency_us = self.stats.total_latency_us.load(Ordering::Relaxed);
        ConnectionStats {
            requests_total: total,
            requests_failed: self.stats.requests_failed.load(Ordering::Relaxed),
            avg_latency_ms: if total > 0 {
                latency_us as f64 / total as f64 / 1000.0
            } else {
                0.0
            },
            ws_messages: self.stats.ws_messages.load(Ordering::Relaxed),
            ws_reconnects: self.stats.ws_reconnects.load(Ordering::Relaxed),
        }
    }

    /// Validate the venue connection and credentials
    pub async fn initialize(&self) -> Result<(), EngineError> {
        self.adapter.initialize().await?;
        self.state.write().authenticated = self.adapter.is_authenticated();
        Ok(())
    }

    /// Consulted before every REST call. Denial means back off, not queue.
    pub fn check_rate_limit(&self) -> Result<(), EngineError> {
        self.rate_limiter.check().map_err(|retry_after_ms| {
            EngineError::RateLimitExceeded {
                venue: self.venue().to_string(),
                retry_after_ms,
            }
        })
    }

    async fn timed<T, F>(&self, fut: F) -> Result<T, EngineError>
    where
        F: Future<Output = Result<T, EngineError>>,
    {
        self.check_rate_limit()?;
        let start = Instant::now();
        let result = fut.await;
        self.stats.requests_total.fetch_add(1, Ordering::Relaxed);
        self.stats
            .total_latency_us
            .fetch_add(start.elapsed().as_micros() as u64, Ordering::Relaxed);
        if result.is_err() {
            self.stats.requests_failed.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    pub async fn get_top_of_book(
        &self,
        symbol: &str,
        category: InstrumentType,
    ) -> Result<TopOfBook, EngineError> {
        self.timed(self.adapter.get_top_of_book(symbol, category)).await
    }

    pub async fn get_order_book(
        &self,
        symbol: &str,
        category: InstrumentType,
        depth: u32,
    ) -> Result<OrderBookSnapshot, EngineError> {
        self.timed(self.adapter.get_order_book(symbol, category, depth)).await
    }

    pub async fn place_order(&self, params: &OrderParams) -> Result<OrderAck, EngineError> {
        self.timed(self.adapter.place_order(params)).await
    }

    pub async fn cancel_order(
        &self,
        symbol: &str,
        order_id: &str,
        category: InstrumentType,
    ) -> Result<(), EngineError> {
        self.timed(self.adapter.cancel_order(symbol, order_id, category))
            .await
    }

    pub async fn get_balance(&self) -> Result<Vec<crate::exchange::AssetBalance>, EngineError> {
        self.timed(self.adapter.get_balance()).await
    }

    pub async fn get_position(
        &self,
        symbol: &str,
    ) -> Result<Option<crate::exchange::Position>, EngineError> {
        self.timed(self.adapter.get_position(symbol)).await
    }

    /// Cached top-of-book when fresh, otherwise a one-shot REST order-book
    /// fetch. The fetched book is written back to the cache here because
    /// this manager owns its venue's entries.
    pub async fn fresh_top_of_book(
        &self,
        symbol: &str,
        category: InstrumentType,
    ) -> Result<TopOfBook, EngineError> {
        let key = BookKey::new(self.venue(), category, symbol);
        if let Some(top) = self.cache.top_of_book(&key) {
            if top.is_fresh(self.settings.quote_freshness_ms) {
                return Ok(top);
            }
        }

        debug!(venue = %self.venue(), symbol = %symbol, "cache miss or stale quote, falling back to REST");
        let book = self
            .get_order_book(symbol, category, REST_FALLBACK_DEPTH)
            .await?;
        let top = book.top_of_book();
        self.cache.apply_update(
            self.venue(),
            crate::market_data::BookUpdate {
                symbol: symbol.to_string(),
                category,
                bids: book.bids,
                asks: book.asks,
                sequence: book.sequence,
                is_snapshot: true,
            },
        );
        Ok(top)
    }

    /// Add a stream subscription. Spawns the category's socket task on first
    /// use; a live socket gets the new frame immediately.
    pub fn subscribe(&self, sub: TickerSubscription) {
        {
            let mut subs = self.subscriptions.lock();
            if !subs.insert(sub.clone()) {
                return;
            }
        }
        let category = sub.category;
        let mut channels = self.channels.lock();
        if let Some((_, channel)) = channels.iter().find(|(c, _)| *c == category) {
            for frame in self.adapter.subscribe_tickers(&[sub]) {
                let _ = channel.outbound_tx.send(frame);
            }
        } else {
            let channel = self.spawn_channel(category);
            channels.push((category, channel));
        }
    }

    /// Drop a stream subscription. Tears the category's socket down when the
    /// last subscription leaves, and evicts the cache entry.
    pub fn unsubscribe(&self, sub: &TickerSubscription) {
        {
            let mut subs = self.subscriptions.lock();
            if !subs.remove(sub) {
                return;
            }
        }
        self.cache
            .evict(&BookKey::new(self.venue(), sub.category, &sub.symbol));

        let category_empty = {
            let subs = self.subscriptions.lock();
            !subs.iter().any(|s| s.category == sub.category)
        };

        let mut channels = self.channels.lock();
        if category_empty {
            if let Some(pos) = channels.iter().position(|(c, _)| *c == sub.category) {
                let (_, channel) = channels.remove(pos);
                let _ = channel.shutdown_tx.send(true);
                channel.handle.abort();
            }
        } else if let Some((_, channel)) = channels.iter().find(|(c, _)| *c == sub.category) {
            for frame in self.adapter.unsubscribe_tickers(std::slice::from_ref(sub)) {
                let _ = channel.outbound_tx.send(frame);
            }
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    /// Stop all socket tasks and release adapter resources
    pub async fn shutdown(&self) {
        let channels: Vec<(InstrumentType, WsChannel)> =
            std::mem::take(&mut *self.channels.lock());
        for (_, channel) in channels {
            let _ = channel.shutdown_tx.send(true);
            channel.handle.abort();
        }
        self.state.write().ws_connected = false;
        if let Err(e) = self.adapter.cleanup().await {
            warn!(venue = %self.venue(), "adapter cleanup failed: {}", e);
        }
    }

    fn spawn_channel(&self, category: InstrumentType) -> WsChannel {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let adapter = Arc::clone(&self.adapter);
        let cache = Arc::clone(&self.cache);
        let state = Arc::clone(&self.state);
        let stats = Arc::clone(&self.stats);
        let subscriptions = Arc::clone(&self.subscriptions);
        let settings = self.settings.clone();
        let rate_limiter = Arc::clone(&self.rate_limiter);

        let handle = tokio::spawn(Self::run_channel(
            adapter,
            cache,
            state,
            stats,
            subscriptions,
            rate_limiter,
            settings,
            category,
            outbound_rx,
            shutdown_rx,
        ));

        WsChannel {
            outbound_tx,
            shutdown_tx,
            handle,
        }
    }

    /// Reconnect loop: preserves the subscription set across reconnects,
    /// caps attempts, and reports exhaustion instead of retrying forever.
    #[allow(clippy::too_many_arguments)]
    async fn run_channel(
        adapter: Arc<dyn ExchangeAdapter>,
        cache: Arc<MarketDataCache>,
        state: Arc<RwLock<VenueConnectionState>>,
        stats: Arc<StatsInner>,
        subscriptions: Arc<Mutex<HashSet<TickerSubscription>>>,
        rate_limiter: Arc<RateLimiter>,
        settings: ConnectionSettings,
        category: InstrumentType,
        mut outbound_rx: mpsc::UnboundedReceiver<String>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let venue = adapter.venue().to_string();
        let mut attempts: u32 = 0;

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let result = Self::run_socket(
                &adapter,
                &cache,
                &state,
                &stats,
                &subscriptions,
                &rate_limiter,
                category,
                &mut outbound_rx,
                &mut shutdown_rx,
                &mut attempts,
            )
            .await;

            match result {
                Ok(()) => break, // clean shutdown
                Err(e) => {
                    attempts += 1;
                    stats.ws_reconnects.fetch_add(1, Ordering::Relaxed);
                    {
                        let mut st = state.write();
                        st.ws_connected = false;
                        st.reconnect_attempts = attempts;
                        st.last_error = Some(e.to_string());
                    }

                    if attempts >= settings.max_reconnect_attempts {
                        error!(
                            venue = %venue,
                            category = %category,
                            attempts = attempts,
                            "WebSocket reconnect attempts exhausted, giving up: {}", e
                        );
                        break;
                    }

                    warn!(
                        venue = %venue,
                        category = %category,
                        attempt = attempts,
                        "WebSocket disconnected, reconnecting in {}ms: {}",
                        settings.reconnect_interval_ms, e
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(settings.reconnect_interval_ms)) => {}
                        _ = shutdown_rx.changed() => break,
                    }
                }
            }
        }

        info!(venue = %venue, category = %category, "WebSocket task stopped");
    }

    /// One socket lifetime: connect, resubscribe, pump until close/error.
    /// Returns Ok(()) only on clean shutdown.
    #[allow(clippy::too_many_arguments)]
    async fn run_socket(
        adapter: &Arc<dyn ExchangeAdapter>,
        cache: &Arc<MarketDataCache>,
        state: &Arc<RwLock<VenueConnectionState>>,
        stats: &Arc<StatsInner>,
        subscriptions: &Arc<Mutex<HashSet<TickerSubscription>>>,
        rate_limiter: &Arc<RateLimiter>,
        category: InstrumentType,
        outbound_rx: &mut mpsc::UnboundedReceiver<String>,
        shutdown_rx: &mut watch::Receiver<bool>,
        attempts: &mut u32,
    ) -> Result<(), EngineError> {
        let venue = adapter.venue().to_string();
        let endpoint = adapter.ws_endpoint(category);

        let (ws_stream, _) = connect_async(&endpoint)
            .await
            .map_err(|e| EngineError::connection(&venue, "ws_connect", e))?;
        let (mut write, mut read) = ws_stream.split();

        info!(venue = %venue, category = %category, "WebSocket connected to {}", endpoint);
        *attempts = 0;
        rate_limiter.reset();
        {
            let mut st = state.write();
            st.ws_connected = true;
            st.reconnect_attempts = 0;
            st.last_error = None;
        }

        // Re-subscribe everything this category had before the reconnect
        let current: Vec<TickerSubscription> = {
            let subs = subscriptions.lock();
            subs.iter().filter(|s| s.category == category).cloned().collect()
        };
        for frame in adapter.subscribe_tickers(&current) {
            write
                .send(Message::Text(frame))
                .await
                .map_err(|e| EngineError::connection(&venue, "ws_subscribe", e))?;
        }

        let mut heartbeat = tokio::time::interval(Duration::from_secs(20));
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        heartbeat.tick().await; // first tick is immediate

        loop {
            tokio::select! {
                message = read.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            stats.ws_messages.fetch_add(1, Ordering::Relaxed);
                            if let Some(update) = adapter.parse_ws_message(category, &text) {
                                cache.apply_update(&venue, update);
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            return Err(EngineError::connection(&venue, "ws_read", "stream closed"));
                        }
                        Some(Err(e)) => {
                            return Err(EngineError::connection(&venue, "ws_read", e));
                        }
                        Some(Ok(_)) => {}
                    }
                }
                frame = outbound_rx.recv() => {
                    if let Some(frame) = frame {
                        write
                            .send(Message::Text(frame))
                            .await
                            .map_err(|e| EngineError::connection(&venue, "ws_send", e))?;
                    }
                }
                _ = heartbeat.tick() => {
                    if let Some(frame) = adapter.heartbeat_frame() {
                        let _ = write.send(Message::Text(frame)).await;
                    }
                }
                _ = shutdown_rx.changed() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::mock::MockAdapter;
    use crate::types::PriceLevel;

    fn manager_with(adapter: MockAdapter, settings: ConnectionSettings) -> ConnectionManager {
        ConnectionManager::new(Arc::new(adapter), Arc::new(MarketDataCache::new()), settings)
    }

    #[test]
    fn test_rate_limiter_denies_after_bucket_drains() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        assert!(limiter.check().is_ok());
        assert!(limiter.check().is_ok());
        assert!(limiter.check().is_ok());
        let retry_after = limiter.check().unwrap_err();
        assert!(retry_after > 0);

        limiter.reset();
        assert!(limiter.check().is_ok());
    }

    #[tokio::test]
    async fn test_rest_call_records_stats() {
        let adapter = MockAdapter::new("mock");
        adapter.set_order_book(
            "BTCUSDT",
            vec![PriceLevel { price: 50000.0, qty: 1.0 }],
            vec![PriceLevel { price: 50001.0, qty: 1.0 }],
        );
        let manager = manager_with(adapter, ConnectionSettings::default());

        let book = manager
            .get_order_book("BTCUSDT", InstrumentType::Spot, 5)
            .await
            .unwrap();
        assert_eq!(book.best_bid().unwrap().price, 50000.0);

        let stats = manager.stats();
        assert_eq!(stats.requests_total, 1);
        assert_eq!(stats.requests_failed, 0);
    }

    #[tokio::test]
    async fn test_rate_limit_surfaces_as_engine_error() {
        let adapter = MockAdapter::new("mock");
        adapter.set_order_book("BTCUSDT", vec![], vec![]);
        let settings = ConnectionSettings {
            rate_limit_requests: 1,
            rate_limit_window_ms: 60_000,
            ..Default::default()
        };
        let manager = manager_with(adapter, settings);

        manager
            .get_order_book("BTCUSDT", InstrumentType::Spot, 5)
            .await
            .unwrap();
        let err = manager
            .get_order_book("BTCUSDT", InstrumentType::Spot, 5)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::RateLimitExceeded { .. }));
    }

    #[tokio::test]
    async fn test_fresh_top_of_book_falls_back_to_rest_on_miss() {
        let adapter = MockAdapter::new("mock");
        adapter.set_order_book(
            "ETHUSDT",
            vec![PriceLevel { price: 3000.0, qty: 2.0 }],
            vec![PriceLevel { price: 3001.0, qty: 2.0 }],
        );
        let cache = Arc::new(MarketDataCache::new());
        let manager = ConnectionManager::new(
            Arc::new(adapter),
            Arc::clone(&cache),
            ConnectionSettings::default(),
        );

        // Nothing ticked yet: must go through REST and backfill the cache
        let top = manager
            .fresh_top_of_book("ETHUSDT", InstrumentType::Spot)
            .await
            .unwrap();
        assert_eq!(top.bid.unwrap().price, 3000.0);
        assert_eq!(manager.stats().requests_total, 1);

        // Second read is served from cache, no extra request
        let top = manager
            .fresh_top_of_book("ETHUSDT", InstrumentType::Spot)
            .await
            .unwrap();
        assert_eq!(top.ask.unwrap().price, 3001.0);
        assert_eq!(manager.stats().requests_total, 1);
    }

    #[tokio::test]
    async fn test_reconnect_attempts_exhaust_and_clear_ws_flag() {
        // MockAdapter points at a port nothing listens on
        let adapter = MockAdapter::new("mock");
        let settings = ConnectionSettings {
            reconnect_interval_ms: 10,
            max_reconnect_attempts: 3,
            ..Default::default()
        };
        let manager = manager_with(adapter, settings);

        manager.subscribe(TickerSubscription {
            symbol: "BTCUSDT".to_string(),
            category: InstrumentType::Spot,
        });

        // Wait for the channel task to burn through its attempts
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let state = manager.state();
            if state.reconnect_attempts >= 3 {
                assert!(!state.ws_connected);
                assert!(state.last_error.is_some());
                break;
            }
            assert!(Instant::now() < deadline, "reconnect attempts never exhausted");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        // No further attempts are scheduled once exhausted
        let attempts = manager.state().reconnect_attempts;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(manager.state().reconnect_attempts, attempts);
    }

    #[tokio::test]
    async fn test_unsubscribe_releases_cache_entry() {
        let adapter = MockAdapter::new("mock");
        let cache = Arc::new(MarketDataCache::new());
        let manager = ConnectionManager::new(
            Arc::new(adapter),
            Arc::clone(&cache),
            ConnectionSettings::default(),
        );
        let sub = TickerSubscription {
            symbol: "BTCUSDT".to_string(),
            category: InstrumentType::Spot,
        };

        manager.subscribe(sub.clone());
        assert_eq!(manager.subscription_count(), 1);

        cache.apply_update(
            "mock",
            crate::market_data::BookUpdate {
                symbol: "BTCUSDT".to_string(),
                category: InstrumentType::Spot,
                bids: vec![PriceLevel { price: 1.0, qty: 1.0 }],
                asks: vec![],
                sequence: 1,
                is_snapshot: true,
            },
        );

        manager.unsubscribe(&sub);
        assert_eq!(manager.subscription_count(), 0);
        let key = BookKey::new("mock", InstrumentType::Spot, "BTCUSDT");
        assert!(cache.top_of_book(&key).is_none());
    }
}
