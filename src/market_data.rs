//! In-memory market data cache
//!
//! Keeps the latest top-of-book and full order-book snapshot per
//! (venue, category, symbol). Entries are written only by the owning
//! venue's ConnectionManager and read by any number of concurrent
//! evaluators. There is no TTL eviction: staleness is the reader's
//! responsibility (readers fall back to a one-shot REST fetch).

use crate::types::{InstrumentType, OrderBookSnapshot, PriceLevel, TopOfBook};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::Notify;

/// Cache key for one subscribed book
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BookKey {
    pub venue: String,
    pub category: InstrumentType,
    pub symbol: String,
}

impl BookKey {
    pub fn new(venue: &str, category: InstrumentType, symbol: &str) -> Self {
        Self {
            venue: venue.to_string(),
            category,
            symbol: symbol.to_string(),
        }
    }
}

/// One parsed book message from a venue stream (or a REST fallback fetch)
#[derive(Debug, Clone)]
pub struct BookUpdate {
    pub symbol: String,
    pub category: InstrumentType,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub sequence: u64,
    /// Snapshot replaces the book; delta merges levels (qty 0 removes)
    pub is_snapshot: bool,
}

#[derive(Debug, Default, Clone)]
pub struct CacheStats {
    pub snapshots_applied: u64,
    pub deltas_applied: u64,
    pub last_update: Option<chrono::DateTime<Utc>>,
}

struct CacheEntry {
    top: TopOfBook,
    book: OrderBookSnapshot,
}

/// Thread-safe market data cache
pub struct MarketDataCache {
    entries: DashMap<BookKey, CacheEntry>,
    /// Wakes pair evaluation tasks when either leg ticks. Created lazily so
    /// tasks can wait on keys that have not ticked yet.
    notifiers: DashMap<BookKey, Arc<Notify>>,
    stats: RwLock<CacheStats>,
}

impl MarketDataCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            notifiers: DashMap::new(),
            stats: RwLock::new(CacheStats::default()),
        }
    }

    /// Latest top-of-book, or None if the key never ticked
    pub fn top_of_book(&self, key: &BookKey) -> Option<TopOfBook> {
        self.entries.get(key).map(|e| e.top.clone())
    }

    /// Latest full snapshot, or None if the key never ticked
    pub fn order_book(&self, key: &BookKey) -> Option<OrderBookSnapshot> {
        self.entries.get(key).map(|e| e.book.clone())
    }

    /// Notify handle for a key; tick-driven evaluators wait on this
    pub fn notifier(&self, key: &BookKey) -> Arc<Notify> {
        self.notifiers
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    /// Apply a parsed book update from the venue that owns this entry.
    /// Updates from a single stream arrive in receipt order; out-of-sequence
    /// deltas are dropped (sequence 0 always applies).
    pub fn apply_update(&self, venue: &str, update: BookUpdate) {
        let key = BookKey::new(venue, update.category, &update.symbol);
        let observed_at = Utc::now();

        {
            let mut entry = self.entries.entry(key.clone()).or_insert_with(|| {
                let book = OrderBookSnapshot {
                    venue: venue.to_string(),
                    symbol: update.symbol.clone(),
                    bids: Vec::new(),
                    asks: Vec::new(),
                    sequence: 0,
                    observed_at,
                };
                CacheEntry {
                    top: book.top_of_book(),
                    book,
                }
            });

            if update.is_snapshot {
                entry.book.bids = update.bids;
                entry.book.asks = update.asks;
                sort_levels(&mut entry.book);
            } else {
                if update.sequence != 0 && update.sequence <= entry.book.sequence {
                    return;
                }
                for level in update.bids {
                    merge_level(&mut entry.book.bids, level);
                }
                for level in update.asks {
                    merge_level(&mut entry.book.asks, level);
                }
                sort_levels(&mut entry.book);
            }
            entry.book.sequence = update.sequence;
            entry.book.observed_at = observed_at;
            entry.top = entry.book.top_of_book();
        }

        {
            let mut stats = self.stats.write();
            if update.is_snapshot {
                stats.snapshots_applied += 1;
            } else {
                stats.deltas_applied += 1;
            }
            stats.last_update = Some(observed_at);
        }

        if let Some(notify) = self.notifiers.get(&key) {
            notify.notify_waiters();
        }
    }

    /// Drop a key's entry and notifier (e.g. after the last subscriber left)
    pub fn evict(&self, key: &BookKey) {
        self.entries.remove(key);
        self.notifiers.remove(key);
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.read().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for MarketDataCache {
    fn default() -> Self {
        Self::new()
    }
}

fn sort_levels(book: &mut OrderBookSnapshot) {
    book.bids
        .sort_by(|a, b| b.price.partial_cmp(&a.price).unwrap_or(std::cmp::Ordering::Equal));
    book.asks
        .sort_by(|a, b| a.price.partial_cmp(&b.price).unwrap_or(std::cmp::Ordering::Equal));
}

fn merge_level(levels: &mut Vec<PriceLevel>, update: PriceLevel) {
    if let Some(pos) = levels.iter().position(|l| l.price == update.price) {
        if update.qty <= 0.0 {
            levels.remove(pos);
        } else {
            levels[pos].qty = update.qty;
        }
    } else if update.qty > 0.0 {
        levels.push(update);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level(price: f64, qty: f64) -> PriceLevel {
        PriceLevel { price, qty }
    }

    #[test]
    fn test_snapshot_then_read() {
        let cache = MarketDataCache::new();
        let key = BookKey::new("bybit", InstrumentType::Spot, "BTCUSDT");

        assert!(cache.top_of_book(&key).is_none());

        cache.apply_update(
            "bybit",
            BookUpdate {
                symbol: "BTCUSDT".to_string(),
                category: InstrumentType::Spot,
                bids: vec![level(50000.0, 1.0), level(49999.0, 2.0)],
                asks: vec![level(50001.0, 1.5)],
                sequence: 1,
                is_snapshot: true,
            },
        );

        let top = cache.top_of_book(&key).unwrap();
        assert_eq!(top.bid.unwrap().price, 50000.0);
        assert_eq!(top.ask.unwrap().price, 50001.0);
        assert!(top.is_fresh(2000));
    }

    #[test]
    fn test_delta_merges_and_removes_levels() {
        let cache = MarketDataCache::new();
        let key = BookKey::new("bybit", InstrumentType::Linear, "ETHUSDT");

        cache.apply_update(
            "bybit",
            BookUpdate {
                symbol: "ETHUSDT".to_string(),
                category: InstrumentType::Linear,
                bids: vec![level(3000.0, 1.0), level(2999.0, 1.0)],
                asks: vec![level(3001.0, 1.0)],
                sequence: 10,
                is_snapshot: true,
            },
        );

        // Remove the best bid, improve the ask
        cache.apply_update(
            "bybit",
            BookUpdate {
                symbol: "ETHUSDT".to_string(),
                category: InstrumentType::Linear,
                bids: vec![level(3000.0, 0.0)],
                asks: vec![level(3000.5, 2.0)],
                sequence: 11,
                is_snapshot: false,
            },
        );

        let top = cache.top_of_book(&key).unwrap();
        assert_eq!(top.bid.unwrap().price, 2999.0);
        assert_eq!(top.ask.unwrap().price, 3000.5);
    }

    #[test]
    fn test_out_of_sequence_delta_dropped() {
        let cache = MarketDataCache::new();
        let key = BookKey::new("bybit", InstrumentType::Spot, "BTCUSDT");

        cache.apply_update(
            "bybit",
            BookUpdate {
                symbol: "BTCUSDT".to_string(),
                category: InstrumentType::Spot,
                bids: vec![level(50000.0, 1.0)],
                asks: vec![level(50001.0, 1.0)],
                sequence: 20,
                is_snapshot: true,
            },
        );

        cache.apply_update(
            "bybit",
            BookUpdate {
                symbol: "BTCUSDT".to_string(),
                category: InstrumentType::Spot,
                bids: vec![level(40000.0, 1.0)],
                asks: vec![],
                sequence: 5,
                is_snapshot: false,
            },
        );

        let top = cache.top_of_book(&key).unwrap();
        assert_eq!(top.bid.unwrap().price, 50000.0);
    }

    #[tokio::test]
    async fn test_notifier_wakes_on_update() {
        let cache = Arc::new(MarketDataCache::new());
        let key = BookKey::new("binance", InstrumentType::Spot, "BTCUSDT");
        let notify = cache.notifier(&key);

        let waiter = {
            let notify = Arc::clone(&notify);
            tokio::spawn(async move { notify.notified().await })
        };
        tokio::task::yield_now().await;

        cache.apply_update(
            "binance",
            BookUpdate {
                symbol: "BTCUSDT".to_string(),
                category: InstrumentType::Spot,
                bids: vec![level(50000.0, 1.0)],
                asks: vec![level(50001.0, 1.0)],
                sequence: 1,
                is_snapshot: true,
            },
        );

        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("notifier did not fire")
            .unwrap();
    }
}
