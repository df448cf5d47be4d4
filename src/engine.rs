//! Engine façade
//!
//! Owns the venue connections, the pair registry, the TWAP scheduler, the
//! risk gate, and the event bus. Every externally visible operation goes
//! through here; internals never reach for globals.
//!
//! Each monitored pair gets its own evaluation task, woken by either leg's
//! cache notifier and by a fallback poll interval. A per-pair async lock
//! serializes executions so one pair never has two attempts in flight, while
//! different pairs execute independently.

use crate::config::EngineConfig;
use crate::connection::{ConnectionManager, ConnectionSettings};
use crate::detector;
use crate::error::EngineError;
use crate::events::{EngineEvent, EventBus};
use crate::exchange::binance::BinanceAdapter;
use crate::exchange::bybit::BybitAdapter;
use crate::exchange::{ExchangeAdapter, TickerSubscription};
use crate::executor::ExecutionCoordinator;
use crate::market_data::MarketDataCache;
use crate::risk::RiskGate;
use crate::twap::{TwapControl, TwapRequest, TwapScheduler};
use crate::types::{
    ConnectionStats, EngineStats, ExecutionMode, ExecutionStatus, LegSpec, MonitoringPair,
    RiskLimits, TwapPlan, VenueConnectionState,
};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Parameters for registering a new monitoring pair
#[derive(Debug, Clone, Deserialize)]
pub struct PairRequest {
    pub leg1: LegSpec,
    pub leg2: LegSpec,
    pub threshold_percent: f64,
    pub amount: f64,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    #[serde(default)]
    pub max_executions: Option<u32>,
}

/// Partial update of a pair's mutable fields. Legs are fixed for the life
/// of a pair; replace the pair to change them.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PairUpdate {
    pub threshold_percent: Option<f64>,
    pub amount: Option<f64>,
    pub enabled: Option<bool>,
    pub execution_mode: Option<ExecutionMode>,
    /// Some(None) clears the cap, Some(Some(n)) sets it
    #[serde(default)]
    pub max_executions: Option<Option<u32>>,
}

/// Full status snapshot for the outer API layer
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub is_running: bool,
    pub venues: Vec<VenueStatus>,
    pub pairs: Vec<MonitoringPair>,
    pub twap_plans: Vec<TwapPlan>,
    pub stats: EngineStats,
    pub risk_limits: RiskLimits,
    pub daily_loss: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct VenueStatus {
    pub state: VenueConnectionState,
    pub requests: ConnectionStats,
}

#[derive(Default)]
struct EngineStatsInner {
    ticks_evaluated: AtomicU64,
    opportunities_found: AtomicU64,
    executions_attempted: AtomicU64,
    executions_succeeded: AtomicU64,
}

impl EngineStatsInner {
    fn snapshot(&self) -> EngineStats {
        EngineStats {
            ticks_evaluated: self.ticks_evaluated.load(Ordering::Relaxed),
            opportunities_found: self.opportunities_found.load(Ordering::Relaxed),
            executions_attempted: self.executions_attempted.load(Ordering::Relaxed),
            executions_succeeded: self.executions_succeeded.load(Ordering::Relaxed),
        }
    }
}

/// State shared with per-pair evaluation tasks
struct EngineShared {
    pairs: DashMap<String, MonitoringPair>,
    exec_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    connections: HashMap<String, Arc<ConnectionManager>>,
    cache: Arc<MarketDataCache>,
    executor: Arc<ExecutionCoordinator>,
    bus: EventBus,
    stats: EngineStatsInner,
    poll_interval_ms: u64,
}

pub struct ArbitrageEngine {
    shared: Arc<EngineShared>,
    twap: TwapScheduler,
    risk: Arc<RiskGate>,
    /// Shutdown handles for the per-pair evaluation tasks. Tasks are only
    /// ever signalled, never aborted: an execution already submitted must
    /// finish and report its outcome.
    tasks: DashMap<String, watch::Sender<bool>>,
    /// Refcounted stream subscriptions; two pairs sharing a leg share one
    sub_refs: Mutex<HashMap<(String, TickerSubscription), usize>>,
    running: AtomicBool,
}

impl ArbitrageEngine {
    /// Engine wired to the real venues. Venues without credentials run in
    /// public-data-only mode.
    pub fn new(config: EngineConfig) -> Self {
        let adapters: Vec<Arc<dyn ExchangeAdapter>> = vec![
            Arc::new(BybitAdapter::new(config.bybit.clone())),
            Arc::new(BinanceAdapter::new(config.binance.clone())),
        ];
        Self::with_adapters(config, adapters)
    }

    /// Engine over an explicit adapter set (tests inject doubles here)
    pub fn with_adapters(config: EngineConfig, adapters: Vec<Arc<dyn ExchangeAdapter>>) -> Self {
        let cache = Arc::new(MarketDataCache::new());
        let settings = ConnectionSettings {
            reconnect_interval_ms: config.reconnect_interval_ms,
            max_reconnect_attempts: config.max_reconnect_attempts,
            rate_limit_requests: config.rate_limit_requests,
            rate_limit_window_ms: config.rate_limit_window_ms,
            quote_freshness_ms: config.quote_freshness_ms,
        };

        let mut connections = HashMap::new();
        for adapter in adapters {
            let venue = adapter.venue().to_string();
            connections.insert(
                venue,
                Arc::new(ConnectionManager::new(
                    adapter,
                    Arc::clone(&cache),
                    settings.clone(),
                )),
            );
        }

        let bus = EventBus::new();
        let risk = Arc::new(RiskGate::new(config.risk_limits.clone()));
        let executor = Arc::new(ExecutionCoordinator::new(
            connections.clone(),
            Arc::clone(&risk),
            bus.clone(),
        ));
        let twap = TwapScheduler::new(Arc::clone(&executor), bus.clone());

        let shared = Arc::new(EngineShared {
            pairs: DashMap::new(),
            exec_locks: DashMap::new(),
            connections,
            cache,
            executor,
            bus,
            stats: EngineStatsInner::default(),
            poll_interval_ms: config.poll_interval_ms,
        });

        Self {
            shared,
            twap,
            risk,
            tasks: DashMap::new(),
            sub_refs: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Validate every venue connection before accepting work
    pub async fn start(&self) -> Result<(), EngineError> {
        for connection in self.shared.connections.values() {
            connection.initialize().await?;
            info!(
                venue = %connection.venue(),
                authenticated = connection.state().authenticated,
                "venue initialized"
            );
        }
        self.running.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Stop pair tasks and TWAP timers (draining any in-flight execution),
    /// then tear down the venue connections
    pub async fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
        for entry in self.tasks.iter() {
            let _ = entry.value().send(true);
        }
        self.tasks.clear();
        self.twap.shutdown();
        for connection in self.shared.connections.values() {
            connection.shutdown().await;
        }
        info!("engine stopped");
    }

    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.shared.bus.subscribe()
    }

    pub fn update_risk_limits(&self, limits: RiskLimits) {
        self.risk.update_limits(limits);
    }

    // ---- pair registry ----

    pub fn add_pair(&self, request: PairRequest) -> Result<MonitoringPair, EngineError> {
        self.validate_leg(&request.leg1)?;
        self.validate_leg(&request.leg2)?;
        if request.amount <= 0.0 {
            return Err(EngineError::Validation("amount must be positive".to_string()));
        }
        if request.threshold_percent < 0.0 {
            return Err(EngineError::Validation(
                "threshold_percent must not be negative".to_string(),
            ));
        }

        let pair = MonitoringPair {
            id: Uuid::new_v4().to_string(),
            leg1: request.leg1,
            leg2: request.leg2,
            threshold_percent: request.threshold_percent,
            amount: request.amount,
            enabled: true,
            execution_mode: request.execution_mode,
            max_executions: request.max_executions,
            created_at: Utc::now(),
            last_triggered_at: None,
            total_triggers: 0,
        };

        self.acquire_leg(&pair.leg1);
        self.acquire_leg(&pair.leg2);
        self.shared.pairs.insert(pair.id.clone(), pair.clone());
        self.shared
            .exec_locks
            .insert(pair.id.clone(), Arc::new(tokio::sync::Mutex::new(())));
        self.spawn_pair_task(&pair);

        info!(
            pair = %pair.id,
            leg1 = %format!("{}:{}", pair.leg1.venue, pair.leg1.symbol),
            leg2 = %format!("{}:{}", pair.leg2.venue, pair.leg2.symbol),
            threshold = pair.threshold_percent,
            "monitoring pair added"
        );
        self.shared.bus.publish(EngineEvent::PairAdded {
            pair: pair.clone(),
            timestamp: Utc::now(),
        });
        Ok(pair)
    }

    pub fn update_pair(
        &self,
        pair_id: &str,
        update: PairUpdate,
    ) -> Result<MonitoringPair, EngineError> {
        if let Some(amount) = update.amount {
            if amount <= 0.0 {
                return Err(EngineError::Validation("amount must be positive".to_string()));
            }
        }
        if let Some(threshold) = update.threshold_percent {
            if threshold < 0.0 {
                return Err(EngineError::Validation(
                    "threshold_percent must not be negative".to_string(),
                ));
            }
        }

        let updated = {
            let mut entry = self
                .shared
                .pairs
                .get_mut(pair_id)
                .ok_or_else(|| EngineError::NotFound(format!("pair {}", pair_id)))?;
            if let Some(threshold) = update.threshold_percent {
                entry.threshold_percent = threshold;
            }
            if let Some(amount) = update.amount {
                entry.amount = amount;
            }
            if let Some(enabled) = update.enabled {
                entry.enabled = enabled;
            }
            if let Some(mode) = update.execution_mode {
                entry.execution_mode = mode;
            }
            if let Some(max_executions) = update.max_executions {
                entry.max_executions = max_executions;
            }
            entry.clone()
        };

        self.shared.bus.publish(EngineEvent::PairUpdated {
            pair: updated.clone(),
            timestamp: Utc::now(),
        });
        Ok(updated)
    }

    pub fn remove_pair(&self, pair_id: &str) -> Result<(), EngineError> {
        let (_, pair) = self
            .shared
            .pairs
            .remove(pair_id)
            .ok_or_else(|| EngineError::NotFound(format!("pair {}", pair_id)))?;

        if let Some((_, shutdown_tx)) = self.tasks.remove(pair_id) {
            let _ = shutdown_tx.send(true);
        }
        self.shared.exec_locks.remove(pair_id);
        self.release_leg(&pair.leg1);
        self.release_leg(&pair.leg2);

        info!(pair = %pair_id, "monitoring pair removed");
        self.shared.bus.publish(EngineEvent::PairRemoved {
            pair_id: pair_id.to_string(),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    pub fn get_pair(&self, pair_id: &str) -> Option<MonitoringPair> {
        self.shared.pairs.get(pair_id).map(|p| p.clone())
    }

    pub fn pairs(&self) -> Vec<MonitoringPair> {
        self.shared.pairs.iter().map(|p| p.clone()).collect()
    }

    // ---- TWAP ----

    pub fn add_twap_plan(&self, request: TwapRequest) -> Result<TwapPlan, EngineError> {
        self.validate_leg(&request.leg1)?;
        self.validate_leg(&request.leg2)?;
        self.twap.add_plan(request)
    }

    pub fn control_twap_plan(
        &self,
        plan_id: &str,
        action: TwapControl,
    ) -> Result<TwapPlan, EngineError> {
        self.twap.control(plan_id, action)
    }

    pub fn twap_plans(&self) -> Vec<TwapPlan> {
        self.twap.plans()
    }

    // ---- status ----

    pub fn get_status(&self) -> EngineStatus {
        let mut venues: Vec<VenueStatus> = self
            .shared
            .connections
            .values()
            .map(|c| VenueStatus {
                state: c.state(),
                requests: c.stats(),
            })
            .collect();
        venues.sort_by(|a, b| a.state.venue.cmp(&b.state.venue));

        EngineStatus {
            is_running: self.running.load(Ordering::Relaxed),
            venues,
            pairs: self.pairs(),
            twap_plans: self.twap.plans(),
            stats: self.shared.stats.snapshot(),
            risk_limits: self.risk.limits(),
            daily_loss: self.risk.daily_loss(),
        }
    }

    // ---- internals ----

    fn validate_leg(&self, leg: &LegSpec) -> Result<(), EngineError> {
        if leg.symbol.is_empty() {
            return Err(EngineError::Validation("leg symbol must not be empty".to_string()));
        }
        match self.shared.connections.get(&leg.venue) {
            None => Err(EngineError::Validation(format!(
                "venue {} is not registered",
                leg.venue
            ))),
            Some(connection) if !connection.supports_category(leg.instrument) => {
                Err(EngineError::Validation(format!(
                    "venue {} does not serve {} instruments",
                    leg.venue, leg.instrument
                )))
            }
            Some(_) => Ok(()),
        }
    }

    fn acquire_leg(&self, leg: &LegSpec) {
        let sub = TickerSubscription {
            symbol: leg.symbol.clone(),
            category: leg.instrument,
        };
        let mut refs = self.sub_refs.lock();
        let counter = refs.entry((leg.venue.clone(), sub.clone())).or_insert(0);
        *counter += 1;
        if *counter == 1 {
            if let Some(connection) = self.shared.connections.get(&leg.venue) {
                connection.subscribe(sub);
            }
        }
    }

    fn release_leg(&self, leg: &LegSpec) {
        let sub = TickerSubscription {
            symbol: leg.symbol.clone(),
            category: leg.instrument,
        };
        let mut refs = self.sub_refs.lock();
        let key = (leg.venue.clone(), sub.clone());
        if let Some(counter) = refs.get_mut(&key) {
            *counter -= 1;
            if *counter == 0 {
                refs.remove(&key);
                if let Some(connection) = self.shared.connections.get(&leg.venue) {
                    connection.unsubscribe(&sub);
                }
            }
        }
    }

    fn spawn_pair_task(&self, pair: &MonitoringPair) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = Arc::clone(&self.shared);
        let pair_id = pair.id.clone();
        let leg1 = pair.leg1.clone();
        let leg2 = pair.leg2.clone();

        tokio::spawn(async move {
            EngineShared::run_pair(shared, pair_id, leg1, leg2, shutdown_rx).await;
        });
        self.tasks.insert(pair.id.clone(), shutdown_tx);
    }
}

impl EngineShared {
    /// Per-pair evaluation loop: wakes on either leg's book update and on
    /// the fallback poll interval.
    async fn run_pair(
        shared: Arc<EngineShared>,
        pair_id: String,
        leg1: LegSpec,
        leg2: LegSpec,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let key1 = crate::market_data::BookKey::new(&leg1.venue, leg1.instrument, &leg1.symbol);
        let key2 = crate::market_data::BookKey::new(&leg2.venue, leg2.instrument, &leg2.symbol);
        let notify1 = shared.cache.notifier(&key1);
        let notify2 = shared.cache.notifier(&key2);

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            tokio::select! {
                _ = notify1.notified() => {}
                _ = notify2.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(shared.poll_interval_ms)) => {}
                _ = shutdown_rx.changed() => break,
            }
            // Outside the select: a shutdown arriving mid-evaluation waits
            // for any submitted execution to finish and report
            shared.evaluate_pair(&pair_id).await;
        }
        debug!(pair = %pair_id, "pair task stopped");
    }

    async fn evaluate_pair(&self, pair_id: &str) {
        let pair = match self.pairs.get(pair_id) {
            Some(p) => p.clone(),
            None => return,
        };
        if !pair.enabled {
            return;
        }

        let (conn1, conn2) = match (
            self.connections.get(&pair.leg1.venue),
            self.connections.get(&pair.leg2.venue),
        ) {
            (Some(a), Some(b)) => (a, b),
            _ => return,
        };

        // Both legs read at the same moment so the spread is consistent
        let (quote1, quote2) = tokio::join!(
            conn1.fresh_top_of_book(&pair.leg1.symbol, pair.leg1.instrument),
            conn2.fresh_top_of_book(&pair.leg2.symbol, pair.leg2.instrument),
        );
        let (quote1, quote2) = match (quote1, quote2) {
            (Ok(a), Ok(b)) => (a, b),
            (Err(e), _) | (_, Err(e)) => {
                debug!(pair = %pair_id, "no usable quotes this tick: {}", e);
                return;
            }
        };

        self.stats.ticks_evaluated.fetch_add(1, Ordering::Relaxed);
        let opportunity = match detector::evaluate(&pair, &quote1, &quote2) {
            Some(o) => o,
            None => return,
        };

        self.bus.publish(EngineEvent::PriceUpdate {
            pair: pair.clone(),
            opportunity: opportunity.clone(),
            timestamp: Utc::now(),
        });

        if !opportunity.should_trigger {
            return;
        }
        self.stats.opportunities_found.fetch_add(1, Ordering::Relaxed);
        self.bus.publish(EngineEvent::OpportunitiesFound {
            opportunities: vec![opportunity.clone()],
            timestamp: Utc::now(),
        });

        let lock = match self.exec_locks.get(pair_id) {
            Some(l) => Arc::clone(&*l),
            None => return,
        };
        // An execution already in flight wins; this trigger is dropped, not
        // queued behind it
        let _guard = match lock.try_lock() {
            Ok(g) => g,
            Err(_) => {
                debug!(pair = %pair_id, "execution already in flight, skipping trigger");
                return;
            }
        };

        // Re-read: the pair may have been disabled while we took the lock
        match self.pairs.get(pair_id) {
            Some(p) if p.enabled => {}
            _ => return,
        }

        self.stats.executions_attempted.fetch_add(1, Ordering::Relaxed);
        match self.executor.execute_opportunity(&pair, &opportunity).await {
            Ok(result) => {
                if result.status == ExecutionStatus::Success {
                    self.stats.executions_succeeded.fetch_add(1, Ordering::Relaxed);
                }
                if let Some(mut entry) = self.pairs.get_mut(pair_id) {
                    entry.last_triggered_at = Some(Utc::now());
                    entry.total_triggers += 1;
                    if let Some(max) = entry.max_executions {
                        if entry.total_triggers >= max {
                            entry.enabled = false;
                            info!(
                                pair = %pair_id,
                                triggers = entry.total_triggers,
                                "execution cap reached, pair disabled"
                            );
                        }
                    }
                }
            }
            Err(e) => {
                warn!(pair = %pair_id, "execution rejected: {}", e);
            }
        }
    }
}
