//! Time-sliced dual-leg execution
//!
//! A plan splits a total amount into equal slices executed on a fixed
//! interval. The clock never stops: `next_execution_at` advances on every
//! tick whether or not the slice filled, so a failed slice is retried on the
//! next tick without any catch-up burst. `consumed_amount` only moves on a
//! fully successful slice, which keeps it an honest record of what actually
//! traded.

use crate::error::EngineError;
use crate::events::{EngineEvent, EventBus};
use crate::executor::ExecutionCoordinator;
use crate::types::{ExecutionStatus, LegSpec, TwapPlan, TwapStatus};
use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

/// Parameters for a new plan
#[derive(Debug, Clone)]
pub struct TwapRequest {
    pub leg1: LegSpec,
    pub leg2: LegSpec,
    pub total_amount: f64,
    pub order_count: u32,
    pub time_interval_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TwapControl {
    Pause,
    Resume,
    Cancel,
}

pub struct TwapScheduler {
    plans: Arc<DashMap<String, TwapPlan>>,
    executor: Arc<ExecutionCoordinator>,
    bus: EventBus,
    /// Signals every plan task to stop after its current slice. A slice
    /// already submitted always runs to completion and is reported; orders
    /// on the wire cannot be taken back.
    shutdown_tx: watch::Sender<bool>,
}

impl TwapScheduler {
    pub fn new(executor: Arc<ExecutionCoordinator>, bus: EventBus) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            plans: Arc::new(DashMap::new()),
            executor,
            bus,
            shutdown_tx,
        }
    }

    /// Register a plan and start its slice timer
    pub fn add_plan(&self, request: TwapRequest) -> Result<TwapPlan, EngineError> {
        if request.total_amount <= 0.0 {
            return Err(EngineError::Validation(
                "total_amount must be positive".to_string(),
            ));
        }
        if request.order_count == 0 {
            return Err(EngineError::Validation(
                "order_count must be at least 1".to_string(),
            ));
        }
        if request.time_interval_ms == 0 {
            return Err(EngineError::Validation(
                "time_interval_ms must be positive".to_string(),
            ));
        }

        let now = Utc::now();
        let plan = TwapPlan {
            id: Uuid::new_v4().to_string(),
            leg1: request.leg1,
            leg2: request.leg2,
            total_amount: request.total_amount,
            order_count: request.order_count,
            time_interval_ms: request.time_interval_ms,
            amount_per_order: request.total_amount / request.order_count as f64,
            consumed_amount: 0.0,
            executed_orders: 0,
            next_execution_at: Some(
                now + ChronoDuration::milliseconds(request.time_interval_ms as i64),
            ),
            status: TwapStatus::Active,
            created_at: now,
        };

        self.plans.insert(plan.id.clone(), plan.clone());
        self.spawn_plan_task(&plan.id, plan.time_interval_ms);

        info!(
            plan = %plan.id,
            total = plan.total_amount,
            slices = plan.order_count,
            interval_ms = plan.time_interval_ms,
            "TWAP plan started"
        );
        self.bus.publish(EngineEvent::TwapPlanAdded {
            plan: plan.clone(),
            timestamp: now,
        });
        Ok(plan)
    }

    /// Pause, resume, or cancel a plan. Terminal plans reject every action.
    pub fn control(&self, plan_id: &str, action: TwapControl) -> Result<TwapPlan, EngineError> {
        let mut entry = self
            .plans
            .get_mut(plan_id)
            .ok_or_else(|| EngineError::NotFound(format!("TWAP plan {}", plan_id)))?;

        if entry.status.is_terminal() {
            return Err(EngineError::Validation(format!(
                "TWAP plan {} is already {:?}",
                plan_id, entry.status
            )));
        }

        match (action, entry.status) {
            (TwapControl::Pause, TwapStatus::Active) => {
                entry.status = TwapStatus::Paused;
            }
            (TwapControl::Resume, TwapStatus::Paused) => {
                entry.status = TwapStatus::Active;
                entry.next_execution_at = Some(
                    Utc::now() + ChronoDuration::milliseconds(entry.time_interval_ms as i64),
                );
            }
            (TwapControl::Cancel, _) => {
                // The timer task sees the terminal status and exits on its
                // own; a slice in flight finishes and reports its outcome
                entry.status = TwapStatus::Cancelled;
                entry.next_execution_at = None;
            }
            (action, status) => {
                return Err(EngineError::Validation(format!(
                    "cannot {:?} a {:?} TWAP plan",
                    action, status
                )));
            }
        }

        info!(plan = %plan_id, status = ?entry.status, "TWAP plan state changed");
        Ok(entry.clone())
    }

    pub fn get_plan(&self, plan_id: &str) -> Option<TwapPlan> {
        self.plans.get(plan_id).map(|p| p.clone())
    }

    pub fn plans(&self) -> Vec<TwapPlan> {
        self.plans.iter().map(|p| p.clone()).collect()
    }

    /// Stop all timers. Tasks drain their current slice before exiting;
    /// plan state is left as-is for inspection.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    fn spawn_plan_task(&self, plan_id: &str, interval_ms: u64) {
        let plans = Arc::clone(&self.plans);
        let executor = Arc::clone(&self.executor);
        let bus = self.bus.clone();
        let id = plan_id.to_string();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // the first slice waits one full interval

            loop {
                // Only the timer wait is raced against shutdown; the slice
                // itself runs in the arm body, where nothing cancels it
                tokio::select! {
                    _ = ticker.tick() => {
                        if !Self::tick(&plans, &executor, &bus, &id).await {
                            break;
                        }
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });
    }

    /// One timer tick. Returns false once the plan no longer needs a timer.
    async fn tick(
        plans: &DashMap<String, TwapPlan>,
        executor: &ExecutionCoordinator,
        bus: &EventBus,
        plan_id: &str,
    ) -> bool {
        // Snapshot first: the slice await must not hold a map lock
        let snapshot = match plans.get(plan_id) {
            Some(p) => p.clone(),
            None => return false,
        };

        match snapshot.status {
            TwapStatus::Completed | TwapStatus::Cancelled => return false,
            TwapStatus::Paused => {
                if let Some(mut entry) = plans.get_mut(plan_id) {
                    entry.next_execution_at = Some(
                        Utc::now()
                            + ChronoDuration::milliseconds(snapshot.time_interval_ms as i64),
                    );
                }
                return true;
            }
            TwapStatus::Active => {}
        }

        let outcome = executor
            .execute_slice(
                plan_id,
                &snapshot.leg1,
                &snapshot.leg2,
                snapshot.amount_per_order,
            )
            .await;

        let mut entry = match plans.get_mut(plan_id) {
            Some(e) => e,
            None => return false,
        };

        // The plan may have been cancelled while the slice was in flight;
        // the outcome is still recorded and reported, but the schedule is
        // never resurrected
        match outcome {
            Ok(result) if result.status == ExecutionStatus::Success => {
                entry.executed_orders += 1;
                entry.consumed_amount += entry.amount_per_order;
                if entry.executed_orders >= entry.order_count {
                    // Absorb per-slice float drift on the final slice
                    entry.consumed_amount = entry.total_amount;
                    entry.next_execution_at = None;
                    if !entry.status.is_terminal() {
                        entry.status = TwapStatus::Completed;
                        info!(plan = %plan_id, total = entry.total_amount, "TWAP plan completed");
                    }
                } else if !entry.status.is_terminal() {
                    entry.next_execution_at = Some(
                        Utc::now() + ChronoDuration::milliseconds(entry.time_interval_ms as i64),
                    );
                }
                bus.publish(EngineEvent::TwapOrderExecuted {
                    plan: entry.clone(),
                    result,
                    timestamp: Utc::now(),
                });
            }
            Ok(result) => {
                // Partial or failed slice: no progress recorded, the same
                // slice runs again next tick
                warn!(
                    plan = %plan_id,
                    status = ?result.status,
                    "TWAP slice did not fill cleanly, retrying next tick"
                );
                if !entry.status.is_terminal() {
                    entry.next_execution_at = Some(
                        Utc::now() + ChronoDuration::milliseconds(entry.time_interval_ms as i64),
                    );
                }
                bus.publish(EngineEvent::TwapOrderExecuted {
                    plan: entry.clone(),
                    result,
                    timestamp: Utc::now(),
                });
            }
            Err(e) => {
                warn!(plan = %plan_id, "TWAP slice rejected, retrying next tick: {}", e);
                if !entry.status.is_terminal() {
                    entry.next_execution_at = Some(
                        Utc::now() + ChronoDuration::milliseconds(entry.time_interval_ms as i64),
                    );
                }
            }
        }

        !entry.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionManager, ConnectionSettings};
    use crate::exchange::mock::MockAdapter;
    use crate::market_data::MarketDataCache;
    use crate::risk::RiskGate;
    use crate::types::{InstrumentType, OrderSide, RiskLimits};
    use std::collections::HashMap;
    use std::time::Instant;

    struct Harness {
        adapter: Arc<MockAdapter>,
        scheduler: TwapScheduler,
        bus: EventBus,
    }

    fn harness() -> Harness {
        let cache = Arc::new(MarketDataCache::new());
        let adapter = Arc::new(MockAdapter::new("venue1"));
        let mut connections = HashMap::new();
        connections.insert(
            "venue1".to_string(),
            Arc::new(ConnectionManager::new(
                Arc::clone(&adapter) as Arc<dyn crate::exchange::ExchangeAdapter>,
                cache,
                ConnectionSettings::default(),
            )),
        );

        let limits = RiskLimits {
            max_trades_per_minute: 1000,
            ..RiskLimits::default()
        };
        let risk = Arc::new(RiskGate::new(limits));
        let bus = EventBus::new();
        let executor = Arc::new(ExecutionCoordinator::new(connections, risk, bus.clone()));
        Harness {
            adapter,
            scheduler: TwapScheduler::new(executor, bus.clone()),
            bus,
        }
    }

    fn request(total: f64, count: u32, interval_ms: u64) -> TwapRequest {
        TwapRequest {
            leg1: LegSpec {
                venue: "venue1".to_string(),
                symbol: "BTCUSDT".to_string(),
                instrument: InstrumentType::Spot,
                side: Some(OrderSide::Buy),
            },
            leg2: LegSpec {
                venue: "venue1".to_string(),
                symbol: "ETHUSDT".to_string(),
                instrument: InstrumentType::Linear,
                side: Some(OrderSide::Sell),
            },
            total_amount: total,
            order_count: count,
            time_interval_ms: interval_ms,
        }
    }

    async fn wait_for<F: Fn(&TwapPlan) -> bool>(
        scheduler: &TwapScheduler,
        plan_id: &str,
        predicate: F,
    ) -> TwapPlan {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let plan = scheduler.get_plan(plan_id).unwrap();
            if predicate(&plan) {
                return plan;
            }
            assert!(Instant::now() < deadline, "condition never reached");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[test]
    fn test_validation() {
        // No runtime needed for rejected plans
        let rt = tokio::runtime::Runtime::new().unwrap();
        let _guard = rt.enter();
        let h = harness();
        assert!(h.scheduler.add_plan(request(0.0, 10, 100)).is_err());
        assert!(h.scheduler.add_plan(request(1.0, 0, 100)).is_err());
        assert!(h.scheduler.add_plan(request(1.0, 10, 0)).is_err());
    }

    #[tokio::test]
    async fn test_slice_amount_and_completion() {
        let h = harness();
        let plan = h.scheduler.add_plan(request(1.0, 10, 10)).unwrap();
        assert!((plan.amount_per_order - 0.1).abs() < 1e-12);
        assert_eq!(plan.status, TwapStatus::Active);

        let done = wait_for(&h.scheduler, &plan.id, |p| p.status.is_terminal()).await;
        assert_eq!(done.status, TwapStatus::Completed);
        assert_eq!(done.executed_orders, 10);
        assert!((done.consumed_amount - 1.0).abs() < 1e-9);
        assert!(done.next_execution_at.is_none());

        // Ten slices, both legs each
        assert_eq!(h.adapter.placed_orders().len(), 20);
    }

    #[tokio::test]
    async fn test_failed_slice_retries_without_progress() {
        let h = harness();
        // First slice fails on leg1 (the leg2 fill gets unwound); every
        // later attempt succeeds
        h.adapter.script_order(
            "BTCUSDT",
            Err(EngineError::api("venue1", "place_order", -1, "rejected")),
        );

        let plan = h.scheduler.add_plan(request(0.3, 3, 10)).unwrap();
        let done = wait_for(&h.scheduler, &plan.id, |p| p.status.is_terminal()).await;

        // The failed first slice was retried, not skipped
        assert_eq!(done.status, TwapStatus::Completed);
        assert_eq!(done.executed_orders, 3);
        assert!((done.consumed_amount - 0.3).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_pause_stops_progress_and_resume_continues() {
        let h = harness();
        let plan = h.scheduler.add_plan(request(1.0, 100, 10)).unwrap();

        wait_for(&h.scheduler, &plan.id, |p| p.executed_orders >= 2).await;
        let paused = h.scheduler.control(&plan.id, TwapControl::Pause).unwrap();
        assert_eq!(paused.status, TwapStatus::Paused);
        let frozen = paused.executed_orders;

        tokio::time::sleep(Duration::from_millis(60)).await;
        let still = h.scheduler.get_plan(&plan.id).unwrap();
        assert_eq!(still.executed_orders, frozen);
        // The clock keeps advancing while paused
        assert!(still.next_execution_at.is_some());

        h.scheduler.control(&plan.id, TwapControl::Resume).unwrap();
        wait_for(&h.scheduler, &plan.id, |p| p.executed_orders > frozen).await;
    }

    #[tokio::test]
    async fn test_cancel_lets_inflight_slice_finish_and_report() {
        let h = harness();
        // Slow venue: the slice is still on the wire when the cancel lands
        h.adapter.set_order_delay(Duration::from_millis(80));
        let mut rx = h.bus.subscribe();
        let plan = h.scheduler.add_plan(request(1.0, 100, 10)).unwrap();

        // Wait until both legs of the first slice are submitted
        let deadline = Instant::now() + Duration::from_secs(5);
        while h.adapter.placed_orders().len() < 2 {
            assert!(Instant::now() < deadline, "slice never submitted");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let started = h.adapter.placed_orders().len() as u64;
        h.scheduler.control(&plan.id, TwapControl::Cancel).unwrap();

        // Every submitted placement completes; none is dropped mid-flight
        while h.adapter.completed_orders() < started {
            assert!(Instant::now() < deadline, "submitted orders never completed");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // And the slice outcome is reported despite the cancellation
        let result = loop {
            let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("no slice report after cancel")
                .unwrap();
            if let EngineEvent::TwapOrderExecuted { plan: p, result, .. } = event {
                assert_eq!(p.id, plan.id);
                break result;
            }
        };
        assert_eq!(result.status, ExecutionStatus::Success);

        let done = h.scheduler.get_plan(&plan.id).unwrap();
        assert_eq!(done.status, TwapStatus::Cancelled);
        assert_eq!(done.executed_orders, 1);
        assert!((done.consumed_amount - done.amount_per_order).abs() < 1e-9);

        // No further slices run after the reported one
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(h.adapter.placed_orders().len() as u64, started);
    }

    #[tokio::test]
    async fn test_cancel_is_terminal() {
        let h = harness();
        let plan = h.scheduler.add_plan(request(1.0, 100, 10)).unwrap();

        let cancelled = h.scheduler.control(&plan.id, TwapControl::Cancel).unwrap();
        assert_eq!(cancelled.status, TwapStatus::Cancelled);
        assert!(cancelled.next_execution_at.is_none());

        // No action revives a terminal plan
        assert!(h.scheduler.control(&plan.id, TwapControl::Resume).is_err());
        assert!(h.scheduler.control(&plan.id, TwapControl::Pause).is_err());
        assert!(h.scheduler.control(&plan.id, TwapControl::Cancel).is_err());
    }

    #[tokio::test]
    async fn test_plan_added_event() {
        let h = harness();
        let mut rx = h.bus.subscribe();
        let plan = h.scheduler.add_plan(request(1.0, 10, 1000)).unwrap();

        match rx.recv().await.unwrap() {
            EngineEvent::TwapPlanAdded { plan: p, .. } => assert_eq!(p.id, plan.id),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
