//! Dual-leg execution coordination
//!
//! Per attempt: risk gate → both legs submitted concurrently (minimizes
//! latency skew between legs) → outcome classification:
//! - both filled: success, realized spread from the returned order prices
//! - exactly one filled: attempt a single reverse order to offset the filled
//!   leg, then report partial with both leg results; the failed leg is never
//!   retried (a retry could double-execute)
//! - both failed: failed
//! Every outcome is reported, none silently dropped. An attempt already
//! submitted is never aborted: in-flight placements cannot be safely
//! cancelled once sent.

use crate::connection::ConnectionManager;
use crate::error::EngineError;
use crate::events::{EngineEvent, EventBus};
use crate::exchange::{OrderAck, OrderParams};
use crate::risk::RiskGate;
use crate::types::{
    ExecutionResult, ExecutionStatus, LegOrderResult, LegSpec, MonitoringPair, Opportunity,
    OrderSide, SpreadDirection, TopOfBook,
};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

pub struct ExecutionCoordinator {
    connections: HashMap<String, Arc<ConnectionManager>>,
    risk: Arc<RiskGate>,
    bus: EventBus,
}

impl ExecutionCoordinator {
    pub fn new(
        connections: HashMap<String, Arc<ConnectionManager>>,
        risk: Arc<RiskGate>,
        bus: EventBus,
    ) -> Self {
        Self {
            connections,
            risk,
            bus,
        }
    }

    fn connection(&self, venue: &str) -> Result<&Arc<ConnectionManager>, EngineError> {
        self.connections
            .get(venue)
            .ok_or_else(|| EngineError::Validation(format!("venue {} is not registered", venue)))
    }

    /// Execute a triggered opportunity for a monitored pair
    pub async fn execute_opportunity(
        &self,
        pair: &MonitoringPair,
        opportunity: &Opportunity,
    ) -> Result<ExecutionResult, EngineError> {
        self.risk
            .check(pair.amount, opportunity.spread_percent, 0.0)?;

        let (side1, side2) = leg_sides(pair, opportunity.direction);
        let result = self
            .submit_dual(
                &pair.id,
                &pair.leg1,
                side1,
                Some(&opportunity.leg1_quote),
                &pair.leg2,
                side2,
                Some(&opportunity.leg2_quote),
                pair.amount,
            )
            .await;

        // A fully failed attempt never traded; only filled legs count
        // against the trade-rate budget
        if result.status != ExecutionStatus::Failed {
            self.risk
                .record_trade(result.estimated_profit.unwrap_or(0.0));
        }
        self.bus.publish(EngineEvent::ArbitrageExecuted {
            result: result.clone(),
            timestamp: Utc::now(),
        });

        Ok(result)
    }

    /// Execute one TWAP slice. The scheduler reports the event itself.
    pub async fn execute_slice(
        &self,
        plan_id: &str,
        leg1: &LegSpec,
        leg2: &LegSpec,
        qty: f64,
    ) -> Result<ExecutionResult, EngineError> {
        self.risk.check(qty, 0.0, 0.0)?;

        let side1 = leg1.side.unwrap_or(OrderSide::Buy);
        let side2 = leg2.side.unwrap_or(OrderSide::Sell);
        let result = self
            .submit_dual(plan_id, leg1, side1, None, leg2, side2, None, qty)
            .await;

        if result.status != ExecutionStatus::Failed {
            self.risk
                .record_trade(result.estimated_profit.unwrap_or(0.0));
        }
        Ok(result)
    }

    /// Place both legs concurrently and classify the outcome
    #[allow(clippy::too_many_arguments)]
    async fn submit_dual(
        &self,
        id: &str,
        leg1: &LegSpec,
        side1: OrderSide,
        leg1_quote: Option<&TopOfBook>,
        leg2: &LegSpec,
        side2: OrderSide,
        leg2_quote: Option<&TopOfBook>,
        qty: f64,
    ) -> ExecutionResult {
        let params1 = OrderParams {
            symbol: leg1.symbol.clone(),
            category: leg1.instrument,
            side: side1,
            qty,
            client_order_id: Some(Uuid::new_v4().to_string()),
        };
        let params2 = OrderParams {
            symbol: leg2.symbol.clone(),
            category: leg2.instrument,
            side: side2,
            qty,
            client_order_id: Some(Uuid::new_v4().to_string()),
        };

        let (ack1, ack2) = tokio::join!(
            self.place_leg(&leg1.venue, &params1),
            self.place_leg(&leg2.venue, &params2),
        );

        let mut leg1_result = leg_result(leg1, side1, qty, &ack1, leg1_quote);
        let mut leg2_result = leg_result(leg2, side2, qty, &ack2, leg2_quote);

        let status = match (&ack1, &ack2) {
            (Ok(_), Ok(_)) => ExecutionStatus::Success,
            (Err(_), Err(_)) => ExecutionStatus::Failed,
            (Ok(_), Err(_)) => {
                self.unwind_leg(id, leg1, side1, qty, &mut leg1_result).await;
                ExecutionStatus::Partial
            }
            (Err(_), Ok(_)) => {
                self.unwind_leg(id, leg2, side2, qty, &mut leg2_result).await;
                ExecutionStatus::Partial
            }
        };

        let (realized_spread, estimated_profit) = match status {
            ExecutionStatus::Success => {
                match (leg1_result.price, leg2_result.price) {
                    (Some(p1), Some(p2)) => {
                        let spread = p1 - p2;
                        let profit = match side1 {
                            OrderSide::Sell => (p1 - p2) * qty,
                            OrderSide::Buy => (p2 - p1) * qty,
                        };
                        (Some(spread), Some(profit))
                    }
                    _ => (None, None),
                }
            }
            _ => (None, None),
        };

        match status {
            ExecutionStatus::Success => info!(
                id = %id,
                leg1_order = ?leg1_result.order_id,
                leg2_order = ?leg2_result.order_id,
                realized_spread = ?realized_spread,
                "dual-leg execution succeeded"
            ),
            ExecutionStatus::Partial => warn!(
                id = %id,
                leg1_error = ?leg1_result.error,
                leg2_error = ?leg2_result.error,
                "dual-leg execution partially failed, manual reconciliation may be required"
            ),
            ExecutionStatus::Failed => error!(
                id = %id,
                leg1_error = ?leg1_result.error,
                leg2_error = ?leg2_result.error,
                "dual-leg execution failed on both legs"
            ),
        }

        ExecutionResult {
            pair_id: id.to_string(),
            leg1_order: leg1_result,
            leg2_order: leg2_result,
            status,
            realized_spread,
            estimated_profit,
            executed_at: Utc::now(),
        }
    }

    async fn place_leg(
        &self,
        venue: &str,
        params: &OrderParams,
    ) -> Result<OrderAck, EngineError> {
        let connection = self.connection(venue)?;
        connection.place_order(params).await
    }

    /// Best-effort offset of a filled leg after the other leg failed.
    /// One reverse market order, no retries either way.
    async fn unwind_leg(
        &self,
        id: &str,
        leg: &LegSpec,
        filled_side: OrderSide,
        qty: f64,
        filled_result: &mut LegOrderResult,
    ) {
        let reverse = OrderParams {
            symbol: leg.symbol.clone(),
            category: leg.instrument,
            side: filled_side.opposite(),
            qty,
            client_order_id: Some(Uuid::new_v4().to_string()),
        };
        match self.place_leg(&leg.venue, &reverse).await {
            Ok(ack) => {
                info!(
                    id = %id,
                    venue = %leg.venue,
                    symbol = %leg.symbol,
                    unwind_order = %ack.order_id,
                    "filled leg offset with reverse order"
                );
            }
            Err(e) => {
                error!(
                    id = %id,
                    venue = %leg.venue,
                    symbol = %leg.symbol,
                    "failed to offset filled leg, position is open: {}", e
                );
                filled_result.error = Some(format!("unwind failed: {}", e));
            }
        }
    }
}

/// Sides for both legs: configured side wins, otherwise derived from the
/// spread direction (sell the rich leg, buy the cheap one).
fn leg_sides(pair: &MonitoringPair, direction: SpreadDirection) -> (OrderSide, OrderSide) {
    let (derived1, derived2) = match direction {
        SpreadDirection::Leg1SellLeg2Buy => (OrderSide::Sell, OrderSide::Buy),
        SpreadDirection::Leg1BuyLeg2Sell => (OrderSide::Buy, OrderSide::Sell),
    };
    (
        pair.leg1.side.unwrap_or(derived1),
        pair.leg2.side.unwrap_or(derived2),
    )
}

fn leg_result(
    leg: &LegSpec,
    side: OrderSide,
    qty: f64,
    ack: &Result<OrderAck, EngineError>,
    quote: Option<&TopOfBook>,
) -> LegOrderResult {
    match ack {
        Ok(ack) => LegOrderResult {
            venue: leg.venue.clone(),
            symbol: leg.symbol.clone(),
            side,
            qty,
            // Market acks without a fill price fall back to the quote that
            // triggered the attempt
            price: ack.price.or_else(|| quote_exec_price(quote, side)),
            order_id: Some(ack.order_id.clone()),
            error: None,
        },
        Err(e) => LegOrderResult {
            venue: leg.venue.clone(),
            symbol: leg.symbol.clone(),
            side,
            qty,
            price: None,
            order_id: None,
            error: Some(e.to_string()),
        },
    }
}

/// Buys execute against the ask, sells against the bid
fn quote_exec_price(quote: Option<&TopOfBook>, side: OrderSide) -> Option<f64> {
    let quote = quote?;
    match side {
        OrderSide::Buy => quote.ask.map(|l| l.price),
        OrderSide::Sell => quote.bid.map(|l| l.price),
    }
}
