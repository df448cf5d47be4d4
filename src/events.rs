//! Typed event bus
//!
//! Fan-out of engine events to external consumers (WebSocket broadcaster,
//! REST status layer). A closed set of tagged variants replaces the
//! stringly-typed event names of emitter-style designs: subscribers match on
//! the enum, not on strings.

use crate::types::{ExecutionResult, MonitoringPair, Opportunity, TwapPlan};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Everything the engine reports to the outside world
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum EngineEvent {
    PriceUpdate {
        pair: MonitoringPair,
        opportunity: Opportunity,
        timestamp: DateTime<Utc>,
    },
    OpportunitiesFound {
        opportunities: Vec<Opportunity>,
        timestamp: DateTime<Utc>,
    },
    ArbitrageExecuted {
        result: ExecutionResult,
        timestamp: DateTime<Utc>,
    },
    TwapOrderExecuted {
        plan: TwapPlan,
        result: ExecutionResult,
        timestamp: DateTime<Utc>,
    },
    PairAdded {
        pair: MonitoringPair,
        timestamp: DateTime<Utc>,
    },
    PairUpdated {
        pair: MonitoringPair,
        timestamp: DateTime<Utc>,
    },
    PairRemoved {
        pair_id: String,
        timestamp: DateTime<Utc>,
    },
    TwapPlanAdded {
        plan: TwapPlan,
        timestamp: DateTime<Utc>,
    },
}

/// Broadcast-backed event bus. Publishing never blocks the engine; slow
/// consumers lag and drop per broadcast semantics.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. A send error only means no subscribers are
    /// listening, which is fine.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
