//! Pre-trade risk gating
//!
//! Stateless check invoked immediately before any order submission; any
//! violation fails fast with a typed reason before a network call is made.
//! Limits are hot-reloadable and read once per decision. The daily-loss
//! accumulator and the trailing trade window are updated atomically per
//! completed trade (one recording per trade, no read-modify-write races).

use crate::error::EngineError;
use crate::types::RiskLimits;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::warn;

const TRADE_RATE_WINDOW: Duration = Duration::from_secs(60);

pub struct RiskGate {
    limits: RwLock<RiskLimits>,
    /// Realized loss so far today (positive number = loss)
    daily_loss: Mutex<f64>,
    /// Timestamps of completed trades in the trailing window
    trade_times: Mutex<VecDeque<Instant>>,
}

impl RiskGate {
    pub fn new(limits: RiskLimits) -> Self {
        Self {
            limits: RwLock::new(limits),
            daily_loss: Mutex::new(0.0),
            trade_times: Mutex::new(VecDeque::new()),
        }
    }

    pub fn limits(&self) -> RiskLimits {
        self.limits.read().clone()
    }

    /// Hot-reload the limits; in-flight checks keep the set they read
    pub fn update_limits(&self, limits: RiskLimits) {
        *self.limits.write() = limits;
    }

    /// Validate a prospective execution. `estimated_loss` is the worst-case
    /// loss the caller attributes to this trade (0.0 when unknown).
    pub fn check(
        &self,
        amount: f64,
        spread_percent: f64,
        estimated_loss: f64,
    ) -> Result<(), EngineError> {
        let limits = self.limits.read().clone();

        if amount > limits.max_position_size {
            return Err(EngineError::RiskViolation(format!(
                "position size {:.4} exceeds limit {:.4}",
                amount, limits.max_position_size
            )));
        }

        let daily_loss = *self.daily_loss.lock();
        if daily_loss + estimated_loss > limits.max_daily_loss {
            return Err(EngineError::RiskViolation(format!(
                "daily loss {:.2} + estimated {:.2} exceeds limit {:.2}",
                daily_loss, estimated_loss, limits.max_daily_loss
            )));
        }

        // Absurd spreads are almost always bad data, not free money
        if spread_percent.abs() > limits.price_deviation_threshold {
            return Err(EngineError::RiskViolation(format!(
                "spread {:.4}% exceeds deviation bound {:.4}%",
                spread_percent, limits.price_deviation_threshold
            )));
        }

        let trades_in_window = {
            let mut times = self.trade_times.lock();
            Self::prune(&mut times);
            times.len() as u32
        };
        if trades_in_window >= limits.max_trades_per_minute {
            return Err(EngineError::RiskViolation(format!(
                "{} trades in the last 60s, limit {}",
                trades_in_window, limits.max_trades_per_minute
            )));
        }

        Ok(())
    }

    /// Record a completed trade: one timestamp for the rate window, one
    /// loss increment when pnl is negative.
    pub fn record_trade(&self, pnl: f64) {
        {
            let mut times = self.trade_times.lock();
            Self::prune(&mut times);
            times.push_back(Instant::now());
        }
        if pnl < 0.0 {
            let mut loss = self.daily_loss.lock();
            *loss += -pnl;
            warn!(daily_loss = *loss, "trade closed at a loss");
        }
    }

    pub fn daily_loss(&self) -> f64 {
        *self.daily_loss.lock()
    }

    /// Reset the daily accumulator (midnight rollover, operator action)
    pub fn reset_daily(&self) {
        *self.daily_loss.lock() = 0.0;
    }

    fn prune(times: &mut VecDeque<Instant>) {
        let cutoff = Instant::now() - TRADE_RATE_WINDOW;
        while times.front().map(|t| *t < cutoff).unwrap_or(false) {
            times.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> RiskLimits {
        RiskLimits {
            max_position_size: 10000.0,
            max_daily_loss: 1000.0,
            price_deviation_threshold: 5.0,
            max_trades_per_minute: 3,
        }
    }

    #[test]
    fn test_position_size_limit() {
        let gate = RiskGate::new(limits());
        assert!(matches!(
            gate.check(15000.0, 0.1, 0.0),
            Err(EngineError::RiskViolation(_))
        ));
        assert!(gate.check(5000.0, 0.1, 0.0).is_ok());
    }

    #[test]
    fn test_daily_loss_limit_includes_estimate() {
        let gate = RiskGate::new(limits());
        gate.record_trade(-900.0);
        assert_eq!(gate.daily_loss(), 900.0);

        assert!(gate.check(100.0, 0.1, 50.0).is_ok());
        assert!(matches!(
            gate.check(100.0, 0.1, 200.0),
            Err(EngineError::RiskViolation(_))
        ));

        gate.reset_daily();
        assert!(gate.check(100.0, 0.1, 200.0).is_ok());
    }

    #[test]
    fn test_price_deviation_bound() {
        let gate = RiskGate::new(limits());
        assert!(gate.check(100.0, 4.9, 0.0).is_ok());
        assert!(matches!(
            gate.check(100.0, 7.5, 0.0),
            Err(EngineError::RiskViolation(_))
        ));
        // Sanity bound applies to the magnitude, either direction
        assert!(matches!(
            gate.check(100.0, -7.5, 0.0),
            Err(EngineError::RiskViolation(_))
        ));
    }

    #[test]
    fn test_trade_rate_limit() {
        let gate = RiskGate::new(limits());
        for _ in 0..3 {
            assert!(gate.check(100.0, 0.1, 0.0).is_ok());
            gate.record_trade(1.0);
        }
        assert!(matches!(
            gate.check(100.0, 0.1, 0.0),
            Err(EngineError::RiskViolation(_))
        ));
    }

    #[test]
    fn test_hot_reload() {
        let gate = RiskGate::new(limits());
        assert!(gate.check(15000.0, 0.1, 0.0).is_err());

        gate.update_limits(RiskLimits {
            max_position_size: 20000.0,
            ..limits()
        });
        assert!(gate.check(15000.0, 0.1, 0.0).is_ok());
    }
}
