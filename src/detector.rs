//! Spread opportunity detection
//!
//! Pure computation over two top-of-book quotes and a pair's configuration.
//! Re-run independently for every tick touching either leg of every pair
//! that references the updated symbol; thresholds differ per pair, so
//! evaluation is never batched across pairs sharing a symbol.

use crate::types::{ExecutionMode, MonitoringPair, Opportunity, SpreadDirection, TopOfBook};
use chrono::Utc;

/// Compute the spread for a pair from both legs' quotes.
///
/// spread = leg1.bid - leg2.ask
/// spread% = spread / leg2.ask * 100
///
/// Returns None when either leg is missing a bid or an ask.
pub fn evaluate(
    pair: &MonitoringPair,
    leg1_quote: &TopOfBook,
    leg2_quote: &TopOfBook,
) -> Option<Opportunity> {
    let leg1_bid = leg1_quote.bid?;
    let _leg1_ask = leg1_quote.ask?;
    let _leg2_bid = leg2_quote.bid?;
    let leg2_ask = leg2_quote.ask?;

    if leg1_bid.price <= 0.0 || leg2_ask.price <= 0.0 {
        return None;
    }

    let spread = leg1_bid.price - leg2_ask.price;
    let spread_percent = spread / leg2_ask.price * 100.0;

    // Positive spread: leg1 is rich, sell it and buy leg2
    let direction = if spread > 0.0 {
        SpreadDirection::Leg1SellLeg2Buy
    } else {
        SpreadDirection::Leg1BuyLeg2Sell
    };

    let should_trigger = match pair.execution_mode {
        ExecutionMode::Threshold => spread_percent.abs() >= pair.threshold_percent,
        // Price-insensitive immediate execution; spread still reported
        ExecutionMode::Market => true,
    };

    Some(Opportunity {
        pair_id: pair.id.clone(),
        leg1_quote: leg1_quote.clone(),
        leg2_quote: leg2_quote.clone(),
        spread,
        spread_percent,
        direction,
        should_trigger,
        computed_at: Utc::now(),
    })
}
