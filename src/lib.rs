//! Cross-venue spread arbitrage engine
//!
//! Monitors configured instrument pairs across exchanges, detects spread
//! opportunities from streamed top-of-book data, and executes both legs
//! concurrently with partial-failure recovery. TWAP plans slice large
//! orders over time through the same execution path.

pub mod config;
pub mod connection;
pub mod detector;
pub mod engine;
pub mod error;
pub mod events;
pub mod exchange;
pub mod executor;
pub mod market_data;
pub mod risk;
pub mod twap;
pub mod types;

pub use config::EngineConfig;
pub use engine::{ArbitrageEngine, EngineStatus, PairRequest, PairUpdate};
pub use error::EngineError;
pub use events::{EngineEvent, EventBus};
pub use twap::{TwapControl, TwapRequest};
