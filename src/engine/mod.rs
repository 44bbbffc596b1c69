//! Per-bot execution machinery: the market-data provider facade, the two
//! executors behind the shared contract, and the trading engine that
//! schedules them.

pub mod engine;
pub mod executor_live;
pub mod executor_sim;
pub mod provider;

pub use engine::TradingEngine;
pub use executor_live::{LiveExecutor, LiveExecutorConfig};
pub use executor_sim::SimulationExecutor;
pub use provider::MarketDataProvider;
