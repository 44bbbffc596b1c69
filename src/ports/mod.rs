//! Trait seams between the engine and the outside world: pool API,
//! executor contract, DLMM program client, swap aggregator, predictor.
//! `mocks` ships recording fakes used across the test suite.

pub mod dlmm;
pub mod executor;
pub mod mocks;
pub mod pool_api;
pub mod predictor;
pub mod swap;

pub use dlmm::{ChainReader, DlmmClient, DlmmError};
pub use executor::{
    BinRange, CloseReceipt, Executor, ExecutorError, OpenReceipt, OpenRequest,
    PerformanceSummary, RiskSnapshot,
};
pub use pool_api::{ActiveBin, PoolApi, PoolApiError, PoolInfo};
pub use predictor::{BatchPrediction, Prediction, Predictor, PredictorHealth};
pub use swap::{SwapClient, SwapError, SwapReceipt};
