//! External-world implementations: the upstream pool API client, the
//! process-wide shared cache, chain RPC plumbing, the predictor client,
//! the swap aggregator, and SQLite persistence.

pub mod cache;
pub mod chain;
pub mod pool_api;
pub mod predictor;
pub mod storage;
pub mod swap;

pub use cache::{CacheConfig, CacheStats, SharedPoolCache};
pub use chain::wallet::WalletManager;
pub use chain::RpcChainClient;
pub use pool_api::HttpPoolApi;
pub use predictor::MlClient;
pub use storage::{BotRow, BotStatus, SqliteStore, StorageError};
pub use swap::AggregatorClient;
