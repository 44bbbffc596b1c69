//! Swap Aggregator Port
//!
//! Used after a live close to convert leftover non-SOL token balance back
//! to SOL. Failures here are never fatal to the close that spawned them.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum SwapError {
    #[error("Quote request failed: {0}")]
    Quote(String),

    #[error("Swap build failed: {0}")]
    Build(String),

    #[error("Swap execution failed: {0}")]
    Execution(String),
}

#[derive(Debug, Clone)]
pub struct SwapReceipt {
    pub signature: String,
    /// Lamports received from the swap
    pub out_lamports: u64,
}

#[async_trait]
pub trait SwapClient: Send + Sync {
    /// Swap `amount` base units of `mint` into SOL
    async fn swap_to_sol(&self, mint: &str, amount: u64) -> Result<SwapReceipt, SwapError>;
}
