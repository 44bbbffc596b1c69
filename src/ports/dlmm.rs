//! DLMM Program and Chain Ports
//!
//! The live executor's on-chain dependencies. `DlmmClient` covers the DLMM
//! program operations (the instruction encoding itself lives behind the
//! implementation); `ChainReader` covers plain wallet reads. Splitting the
//! two keeps wallet balance checks mockable without a program binding.

use async_trait::async_trait;
use thiserror::Error;

use crate::ports::pool_api::ActiveBin;

#[derive(Debug, Error, Clone)]
pub enum DlmmError {
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Transaction send failed: {0}")]
    SendFailed(String),

    #[error("Confirmation timed out: {0}")]
    ConfirmTimeout(String),

    #[error("Position not found on chain: {0}")]
    PositionNotFound(String),
}

#[derive(Debug, Clone)]
pub struct CreatePositionRequest {
    pub pool_address: String,
    pub lower_bin: i32,
    pub upper_bin: i32,
    pub amount_x: u64,
    pub amount_y: u64,
}

#[derive(Debug, Clone)]
pub struct CreatePositionReceipt {
    /// On-chain address of the new position account
    pub position_address: String,
    pub signature: String,
    /// Actual network fee taken from the confirmed transaction
    pub fee_lamports: u64,
}

#[derive(Debug, Clone)]
pub struct RemoveLiquidityReceipt {
    /// One signature per sub-transaction issued for the close
    pub signatures: Vec<String>,
    /// Sum of fees across all sub-transactions
    pub total_fee_lamports: u64,
    pub fees_claimed_x: u64,
    pub fees_claimed_y: u64,
    pub withdrawn_x: u64,
    pub withdrawn_y: u64,
}

#[async_trait]
pub trait DlmmClient: Send + Sync {
    /// Read the pool's current active bin
    async fn active_bin(&self, pool_address: &str) -> Result<ActiveBin, DlmmError>;

    /// Create and fund a position; both the transaction and the position
    /// keypair are signed by the implementation.
    async fn create_position(
        &self,
        request: &CreatePositionRequest,
    ) -> Result<CreatePositionReceipt, DlmmError>;

    /// Remove all liquidity, claim fees and close the position account.
    /// May issue multiple sub-transactions.
    async fn remove_liquidity_and_close(
        &self,
        pool_address: &str,
        position_address: &str,
    ) -> Result<RemoveLiquidityReceipt, DlmmError>;

    /// Accrued but unclaimed fees (X, Y) for an open position
    async fn position_fees(&self, position_address: &str) -> Result<(u64, u64), DlmmError>;
}

#[async_trait]
pub trait ChainReader: Send + Sync {
    /// Wallet SOL balance in lamports
    async fn balance_lamports(&self, pubkey: &str) -> Result<u64, DlmmError>;

    /// SPL token balance for `owner` in base units
    async fn token_balance(&self, owner: &str, mint: &str) -> Result<u64, DlmmError>;
}
