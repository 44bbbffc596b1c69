//! Executor Port
//!
//! The contract both execution backends satisfy: simulation against a
//! virtual balance and live on-chain execution. Each implementation owns
//! its tracked positions in memory while they are active.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::position::{EntryFeatures, ExitReason, TrackedPosition};
use crate::ports::pool_api::PoolInfo;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Insufficient balance: have {have} lamports, need {need}")]
    InsufficientBalance { have: u64, need: u64 },

    #[error("Position not found: {0}")]
    PositionNotFound(String),

    #[error("Safety halt: {0}")]
    SafetyHalted(String),

    #[error("Throttled: {0}")]
    Throttled(String),

    #[error("Wallet unavailable: {0}")]
    WalletUnavailable(String),

    #[error("Chain error: {0}")]
    Chain(String),

    #[error("Market data error: {0}")]
    MarketData(String),
}

/// Symmetric bin span for a new position
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BinRange {
    pub lower: i32,
    pub upper: i32,
}

impl BinRange {
    /// Centred on the active bin, `span` bins either side
    pub fn around(active_bin: i32, span: i32) -> Self {
        Self {
            lower: active_bin - span,
            upper: active_bin + span,
        }
    }
}

/// Risk parameters frozen into the position at entry
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RiskSnapshot {
    pub profit_target_pct: f64,
    pub stop_loss_pct: f64,
    pub max_hold_minutes: i64,
    pub trailing_stop_enabled: bool,
    pub trailing_stop_pct: f64,
}

/// Everything an executor needs to open one position
#[derive(Debug, Clone)]
pub struct OpenRequest {
    pub range: BinRange,
    pub amount_x: u64,
    pub amount_y: u64,
    pub risk: RiskSnapshot,
}

impl OpenRequest {
    pub fn total_lamports(&self) -> u64 {
        self.amount_x + self.amount_y
    }
}

#[derive(Debug, Clone)]
pub struct OpenReceipt {
    pub position_id: String,
    pub signature: String,
    pub position: TrackedPosition,
}

#[derive(Debug, Clone)]
pub struct CloseReceipt {
    pub signature: String,
    pub realized_pnl_sol: f64,
    pub fees_x: u64,
    pub fees_y: u64,
    pub position: TrackedPosition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub total_positions: u64,
    pub wins: u64,
    pub losses: u64,
    pub win_rate_pct: f64,
    pub cumulative_pnl_sol: f64,
    pub balance_lamports: u64,
}

#[async_trait]
pub trait Executor: Send + Sync {
    /// Open a position over the given bin range. Amounts are lamport-valued
    /// per side.
    async fn open(&self, pool: &PoolInfo, request: OpenRequest)
        -> Result<OpenReceipt, ExecutorError>;

    /// Close a position and realise its P&L
    async fn close(&self, position_id: &str, reason: ExitReason)
        -> Result<CloseReceipt, ExecutorError>;

    /// Refresh price, fees and high-water mark. Returns None for unknown or
    /// already-terminal positions.
    async fn update(&self, position_id: &str) -> Result<Option<TrackedPosition>, ExecutorError>;

    async fn active_positions(&self) -> Vec<TrackedPosition>;

    async fn position(&self, position_id: &str) -> Option<TrackedPosition>;

    /// Take ownership of positions persisted before a restart. Only
    /// ACTIVE positions are adopted.
    async fn adopt(&self, positions: Vec<TrackedPosition>);

    /// Current balance in lamports (virtual or wallet)
    async fn balance(&self) -> u64;

    async fn performance_summary(&self) -> PerformanceSummary;

    /// Attach entry scoring metadata after a successful open. Returns the
    /// updated position for event emission.
    async fn annotate_entry(
        &self,
        position_id: &str,
        score: f64,
        ml_probability: Option<f64>,
        features: EntryFeatures,
    ) -> Option<TrackedPosition>;
}
