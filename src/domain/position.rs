//! Tracked Positions
//!
//! The lifecycle record for one liquidity deposit: entry snapshot, live
//! checkpoint fields, risk snapshot, and terminal exit fields. Owned by an
//! executor while active; persisted by the orchestrator on open, close and
//! checkpoint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ports::pool_api::PoolInfo;

/// Lamports per SOL
pub const LAMPORTS_PER_SOL: f64 = 1_000_000_000.0;

#[derive(Debug, Error)]
pub enum PositionError {
    #[error("Position is not active")]
    NotActive,

    #[error("Invalid status transition: {0} -> {1}")]
    InvalidTransition(&'static str, &'static str),
}

/// Simulation or live on-chain execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionMode {
    Simulation,
    Live,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Simulation => "simulation",
            ExecutionMode::Live => "live",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "simulation" => Some(ExecutionMode::Simulation),
            "live" => Some(ExecutionMode::Live),
            _ => None,
        }
    }
}

/// Position lifecycle status. Transitions are monotone:
/// PENDING -> ACTIVE -> CLOSING -> CLOSED | ERROR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Pending,
    Active,
    Closing,
    Closed,
    Error,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Pending => "pending",
            PositionStatus::Active => "active",
            PositionStatus::Closing => "closing",
            PositionStatus::Closed => "closed",
            PositionStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PositionStatus::Pending),
            "active" => Some(PositionStatus::Active),
            "closing" => Some(PositionStatus::Closing),
            "closed" => Some(PositionStatus::Closed),
            "error" => Some(PositionStatus::Error),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PositionStatus::Closed | PositionStatus::Error)
    }
}

/// Why a position was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    TakeProfit,
    TrailingStop,
    StopLoss,
    MaxHoldTime,
    EmergencyStop,
    UserRequested,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::TakeProfit => "TAKE_PROFIT",
            ExitReason::TrailingStop => "TRAILING_STOP",
            ExitReason::StopLoss => "STOP_LOSS",
            ExitReason::MaxHoldTime => "MAX_HOLD_TIME",
            ExitReason::EmergencyStop => "EMERGENCY_STOP",
            ExitReason::UserRequested => "USER_REQUESTED",
        }
    }
}

/// The canonical 12-feature vector sampled at entry, stored with the
/// position so closed trades can be labelled for supervised training.
/// `to_array` preserves the exact feature order the predictor expects.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntryFeatures {
    pub volume_30m: f64,
    pub volume_1h: f64,
    pub volume_2h: f64,
    pub volume_4h: f64,
    pub volume_24h: f64,
    pub fees_30m: f64,
    pub fees_1h: f64,
    pub fees_24h: f64,
    pub fee_efficiency_1h: f64,
    pub liquidity: f64,
    pub apr: f64,
    pub volume_to_liquidity: f64,
}

/// Feature names in vector order
pub const FEATURE_NAMES: [&str; 12] = [
    "volume_30m",
    "volume_1h",
    "volume_2h",
    "volume_4h",
    "volume_24h",
    "fees_30m",
    "fees_1h",
    "fees_24h",
    "fee_efficiency_1h",
    "liquidity",
    "apr",
    "volume_to_liquidity",
];

impl EntryFeatures {
    pub fn from_pool(pool: &PoolInfo) -> Self {
        let liq = pool.liquidity_usd.max(1.0);
        Self {
            volume_30m: pool.volume_30m,
            volume_1h: pool.volume_1h,
            volume_2h: pool.volume_2h,
            volume_4h: pool.volume_4h,
            volume_24h: pool.volume_24h,
            fees_30m: pool.fees_30m,
            fees_1h: pool.fees_1h,
            fees_24h: pool.fees_24h,
            fee_efficiency_1h: pool.fees_1h / liq,
            liquidity: pool.liquidity_usd,
            apr: pool.apr,
            volume_to_liquidity: pool.volume_1h / liq,
        }
    }

    pub fn to_array(&self) -> [f64; 12] {
        [
            self.volume_30m,
            self.volume_1h,
            self.volume_2h,
            self.volume_4h,
            self.volume_24h,
            self.fees_30m,
            self.fees_1h,
            self.fees_24h,
            self.fee_efficiency_1h,
            self.liquidity,
            self.apr,
            self.volume_to_liquidity,
        ]
    }
}

/// One tracked liquidity position
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedPosition {
    pub id: String,
    pub mode: ExecutionMode,
    pub status: PositionStatus,

    // Pool identity
    pub pool_address: String,
    pub pool_name: String,
    pub mint_x: String,
    pub mint_y: String,
    pub bin_step: u16,

    // Entry
    pub entry_active_bin: i32,
    pub lower_bin: i32,
    pub upper_bin: i32,
    pub entry_price: f64,
    pub entry_timestamp: DateTime<Utc>,
    pub entry_amount_x: u64,
    pub entry_amount_y: u64,
    pub entry_tx_signature: String,
    pub entry_tx_cost_lamports: u64,
    pub entry_score: Option<f64>,
    pub ml_probability: Option<f64>,
    pub entry_features: Option<EntryFeatures>,

    // Risk snapshot
    pub profit_target_pct: f64,
    pub stop_loss_pct: f64,
    pub max_hold_minutes: i64,
    pub trailing_stop_enabled: bool,
    pub trailing_stop_pct: f64,
    /// Maximum pnl% observed while the position was open
    pub high_water_mark_pct: f64,

    // Live checkpoint
    pub current_price: f64,
    pub fees_earned_x: u64,
    pub fees_earned_y: u64,

    // Exit
    pub exit_price: Option<f64>,
    pub exit_timestamp: Option<DateTime<Utc>>,
    pub exit_tx_signature: Option<String>,
    pub exit_reason: Option<ExitReason>,
    pub realized_pnl_sol: Option<f64>,
    pub exit_tx_cost_lamports: u64,
}

impl TrackedPosition {
    /// Total entry value in lamports (Y-denominated)
    pub fn entry_value_lamports(&self) -> u64 {
        self.entry_amount_x + self.entry_amount_y
    }

    pub fn entry_value_sol(&self) -> f64 {
        self.entry_value_lamports() as f64 / LAMPORTS_PER_SOL
    }

    /// Unrealised pnl% from the current price against entry
    pub fn pnl_pct(&self) -> f64 {
        if self.entry_price == 0.0 {
            return 0.0;
        }
        (self.current_price - self.entry_price) / self.entry_price * 100.0
    }

    /// Minutes held as of `now`
    pub fn hold_minutes(&self, now: DateTime<Utc>) -> i64 {
        (now - self.entry_timestamp).num_seconds() / 60
    }

    /// Refresh the current price and advance the high-water mark.
    /// Returns the new pnl%.
    pub fn apply_price(&mut self, price: f64) -> f64 {
        self.current_price = price;
        let pnl = self.pnl_pct();
        if pnl > self.high_water_mark_pct {
            self.high_water_mark_pct = pnl;
        }
        pnl
    }

    /// Linearly derived unrealised P&L in lamports against the Y-side entry
    /// amount, for checkpoint persistence. Returns None for non-finite
    /// inputs.
    pub fn unrealized_pnl_lamports(&self) -> Option<i64> {
        if !self.current_price.is_finite() || !self.entry_price.is_finite() {
            return None;
        }
        if self.entry_price == 0.0 {
            return None;
        }
        let change = (self.current_price - self.entry_price) / self.entry_price;
        Some((change * self.entry_amount_y as f64).round() as i64)
    }

    pub fn mark_closing(&mut self) -> Result<(), PositionError> {
        if self.status != PositionStatus::Active {
            return Err(PositionError::NotActive);
        }
        self.status = PositionStatus::Closing;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    fn create_test_pool() -> PoolInfo {
        PoolInfo {
            address: "Pool111".to_string(),
            name: "TEST-SOL".to_string(),
            mint_x: "Mint111".to_string(),
            mint_y: super::super::bot_config::WRAPPED_SOL_MINT.to_string(),
            bin_step: 25,
            current_price: 1.0,
            liquidity_usd: 100_000.0,
            volume_30m: 2_000.0,
            volume_1h: 5_000.0,
            volume_2h: 9_000.0,
            volume_4h: 15_000.0,
            volume_24h: 80_000.0,
            fees_30m: 20.0,
            fees_1h: 50.0,
            fees_24h: 800.0,
            apr: 120.0,
            blacklisted: false,
        }
    }

    pub(crate) fn create_test_position() -> TrackedPosition {
        TrackedPosition {
            id: "pos-1".to_string(),
            mode: ExecutionMode::Simulation,
            status: PositionStatus::Active,
            pool_address: "Pool111".to_string(),
            pool_name: "TEST-SOL".to_string(),
            mint_x: "Mint111".to_string(),
            mint_y: super::super::bot_config::WRAPPED_SOL_MINT.to_string(),
            bin_step: 25,
            entry_active_bin: 0,
            lower_bin: -10,
            upper_bin: 10,
            entry_price: 1.0,
            entry_timestamp: Utc::now(),
            entry_amount_x: 500_000_000,
            entry_amount_y: 500_000_000,
            entry_tx_signature: "sig".to_string(),
            entry_tx_cost_lamports: 5_000,
            entry_score: None,
            ml_probability: None,
            entry_features: None,
            profit_target_pct: 5.0,
            stop_loss_pct: 10.0,
            max_hold_minutes: 60,
            trailing_stop_enabled: false,
            trailing_stop_pct: 2.0,
            high_water_mark_pct: 0.0,
            current_price: 1.0,
            fees_earned_x: 0,
            fees_earned_y: 0,
            exit_price: None,
            exit_timestamp: None,
            exit_tx_signature: None,
            exit_reason: None,
            realized_pnl_sol: None,
            exit_tx_cost_lamports: 0,
        }
    }

    #[test]
    fn test_feature_vector_order() {
        let pool = create_test_pool();
        let features = EntryFeatures::from_pool(&pool);
        let arr = features.to_array();

        assert_eq!(arr.len(), 12);
        assert_eq!(arr[0], 2_000.0); // volume_30m
        assert_eq!(arr[4], 80_000.0); // volume_24h
        assert_eq!(arr[7], 800.0); // fees_24h
        assert_eq!(arr[8], 50.0 / 100_000.0); // fee_efficiency_1h
        assert_eq!(arr[9], 100_000.0); // liquidity
        assert_eq!(arr[10], 120.0); // apr
        assert_eq!(arr[11], 5_000.0 / 100_000.0); // volume_to_liquidity
    }

    #[test]
    fn test_feature_divisor_floors_at_one() {
        let mut pool = create_test_pool();
        pool.liquidity_usd = 0.0;
        pool.fees_1h = 3.0;
        pool.volume_1h = 7.0;

        let features = EntryFeatures::from_pool(&pool);
        assert_eq!(features.fee_efficiency_1h, 3.0);
        assert_eq!(features.volume_to_liquidity, 7.0);
    }

    #[test]
    fn test_pnl_pct() {
        let mut position = create_test_position();
        position.apply_price(1.06);
        assert!((position.pnl_pct() - 6.0).abs() < 1e-9);

        position.apply_price(0.88);
        assert!((position.pnl_pct() + 12.0).abs() < 1e-9);
    }

    #[test]
    fn test_high_water_mark_only_rises() {
        let mut position = create_test_position();
        position.apply_price(1.08);
        assert!((position.high_water_mark_pct - 8.0).abs() < 1e-9);

        position.apply_price(1.02);
        assert!((position.high_water_mark_pct - 8.0).abs() < 1e-9);
    }

    #[test]
    fn test_unrealized_pnl_lamports() {
        let mut position = create_test_position();
        position.apply_price(1.06);
        // 6% of the 0.5 SOL Y-side
        assert_eq!(position.unrealized_pnl_lamports(), Some(30_000_000));
    }

    #[test]
    fn test_unrealized_pnl_non_finite_rejected() {
        let mut position = create_test_position();
        position.current_price = f64::NAN;
        assert_eq!(position.unrealized_pnl_lamports(), None);
    }

    #[test]
    fn test_mark_closing_requires_active() {
        let mut position = create_test_position();
        position.status = PositionStatus::Closed;
        assert!(position.mark_closing().is_err());
    }

    #[test]
    fn test_status_roundtrip() {
        for status in [
            PositionStatus::Pending,
            PositionStatus::Active,
            PositionStatus::Closing,
            PositionStatus::Closed,
            PositionStatus::Error,
        ] {
            assert_eq!(PositionStatus::parse(status.as_str()), Some(status));
        }
    }
}
