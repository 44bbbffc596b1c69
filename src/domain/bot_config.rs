//! Per-Bot Configuration
//!
//! The immutable parameter set a running engine is constructed from. A bot
//! row in storage is translated into a `BotConfig` on start; the engine
//! never mutates it.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::position::{ExecutionMode, LAMPORTS_PER_SOL};

/// Canonical wrapped-SOL mint address
pub const WRAPPED_SOL_MINT: &str = "So11111111111111111111111111111111111111112";

/// Lamports held back in the wallet to cover rent and network fees
pub const RENT_RESERVE_LAMPORTS: u64 = 30_000_000; // 0.03 SOL

#[derive(Debug, Error)]
pub enum BotConfigError {
    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("Unknown strategy mode: {0}")]
    UnknownStrategyMode(String),

    #[error("Unknown execution mode: {0}")]
    UnknownExecutionMode(String),
}

/// How scan candidates are scored and admitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrategyMode {
    /// Rule-based market score against a fixed threshold
    RuleBased,
    /// ML predictor over the 12-feature vector, rule-based fallback
    Ml,
    /// Rule-based filter, then the predictor must also recommend entry
    Hybrid,
}

impl StrategyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyMode::RuleBased => "rule_based",
            StrategyMode::Ml => "ml",
            StrategyMode::Hybrid => "hybrid",
        }
    }

    pub fn parse(s: &str) -> Result<Self, BotConfigError> {
        match s {
            "rule_based" => Ok(StrategyMode::RuleBased),
            "ml" => Ok(StrategyMode::Ml),
            "hybrid" => Ok(StrategyMode::Hybrid),
            other => Err(BotConfigError::UnknownStrategyMode(other.to_string())),
        }
    }

    /// Whether this mode consults the remote predictor at all
    pub fn uses_predictor(&self) -> bool {
        matches!(self, StrategyMode::Ml | StrategyMode::Hybrid)
    }
}

/// Parameters for one bot, fixed for the engine lifetime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    pub bot_id: String,
    pub user_id: String,
    pub name: String,
    pub mode: ExecutionMode,
    pub strategy_mode: StrategyMode,

    // Entry filters
    /// Minimum rule-based market score for admission
    pub entry_score_threshold: f64,
    pub min_liquidity_usd: f64,
    pub max_liquidity_usd: f64,
    pub min_volume_24h_usd: f64,
    /// Require one side of the pair to be wrapped SOL
    pub sol_pairs_only: bool,
    /// User-supplied mint blacklist
    pub mint_blacklist: Vec<String>,

    // Position sizing
    /// Fixed size in SOL; used when `position_size_percent` is unset
    pub position_size_sol: Option<f64>,
    /// Size as a percentage of current balance; takes precedence
    pub position_size_percent: Option<f64>,
    pub min_position_sol: f64,
    pub max_position_sol: f64,
    /// Symmetric bin span either side of the active bin
    pub default_bin_range: i32,
    pub max_concurrent_positions: usize,

    // Risk parameters
    pub profit_target_pct: f64,
    pub stop_loss_pct: f64,
    pub trailing_stop_enabled: bool,
    pub trailing_stop_pct: f64,
    pub max_hold_minutes: i64,
    pub max_daily_loss_sol: f64,
    pub cooldown_minutes: i64,

    // Scheduling
    pub scan_interval_secs: u64,
    pub position_check_interval_secs: u64,

    // Simulation
    pub sim_initial_balance_sol: f64,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            bot_id: String::new(),
            user_id: String::new(),
            name: String::new(),
            mode: ExecutionMode::Simulation,
            strategy_mode: StrategyMode::RuleBased,
            entry_score_threshold: 150.0,
            min_liquidity_usd: 10_000.0,
            max_liquidity_usd: 5_000_000.0,
            min_volume_24h_usd: 50_000.0,
            sol_pairs_only: true,
            mint_blacklist: Vec::new(),
            position_size_sol: None,
            position_size_percent: None,
            min_position_sol: 0.1,
            max_position_sol: 10.0,
            default_bin_range: 10,
            max_concurrent_positions: 3,
            profit_target_pct: 5.0,
            stop_loss_pct: 10.0,
            trailing_stop_enabled: false,
            trailing_stop_pct: 2.0,
            max_hold_minutes: 360,
            max_daily_loss_sol: 1.0,
            cooldown_minutes: 30,
            scan_interval_secs: 60,
            position_check_interval_secs: 10,
            sim_initial_balance_sol: 10.0,
        }
    }
}

impl BotConfig {
    /// Validate parameter ranges before an engine is built from this config
    pub fn validate(&self) -> Result<(), BotConfigError> {
        if self.bot_id.is_empty() {
            return Err(BotConfigError::Invalid("bot_id cannot be empty".into()));
        }

        if self.min_liquidity_usd < 0.0 || self.max_liquidity_usd <= self.min_liquidity_usd {
            return Err(BotConfigError::Invalid(format!(
                "liquidity bounds invalid: [{}, {}]",
                self.min_liquidity_usd, self.max_liquidity_usd
            )));
        }

        if let Some(pct) = self.position_size_percent {
            if pct <= 0.0 || pct > 100.0 {
                return Err(BotConfigError::Invalid(format!(
                    "position_size_percent must be in (0, 100], got {}",
                    pct
                )));
            }
        }

        if let Some(sol) = self.position_size_sol {
            if sol <= 0.0 {
                return Err(BotConfigError::Invalid(format!(
                    "position_size_sol must be > 0, got {}",
                    sol
                )));
            }
        }

        if self.min_position_sol <= 0.0 || self.max_position_sol < self.min_position_sol {
            return Err(BotConfigError::Invalid(format!(
                "position size bounds invalid: [{}, {}]",
                self.min_position_sol, self.max_position_sol
            )));
        }

        if self.stop_loss_pct <= 0.0 || self.stop_loss_pct > 100.0 {
            return Err(BotConfigError::Invalid(format!(
                "stop_loss_pct must be in (0, 100], got {}",
                self.stop_loss_pct
            )));
        }

        if self.profit_target_pct <= 0.0 {
            return Err(BotConfigError::Invalid(format!(
                "profit_target_pct must be > 0, got {}",
                self.profit_target_pct
            )));
        }

        if self.trailing_stop_enabled && self.trailing_stop_pct <= 0.0 {
            return Err(BotConfigError::Invalid(format!(
                "trailing_stop_pct must be > 0 when trailing is enabled, got {}",
                self.trailing_stop_pct
            )));
        }

        if self.max_hold_minutes <= 0 {
            return Err(BotConfigError::Invalid(format!(
                "max_hold_minutes must be > 0, got {}",
                self.max_hold_minutes
            )));
        }

        if self.max_daily_loss_sol <= 0.0 {
            return Err(BotConfigError::Invalid(format!(
                "max_daily_loss_sol must be > 0, got {}",
                self.max_daily_loss_sol
            )));
        }

        if self.max_concurrent_positions == 0 {
            return Err(BotConfigError::Invalid(
                "max_concurrent_positions must be > 0".into(),
            ));
        }

        if self.scan_interval_secs == 0 || self.position_check_interval_secs == 0 {
            return Err(BotConfigError::Invalid(
                "scan and position-check intervals must be > 0".into(),
            ));
        }

        if self.default_bin_range <= 0 {
            return Err(BotConfigError::Invalid(format!(
                "default_bin_range must be > 0, got {}",
                self.default_bin_range
            )));
        }

        if self.mode == ExecutionMode::Simulation && self.sim_initial_balance_sol <= 0.0 {
            return Err(BotConfigError::Invalid(format!(
                "sim_initial_balance_sol must be > 0, got {}",
                self.sim_initial_balance_sol
            )));
        }

        Ok(())
    }

    /// Position size in lamports for the given balance, before the reserve
    /// clamp. Percent-of-balance wins over fixed size; the fallback is 10%
    /// of balance.
    pub fn position_size_lamports(&self, balance_lamports: u64) -> u64 {
        let sol = if let Some(pct) = self.position_size_percent {
            (balance_lamports as f64 / LAMPORTS_PER_SOL) * pct / 100.0
        } else if let Some(fixed) = self.position_size_sol {
            fixed
        } else {
            (balance_lamports as f64 / LAMPORTS_PER_SOL) * 0.10
        };

        let clamped = sol.clamp(self.min_position_sol, self.max_position_sol);
        (clamped * LAMPORTS_PER_SOL) as u64
    }

    pub fn min_position_lamports(&self) -> u64 {
        (self.min_position_sol * LAMPORTS_PER_SOL) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_config() -> BotConfig {
        BotConfig {
            bot_id: "bot-1".to_string(),
            user_id: "user-1".to_string(),
            name: "test".to_string(),
            ..BotConfig::default()
        }
    }

    #[test]
    fn test_default_config_valid() {
        let config = create_test_config();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_bot_id_rejected() {
        let config = BotConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_liquidity_bounds() {
        let mut config = create_test_config();
        config.min_liquidity_usd = 100_000.0;
        config.max_liquidity_usd = 50_000.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_percent_size() {
        let mut config = create_test_config();
        config.position_size_percent = Some(150.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_strategy_mode_roundtrip() {
        for mode in [StrategyMode::RuleBased, StrategyMode::Ml, StrategyMode::Hybrid] {
            assert_eq!(StrategyMode::parse(mode.as_str()).unwrap(), mode);
        }
        assert!(StrategyMode::parse("quantum").is_err());
    }

    #[test]
    fn test_sizing_percent_takes_precedence() {
        let mut config = create_test_config();
        config.position_size_percent = Some(20.0);
        config.position_size_sol = Some(5.0);
        config.min_position_sol = 0.1;
        config.max_position_sol = 100.0;

        // 20% of 10 SOL = 2 SOL
        let size = config.position_size_lamports(10 * LAMPORTS_PER_SOL as u64);
        assert_eq!(size, 2 * LAMPORTS_PER_SOL as u64);
    }

    #[test]
    fn test_sizing_fixed_fallback() {
        let mut config = create_test_config();
        config.position_size_sol = Some(1.5);
        config.max_position_sol = 100.0;

        let size = config.position_size_lamports(10 * LAMPORTS_PER_SOL as u64);
        assert_eq!(size, (1.5 * LAMPORTS_PER_SOL) as u64);
    }

    #[test]
    fn test_sizing_default_ten_percent() {
        let mut config = create_test_config();
        config.position_size_sol = None;
        config.position_size_percent = None;
        config.max_position_sol = 100.0;

        let size = config.position_size_lamports(10 * LAMPORTS_PER_SOL as u64);
        assert_eq!(size, LAMPORTS_PER_SOL as u64);
    }

    #[test]
    fn test_sizing_clamped_to_bounds() {
        let mut config = create_test_config();
        config.position_size_sol = Some(50.0);
        config.max_position_sol = 10.0;

        let size = config.position_size_lamports(100 * LAMPORTS_PER_SOL as u64);
        assert_eq!(size, 10 * LAMPORTS_PER_SOL as u64);
    }
}
