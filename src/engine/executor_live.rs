//! Live Executor
//!
//! Real on-chain execution. Every open passes three gates in order:
//! emergency stop, circuit breaker, wallet loaded and funded. Position
//! sizing is scaled down against the wallet balance minus the rent
//! reserve, preserving the X:Y ratio. Closes snapshot accrued fees (fees
//! only ever grow), tolerate multi-sub-transaction removals, and swap any
//! leftover non-SOL balance back to SOL off the critical path.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::adapters::chain::wallet::WalletManager;
use crate::domain::bot_config::{RENT_RESERVE_LAMPORTS, WRAPPED_SOL_MINT};
use crate::domain::circuit_breaker::CircuitBreaker;
use crate::domain::emergency_stop::EmergencyStop;
use crate::domain::position::{
    EntryFeatures, ExecutionMode, ExitReason, PositionStatus, TrackedPosition, LAMPORTS_PER_SOL,
};
use crate::engine::provider::MarketDataProvider;
use crate::ports::dlmm::{ChainReader, CreatePositionRequest, DlmmClient};
use crate::ports::executor::{
    CloseReceipt, Executor, ExecutorError, OpenReceipt, OpenRequest, PerformanceSummary,
};
use crate::ports::pool_api::PoolInfo;
use crate::ports::swap::SwapClient;

/// Token amounts below this are left in the wallet rather than swapped
pub const DUST_THRESHOLD: u64 = 1_000;

#[derive(Debug, Clone)]
pub struct LiveExecutorConfig {
    pub min_position_lamports: u64,
}

#[derive(Debug, Default)]
struct LiveStats {
    total_positions: u64,
    wins: u64,
    losses: u64,
    cumulative_pnl_sol: f64,
}

pub struct LiveExecutor {
    provider: Arc<MarketDataProvider>,
    dlmm: Arc<dyn DlmmClient>,
    chain: Arc<dyn ChainReader>,
    swap: Arc<dyn SwapClient>,
    wallet: Arc<WalletManager>,
    emergency: Arc<Mutex<EmergencyStop>>,
    breaker: Arc<Mutex<CircuitBreaker>>,
    config: LiveExecutorConfig,
    positions: RwLock<HashMap<String, TrackedPosition>>,
    stats: Mutex<LiveStats>,
}

impl LiveExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        provider: Arc<MarketDataProvider>,
        dlmm: Arc<dyn DlmmClient>,
        chain: Arc<dyn ChainReader>,
        swap: Arc<dyn SwapClient>,
        wallet: Arc<WalletManager>,
        emergency: Arc<Mutex<EmergencyStop>>,
        breaker: Arc<Mutex<CircuitBreaker>>,
        config: LiveExecutorConfig,
    ) -> Self {
        tracing::info!(wallet = %wallet.public_key(), "Live executor initialised");
        Self {
            provider,
            dlmm,
            chain,
            swap,
            wallet,
            emergency,
            breaker,
            config,
            positions: RwLock::new(HashMap::new()),
            stats: Mutex::new(LiveStats::default()),
        }
    }

    /// Scale the requested amounts down to what the wallet can fund after
    /// the rent reserve, preserving the X:Y ratio.
    fn size_to_balance(
        amount_x: u64,
        amount_y: u64,
        available: u64,
        min_total: u64,
    ) -> Result<(u64, u64), ExecutorError> {
        let requested = amount_x + amount_y;
        if requested <= available {
            return Ok((amount_x, amount_y));
        }

        let scale = available as f64 / requested as f64;
        let scaled_x = (amount_x as f64 * scale) as u64;
        let scaled_y = (amount_y as f64 * scale) as u64;
        let scaled_total = scaled_x + scaled_y;

        if scaled_total < min_total {
            return Err(ExecutorError::InsufficientBalance {
                have: available,
                need: min_total,
            });
        }

        tracing::info!(
            requested,
            adjusted = scaled_total,
            "Position size reduced to fit wallet balance"
        );
        Ok((scaled_x, scaled_y))
    }

    /// Mint on the non-SOL side of the pair
    fn non_sol_mint(position: &TrackedPosition) -> Option<String> {
        if position.mint_y == WRAPPED_SOL_MINT {
            Some(position.mint_x.clone())
        } else if position.mint_x == WRAPPED_SOL_MINT {
            Some(position.mint_y.clone())
        } else {
            None
        }
    }

    /// Swap leftover non-SOL balance back to SOL. Runs detached; failures
    /// are logged, never surfaced to the close that spawned it.
    fn spawn_leftover_swap(&self, position: &TrackedPosition) {
        let Some(mint) = Self::non_sol_mint(position) else {
            return;
        };
        let chain = Arc::clone(&self.chain);
        let swap = Arc::clone(&self.swap);
        let owner = self.wallet.public_key();
        let position_id = position.id.clone();

        tokio::spawn(async move {
            let amount = match chain.token_balance(&owner, &mint).await {
                Ok(amount) => amount,
                Err(e) => {
                    tracing::warn!(position = %position_id, error = %e, "Leftover balance check failed");
                    return;
                }
            };
            if amount < DUST_THRESHOLD {
                return;
            }
            match swap.swap_to_sol(&mint, amount).await {
                Ok(receipt) => {
                    tracing::info!(
                        position = %position_id,
                        amount,
                        out_lamports = receipt.out_lamports,
                        "Leftover tokens swapped to SOL"
                    );
                }
                Err(e) => {
                    tracing::warn!(position = %position_id, error = %e, "Leftover swap failed");
                }
            }
        });
    }
}

#[async_trait]
impl Executor for LiveExecutor {
    async fn open(
        &self,
        pool: &PoolInfo,
        request: OpenRequest,
    ) -> Result<OpenReceipt, ExecutorError> {
        let OpenRequest {
            range,
            amount_x,
            amount_y,
            risk,
        } = request;
        // Gate order is load-bearing: emergency stop, circuit breaker,
        // wallet funding.
        {
            let mut emergency = self.emergency.lock().await;
            let decision = emergency.can_trade();
            if !decision.allowed {
                return Err(ExecutorError::SafetyHalted(
                    decision.reason.unwrap_or_default(),
                ));
            }
        }

        let total = amount_x + amount_y;
        {
            let mut breaker = self.breaker.lock().await;
            let decision = breaker.can_open(&pool.address, total);
            if !decision.allowed {
                return Err(ExecutorError::Throttled(decision.reason.unwrap_or_default()));
            }
        }

        let balance = self
            .chain
            .balance_lamports(&self.wallet.public_key())
            .await
            .map_err(|e| ExecutorError::WalletUnavailable(e.to_string()))?;
        if balance <= RENT_RESERVE_LAMPORTS {
            return Err(ExecutorError::InsufficientBalance {
                have: balance,
                need: RENT_RESERVE_LAMPORTS + self.config.min_position_lamports,
            });
        }

        let available = balance - RENT_RESERVE_LAMPORTS;
        let (amount_x, amount_y) = Self::size_to_balance(
            amount_x,
            amount_y,
            available,
            self.config.min_position_lamports,
        )?;

        let bin = self
            .provider
            .active_bin(pool)
            .await
            .map_err(|e| ExecutorError::MarketData(e.to_string()))?;

        let request = CreatePositionRequest {
            pool_address: pool.address.clone(),
            lower_bin: range.lower,
            upper_bin: range.upper,
            amount_x,
            amount_y,
        };

        let receipt = match self.dlmm.create_position(&request).await {
            Ok(receipt) => receipt,
            Err(e) => {
                self.emergency.lock().await.record_tx_failure();
                return Err(ExecutorError::Chain(e.to_string()));
            }
        };

        let position = TrackedPosition {
            id: receipt.position_address.clone(),
            mode: ExecutionMode::Live,
            status: PositionStatus::Active,
            pool_address: pool.address.clone(),
            pool_name: pool.name.clone(),
            mint_x: pool.mint_x.clone(),
            mint_y: pool.mint_y.clone(),
            bin_step: pool.bin_step,
            entry_active_bin: bin.bin_id,
            lower_bin: range.lower,
            upper_bin: range.upper,
            entry_price: bin.price,
            entry_timestamp: Utc::now(),
            entry_amount_x: amount_x,
            entry_amount_y: amount_y,
            entry_tx_signature: receipt.signature.clone(),
            entry_tx_cost_lamports: receipt.fee_lamports,
            entry_score: None,
            ml_probability: None,
            entry_features: None,
            profit_target_pct: risk.profit_target_pct,
            stop_loss_pct: risk.stop_loss_pct,
            max_hold_minutes: risk.max_hold_minutes,
            trailing_stop_enabled: risk.trailing_stop_enabled,
            trailing_stop_pct: risk.trailing_stop_pct,
            high_water_mark_pct: 0.0,
            current_price: bin.price,
            fees_earned_x: 0,
            fees_earned_y: 0,
            exit_price: None,
            exit_timestamp: None,
            exit_tx_signature: None,
            exit_reason: None,
            realized_pnl_sol: None,
            exit_tx_cost_lamports: 0,
        };

        self.positions
            .write()
            .await
            .insert(position.id.clone(), position.clone());

        tracing::info!(
            pool = %pool.address,
            position = %position.id,
            signature = %receipt.signature,
            fee = receipt.fee_lamports,
            "[LIVE] Position opened"
        );

        Ok(OpenReceipt {
            position_id: position.id.clone(),
            signature: receipt.signature,
            position,
        })
    }

    async fn close(
        &self,
        position_id: &str,
        reason: ExitReason,
    ) -> Result<CloseReceipt, ExecutorError> {
        let mut position = {
            let positions = self.positions.read().await;
            positions
                .get(position_id)
                .cloned()
                .ok_or_else(|| ExecutorError::PositionNotFound(position_id.to_string()))?
        };

        if position.status != PositionStatus::Active {
            return Err(ExecutorError::PositionNotFound(position_id.to_string()));
        }
        position.status = PositionStatus::Closing;

        // Snapshot fees before removal; fees only ever grow, so keep the
        // larger of the prior snapshot and the on-chain value.
        match self.dlmm.position_fees(position_id).await {
            Ok((fx, fy)) => {
                position.fees_earned_x = position.fees_earned_x.max(fx);
                position.fees_earned_y = position.fees_earned_y.max(fy);
            }
            Err(e) => {
                tracing::warn!(position = position_id, error = %e, "Fee snapshot failed before close");
                self.emergency.lock().await.record_api_error();
            }
        }

        let receipt = match self
            .dlmm
            .remove_liquidity_and_close(&position.pool_address, position_id)
            .await
        {
            Ok(receipt) => receipt,
            Err(e) => {
                self.emergency.lock().await.record_tx_failure();
                // The position is still live on chain
                position.status = PositionStatus::Active;
                self.positions
                    .write()
                    .await
                    .insert(position.id.clone(), position.clone());
                return Err(ExecutorError::Chain(e.to_string()));
            }
        };

        position.fees_earned_x = position.fees_earned_x.max(receipt.fees_claimed_x);
        position.fees_earned_y = position.fees_earned_y.max(receipt.fees_claimed_y);

        let exit_price = match self.provider.get_pool(&position.pool_address).await {
            Ok(pool) => match self.provider.active_bin(&pool).await {
                Ok(bin) => bin.price,
                Err(_) => position.current_price,
            },
            Err(_) => position.current_price,
        };
        position.apply_price(exit_price);

        let price_change = if position.entry_price > 0.0 {
            (exit_price - position.entry_price) / position.entry_price
        } else {
            0.0
        };
        let entry_value = position.entry_value_lamports() as f64;
        let fees_in_sol =
            position.fees_earned_y as f64 + position.fees_earned_x as f64 * exit_price;
        let tx_costs =
            (position.entry_tx_cost_lamports + receipt.total_fee_lamports) as f64;
        let pnl_sol = (entry_value * price_change + fees_in_sol - tx_costs) / LAMPORTS_PER_SOL;

        let now = Utc::now();
        position.status = PositionStatus::Closed;
        position.exit_price = Some(exit_price);
        position.exit_timestamp = Some(now);
        position.exit_tx_signature = receipt.signatures.last().cloned();
        position.exit_reason = Some(reason);
        position.realized_pnl_sol = Some(pnl_sol);
        position.exit_tx_cost_lamports = receipt.total_fee_lamports;

        {
            let mut stats = self.stats.lock().await;
            stats.total_positions += 1;
            if pnl_sol > 0.0 {
                stats.wins += 1;
            } else {
                stats.losses += 1;
            }
            stats.cumulative_pnl_sol += pnl_sol;
        }

        self.positions
            .write()
            .await
            .insert(position.id.clone(), position.clone());

        tracing::info!(
            position = position_id,
            reason = reason.as_str(),
            pnl_sol,
            sub_txs = receipt.signatures.len(),
            "[LIVE] Position closed"
        );

        self.spawn_leftover_swap(&position);

        Ok(CloseReceipt {
            signature: position.exit_tx_signature.clone().unwrap_or_default(),
            realized_pnl_sol: pnl_sol,
            fees_x: position.fees_earned_x,
            fees_y: position.fees_earned_y,
            position,
        })
    }

    async fn update(&self, position_id: &str) -> Result<Option<TrackedPosition>, ExecutorError> {
        let mut position = {
            let positions = self.positions.read().await;
            match positions.get(position_id) {
                Some(p) if p.status == PositionStatus::Active => p.clone(),
                _ => return Ok(None),
            }
        };

        let pool = self
            .provider
            .get_pool(&position.pool_address)
            .await
            .map_err(|e| ExecutorError::MarketData(e.to_string()))?;
        let bin = self
            .provider
            .active_bin(&pool)
            .await
            .map_err(|e| ExecutorError::MarketData(e.to_string()))?;
        position.apply_price(bin.price);

        match self.dlmm.position_fees(position_id).await {
            Ok((fx, fy)) => {
                position.fees_earned_x = position.fees_earned_x.max(fx);
                position.fees_earned_y = position.fees_earned_y.max(fy);
            }
            Err(e) => {
                tracing::debug!(position = position_id, error = %e, "Fee refresh failed");
                self.emergency.lock().await.record_api_error();
            }
        }

        self.positions
            .write()
            .await
            .insert(position.id.clone(), position.clone());

        Ok(Some(position))
    }

    async fn active_positions(&self) -> Vec<TrackedPosition> {
        self.positions
            .read()
            .await
            .values()
            .filter(|p| p.status == PositionStatus::Active)
            .cloned()
            .collect()
    }

    async fn position(&self, position_id: &str) -> Option<TrackedPosition> {
        self.positions.read().await.get(position_id).cloned()
    }

    async fn adopt(&self, positions: Vec<TrackedPosition>) {
        let mut map = self.positions.write().await;
        for position in positions {
            if position.status == PositionStatus::Active {
                tracing::info!(position = %position.id, pool = %position.pool_address, "Adopted persisted position");
                map.insert(position.id.clone(), position);
            }
        }
    }

    async fn balance(&self) -> u64 {
        match self
            .chain
            .balance_lamports(&self.wallet.public_key())
            .await
        {
            Ok(balance) => balance,
            Err(e) => {
                tracing::warn!(error = %e, "Wallet balance read failed");
                0
            }
        }
    }

    async fn performance_summary(&self) -> PerformanceSummary {
        let stats = self.stats.lock().await;
        let closed = stats.wins + stats.losses;
        PerformanceSummary {
            total_positions: stats.total_positions,
            wins: stats.wins,
            losses: stats.losses,
            win_rate_pct: if closed > 0 {
                stats.wins as f64 / closed as f64 * 100.0
            } else {
                0.0
            },
            cumulative_pnl_sol: stats.cumulative_pnl_sol,
            balance_lamports: self.balance().await,
        }
    }

    async fn annotate_entry(
        &self,
        position_id: &str,
        score: f64,
        ml_probability: Option<f64>,
        features: EntryFeatures,
    ) -> Option<TrackedPosition> {
        let mut positions = self.positions.write().await;
        let position = positions.get_mut(position_id)?;
        position.entry_score = Some(score);
        position.ml_probability = ml_probability;
        position.entry_features = Some(features);
        Some(position.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::cache::{CacheConfig, SharedPoolCache};
    use crate::domain::circuit_breaker::CircuitBreakerLimits;
    use crate::domain::emergency_stop::EmergencyStopLimits;
    use crate::domain::scoring::MarketScorer;
    use crate::ports::mocks::{
        test_pool, MockChainReader, MockDlmmClient, MockPoolApi, MockSwapClient,
    };

    const SOL: u64 = 1_000_000_000;

    fn req(amount_x: u64, amount_y: u64) -> OpenRequest {
        OpenRequest {
            range: crate::ports::executor::BinRange::around(0, 10),
            amount_x,
            amount_y,
            risk: crate::ports::executor::RiskSnapshot {
                profit_target_pct: 5.0,
                stop_loss_pct: 10.0,
                max_hold_minutes: 60,
                trailing_stop_enabled: false,
                trailing_stop_pct: 2.0,
            },
        }
    }

    struct Harness {
        executor: LiveExecutor,
        dlmm: Arc<MockDlmmClient>,
        chain: Arc<MockChainReader>,
        swap: Arc<MockSwapClient>,
        emergency: Arc<Mutex<EmergencyStop>>,
        pool: PoolInfo,
    }

    fn build(balance: u64) -> Harness {
        let pool = test_pool("a", 1.0);
        let api = Arc::new(MockPoolApi::with_pools(vec![pool.clone()]));
        let dlmm = Arc::new(MockDlmmClient::new(25));
        dlmm.set_price_sequence("a", vec![1.0]);
        let chain = Arc::new(MockChainReader::new(balance));
        let swap = Arc::new(MockSwapClient::new());
        let cache = Arc::new(SharedPoolCache::new(api, CacheConfig::fast()));
        let provider = Arc::new(MarketDataProvider::new(
            cache,
            Some(Arc::clone(&dlmm) as Arc<dyn DlmmClient>),
            MarketScorer::default(),
        ));
        let emergency = Arc::new(Mutex::new(EmergencyStop::new(EmergencyStopLimits::default())));
        let breaker = Arc::new(Mutex::new(CircuitBreaker::new(
            CircuitBreakerLimits::default(),
        )));

        let executor = LiveExecutor::new(
            provider,
            Arc::clone(&dlmm) as Arc<dyn DlmmClient>,
            Arc::clone(&chain) as Arc<dyn ChainReader>,
            Arc::clone(&swap) as Arc<dyn SwapClient>,
            Arc::new(WalletManager::new_random()),
            Arc::clone(&emergency),
            breaker,
            LiveExecutorConfig {
                min_position_lamports: SOL / 10,
            },
        );

        Harness {
            executor,
            dlmm,
            chain,
            swap,
            emergency,
            pool,
        }
    }

    #[tokio::test]
    async fn test_open_happy_path() {
        let h = build(10 * SOL);
        let receipt = h
            .executor
            .open(&h.pool, req(SOL / 2, SOL / 2))
            .await
            .unwrap();

        assert_eq!(receipt.position.mode, ExecutionMode::Live);
        assert_eq!(h.dlmm.create_calls(), 1);
        assert_eq!(receipt.position.entry_tx_cost_lamports, 5_000);
    }

    #[tokio::test]
    async fn test_open_blocked_by_emergency_stop() {
        let h = build(10 * SOL);
        h.emergency.lock().await.manual_trigger("halt");

        let result = h
            .executor
            .open(&h.pool, req(SOL / 2, SOL / 2))
            .await;

        assert!(matches!(result, Err(ExecutorError::SafetyHalted(_))));
        assert_eq!(h.dlmm.create_calls(), 0);
    }

    #[tokio::test]
    async fn test_sizing_scales_down_preserving_ratio() {
        // Wallet can fund 1 SOL after the reserve; request 2 SOL at 3:1
        let h = build(SOL + RENT_RESERVE_LAMPORTS);
        let receipt = h
            .executor
            .open(&h.pool, req(3 * SOL / 2, SOL / 2))
            .await
            .unwrap();

        let p = &receipt.position;
        let total = p.entry_amount_x + p.entry_amount_y;
        assert!(total <= SOL);
        // 3:1 ratio preserved within rounding
        let ratio = p.entry_amount_x as f64 / p.entry_amount_y as f64;
        assert!((ratio - 3.0).abs() < 0.01);
    }

    #[tokio::test]
    async fn test_sizing_fails_below_minimum() {
        let h = build(RENT_RESERVE_LAMPORTS + SOL / 100); // 0.01 SOL available
        let result = h
            .executor
            .open(&h.pool, req(SOL / 2, SOL / 2))
            .await;

        assert!(matches!(
            result,
            Err(ExecutorError::InsufficientBalance { .. })
        ));
    }

    #[tokio::test]
    async fn test_create_failure_records_tx_failure() {
        let h = build(10 * SOL);
        h.dlmm.fail_create(true);

        let result = h
            .executor
            .open(&h.pool, req(SOL / 2, SOL / 2))
            .await;

        assert!(matches!(result, Err(ExecutorError::Chain(_))));
        assert_eq!(h.emergency.lock().await.state().tx_failures.len(), 1);
    }

    #[tokio::test]
    async fn test_close_failure_restores_active_status() {
        let h = build(10 * SOL);
        let receipt = h
            .executor
            .open(&h.pool, req(SOL / 2, SOL / 2))
            .await
            .unwrap();

        h.dlmm.fail_close(true);
        let result = h
            .executor
            .close(&receipt.position_id, ExitReason::UserRequested)
            .await;

        assert!(result.is_err());
        let position = h.executor.position(&receipt.position_id).await.unwrap();
        assert_eq!(position.status, PositionStatus::Active);
        assert_eq!(h.emergency.lock().await.state().tx_failures.len(), 1);
    }

    #[tokio::test]
    async fn test_close_takes_max_of_fee_snapshots() {
        let h = build(10 * SOL);
        let receipt = h
            .executor
            .open(&h.pool, req(SOL / 2, SOL / 2))
            .await
            .unwrap();

        // On-chain snapshot sees large fees; removal claims fewer
        h.dlmm
            .set_position_fees(&receipt.position_id, (2_000, 9_000));
        let close = h
            .executor
            .close(&receipt.position_id, ExitReason::TakeProfit)
            .await
            .unwrap();

        assert_eq!(close.fees_x, 2_000);
        assert_eq!(close.fees_y, 9_000);
    }

    #[tokio::test]
    async fn test_leftover_swap_spawned_above_dust() {
        let h = build(10 * SOL);
        let receipt = h
            .executor
            .open(&h.pool, req(SOL / 2, SOL / 2))
            .await
            .unwrap();

        h.chain.set_token_balance(&h.pool.mint_x, 50_000);
        h.executor
            .close(&receipt.position_id, ExitReason::UserRequested)
            .await
            .unwrap();

        // The swap runs detached
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let swaps = h.swap.swaps();
        assert_eq!(swaps.len(), 1);
        assert_eq!(swaps[0], (h.pool.mint_x.clone(), 50_000));
    }

    #[tokio::test]
    async fn test_dust_not_swapped() {
        let h = build(10 * SOL);
        let receipt = h
            .executor
            .open(&h.pool, req(SOL / 2, SOL / 2))
            .await
            .unwrap();

        h.chain.set_token_balance(&h.pool.mint_x, DUST_THRESHOLD - 1);
        h.executor
            .close(&receipt.position_id, ExitReason::UserRequested)
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(h.swap.swaps().is_empty());
    }

    #[tokio::test]
    async fn test_swap_failure_is_non_fatal() {
        let h = build(10 * SOL);
        let receipt = h
            .executor
            .open(&h.pool, req(SOL / 2, SOL / 2))
            .await
            .unwrap();

        h.chain.set_token_balance(&h.pool.mint_x, 50_000);
        h.swap.fail(true);

        let close = h
            .executor
            .close(&receipt.position_id, ExitReason::UserRequested)
            .await;
        assert!(close.is_ok());
    }
}
