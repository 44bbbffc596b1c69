//! Simulation Executor
//!
//! Executes against a virtual balance: opens deduct the entry amount plus
//! a nominal transaction fee, updates accrue a linear-time fee estimate,
//! closes realise P&L from the price change plus accrued fees. No failure
//! here is ever financial.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::domain::position::{
    EntryFeatures, ExecutionMode, ExitReason, PositionStatus, TrackedPosition, LAMPORTS_PER_SOL,
};
use crate::engine::provider::MarketDataProvider;
use crate::ports::executor::{
    CloseReceipt, Executor, ExecutorError, OpenReceipt, OpenRequest, PerformanceSummary,
};
use crate::ports::pool_api::PoolInfo;

/// Nominal per-transaction fee charged by the simulation
pub const SIM_TX_FEE_LAMPORTS: u64 = 5_000;

/// Linear fee accrual: 0.1% of entry value per hour in range
pub const SIM_HOURLY_FEE_RATE: f64 = 0.001;

#[derive(Debug, Default)]
struct SimStats {
    total_positions: u64,
    wins: u64,
    losses: u64,
    cumulative_pnl_sol: f64,
}

pub struct SimulationExecutor {
    provider: Arc<MarketDataProvider>,
    positions: RwLock<HashMap<String, TrackedPosition>>,
    balance_lamports: Mutex<u64>,
    stats: Mutex<SimStats>,
}

impl SimulationExecutor {
    pub fn new(provider: Arc<MarketDataProvider>, initial_balance_lamports: u64) -> Self {
        tracing::info!(
            initial_balance = initial_balance_lamports,
            "Simulation executor initialised"
        );
        Self {
            provider,
            positions: RwLock::new(HashMap::new()),
            balance_lamports: Mutex::new(initial_balance_lamports),
            stats: Mutex::new(SimStats::default()),
        }
    }

    /// Accrued fee estimate in lamports for a position held `hours`
    fn accrued_fees_lamports(position: &TrackedPosition, hours: f64) -> u64 {
        (position.entry_value_lamports() as f64 * SIM_HOURLY_FEE_RATE * hours).round() as u64
    }

    async fn refresh(&self, position: &mut TrackedPosition) -> Result<(), ExecutorError> {
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

        let hours = (Utc::now() - position.entry_timestamp).num_seconds() as f64 / 3600.0;
        position.fees_earned_y = Self::accrued_fees_lamports(position, hours.max(0.0));
        Ok(())
    }
}

#[async_trait]
impl Executor for SimulationExecutor {
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
        let total = amount_x + amount_y;
        let needed = total + SIM_TX_FEE_LAMPORTS;

        let bin = self
            .provider
            .active_bin(pool)
            .await
            .map_err(|e| ExecutorError::MarketData(e.to_string()))?;

        {
            let mut balance = self.balance_lamports.lock().await;
            if *balance < needed {
                return Err(ExecutorError::InsufficientBalance {
                    have: *balance,
                    need: needed,
                });
            }
            *balance -= needed;
        }

        let id = Uuid::new_v4().to_string();
        let signature = format!("sim-{}", &id[..8]);

        let position = TrackedPosition {
            id: id.clone(),
            mode: ExecutionMode::Simulation,
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
            entry_tx_signature: signature.clone(),
            entry_tx_cost_lamports: SIM_TX_FEE_LAMPORTS,
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
            .insert(id.clone(), position.clone());

        tracing::info!(
            pool = %pool.address,
            amount = total,
            price = bin.price,
            "[SIM] Position opened"
        );

        Ok(OpenReceipt {
            position_id: id,
            signature,
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

        // Best-effort final refresh; a stale price is still a valid close
        if let Err(e) = self.refresh(&mut position).await {
            tracing::warn!(position = position_id, error = %e, "Final refresh failed, closing on last price");
        }

        let exit_price = position.current_price;
        let price_change = if position.entry_price > 0.0 {
            (exit_price - position.entry_price) / position.entry_price
        } else {
            0.0
        };

        let entry_value = position.entry_value_lamports() as f64;
        let fees = position.fees_earned_y as f64;
        let tx_costs = (position.entry_tx_cost_lamports + SIM_TX_FEE_LAMPORTS) as f64;
        let pnl_lamports = entry_value * price_change + fees - tx_costs;
        let pnl_sol = pnl_lamports / LAMPORTS_PER_SOL;

        let now = Utc::now();
        position.status = PositionStatus::Closed;
        position.exit_price = Some(exit_price);
        position.exit_timestamp = Some(now);
        position.exit_tx_signature = Some(format!("sim-close-{}", &position.id[..8]));
        position.exit_reason = Some(reason);
        position.realized_pnl_sol = Some(pnl_sol);
        position.exit_tx_cost_lamports = SIM_TX_FEE_LAMPORTS;

        // Credit the entry value back, adjusted by realised P&L
        {
            let mut balance = self.balance_lamports.lock().await;
            let credit = (entry_value + pnl_lamports).max(0.0) as u64;
            *balance += credit;
        }

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
            "[SIM] Position closed"
        );

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

        self.refresh(&mut position).await?;

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
        *self.balance_lamports.lock().await
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
            balance_lamports: *self.balance_lamports.lock().await,
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
    use crate::domain::scoring::MarketScorer;
    use crate::ports::dlmm::DlmmClient;
    use crate::ports::mocks::{test_pool, MockDlmmClient, MockPoolApi};

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

    fn build(
        prices: Vec<f64>,
    ) -> (Arc<SimulationExecutor>, PoolInfo, Arc<MockDlmmClient>) {
        let pool = test_pool("a", prices[0]);
        let api = Arc::new(MockPoolApi::with_pools(vec![pool.clone()]));
        let dlmm = Arc::new(MockDlmmClient::new(25));
        dlmm.set_price_sequence("a", prices);
        let cache = Arc::new(SharedPoolCache::new(api, CacheConfig::fast()));
        let provider = Arc::new(MarketDataProvider::new(
            cache,
            Some(Arc::clone(&dlmm) as Arc<dyn DlmmClient>),
            MarketScorer::default(),
        ));
        (
            Arc::new(SimulationExecutor::new(provider, 10 * SOL)),
            pool,
            dlmm,
        )
    }

    #[tokio::test]
    async fn test_open_deducts_balance() {
        let (executor, pool, _) = build(vec![1.0]);
        let receipt = executor
            .open(&pool, req(SOL / 2, SOL / 2))
            .await
            .unwrap();

        assert_eq!(receipt.position.status, PositionStatus::Active);
        assert_eq!(executor.balance().await, 9 * SOL - SIM_TX_FEE_LAMPORTS);
        assert_eq!(executor.active_positions().await.len(), 1);
    }

    #[tokio::test]
    async fn test_open_insufficient_balance() {
        let (executor, pool, _) = build(vec![1.0]);
        let result = executor
            .open(&pool, req(20 * SOL, 0))
            .await;

        assert!(matches!(
            result,
            Err(ExecutorError::InsufficientBalance { .. })
        ));
        // Nothing was deducted
        assert_eq!(executor.balance().await, 10 * SOL);
    }

    #[tokio::test]
    async fn test_profitable_close_credits_balance() {
        let (executor, pool, _) = build(vec![1.0, 1.06]);
        let receipt = executor
            .open(&pool, req(SOL / 2, SOL / 2))
            .await
            .unwrap();

        // Let the cached bin expire so the close sees the next price
        tokio::time::sleep(std::time::Duration::from_millis(150)).await;

        let close = executor
            .close(&receipt.position_id, ExitReason::TakeProfit)
            .await
            .unwrap();

        assert!(close.realized_pnl_sol > 0.05);
        assert_eq!(close.position.status, PositionStatus::Closed);
        assert_eq!(close.position.exit_reason, Some(ExitReason::TakeProfit));
        assert!(executor.balance().await > 10 * SOL);

        let summary = executor.performance_summary().await;
        assert_eq!(summary.total_positions, 1);
        assert_eq!(summary.wins, 1);
        assert_eq!(summary.win_rate_pct, 100.0);
    }

    #[tokio::test]
    async fn test_losing_close() {
        let (executor, pool, _) = build(vec![1.0, 0.88]);
        let receipt = executor
            .open(&pool, req(SOL / 2, SOL / 2))
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(150)).await;

        let close = executor
            .close(&receipt.position_id, ExitReason::StopLoss)
            .await
            .unwrap();

        assert!(close.realized_pnl_sol < 0.0);
        assert!(executor.balance().await < 10 * SOL);

        let summary = executor.performance_summary().await;
        assert_eq!(summary.losses, 1);
    }

    #[tokio::test]
    async fn test_update_refreshes_price_and_hwm() {
        let (executor, pool, _) = build(vec![1.0, 1.08]);
        let receipt = executor
            .open(&pool, req(SOL / 2, SOL / 2))
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(150)).await;

        let updated = executor.update(&receipt.position_id).await.unwrap().unwrap();
        assert!((updated.current_price - 1.08).abs() < 1e-9);
        assert!((updated.high_water_mark_pct - 8.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_update_unknown_position() {
        let (executor, _, _) = build(vec![1.0]);
        assert!(executor.update("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_double_close_rejected() {
        let (executor, pool, _) = build(vec![1.0]);
        let receipt = executor
            .open(&pool, req(SOL / 2, SOL / 2))
            .await
            .unwrap();

        executor
            .close(&receipt.position_id, ExitReason::UserRequested)
            .await
            .unwrap();
        assert!(executor
            .close(&receipt.position_id, ExitReason::UserRequested)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_annotate_entry() {
        let (executor, pool, _) = build(vec![1.0]);
        let receipt = executor
            .open(&pool, req(SOL / 2, SOL / 2))
            .await
            .unwrap();

        let annotated = executor
            .annotate_entry(
                &receipt.position_id,
                162.5,
                Some(0.81),
                EntryFeatures::from_pool(&pool),
            )
            .await
            .unwrap();

        assert_eq!(annotated.entry_score, Some(162.5));
        assert_eq!(annotated.ml_probability, Some(0.81));
        assert!(annotated.entry_features.is_some());
    }
}
