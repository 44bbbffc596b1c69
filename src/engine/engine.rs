//! Trading Engine
//!
//! The per-bot scheduler and state machine. Three recurring tasks: the
//! scan (candidate discovery and entry), the position check (exit
//! evaluation), and the checkpoint (unrealised-P&L flush). The scan body
//! is guarded against overlapping ticks; all tasks shut down
//! cooperatively through a watch channel and the final checkpoint runs
//! before `engine:stopped` is emitted.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::domain::bot_config::{BotConfig, StrategyMode, RENT_RESERVE_LAMPORTS};
use crate::domain::circuit_breaker::CircuitBreaker;
use crate::domain::cooldown::CooldownTracker;
use crate::domain::emergency_stop::EmergencyStop;
use crate::domain::events::{BotEvent, BotEventKind, EngineStats};
use crate::domain::position::{EntryFeatures, ExitReason, TrackedPosition};
use crate::engine::provider::MarketDataProvider;
use crate::ports::executor::{
    BinRange, CloseReceipt, Executor, ExecutorError, OpenRequest, RiskSnapshot,
};
use crate::ports::pool_api::PoolInfo;
use crate::ports::predictor::Predictor;

/// Pause between consecutive entry attempts in one scan
const INTER_ENTRY_DELAY: Duration = Duration::from_millis(500);

/// Checkpoint cadence
const CHECKPOINT_INTERVAL: Duration = Duration::from_secs(30);

/// ML mode pre-filters this many pools by raw 1h volume
const ML_PREFILTER_LIMIT: usize = 30;

/// Hybrid mode forwards this many rule-based leaders to the model
const HYBRID_CANDIDATE_LIMIT: usize = 10;

/// One scored scan candidate
#[derive(Debug, Clone)]
struct Candidate {
    pool: PoolInfo,
    score: f64,
    ml_probability: Option<f64>,
}

pub struct TradingEngine {
    config: BotConfig,
    executor: Arc<dyn Executor>,
    provider: Arc<MarketDataProvider>,
    emergency: Arc<Mutex<EmergencyStop>>,
    breaker: Arc<Mutex<CircuitBreaker>>,
    predictor: Option<Arc<dyn Predictor>>,
    events: mpsc::UnboundedSender<BotEvent>,
    scanning: AtomicBool,
    running: AtomicBool,
    cooldowns: Mutex<CooldownTracker>,
    stats: Mutex<EngineStats>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TradingEngine {
    pub fn new(
        config: BotConfig,
        executor: Arc<dyn Executor>,
        provider: Arc<MarketDataProvider>,
        emergency: Arc<Mutex<EmergencyStop>>,
        breaker: Arc<Mutex<CircuitBreaker>>,
        predictor: Option<Arc<dyn Predictor>>,
        events: mpsc::UnboundedSender<BotEvent>,
    ) -> Self {
        let cooldowns = CooldownTracker::new(config.cooldown_minutes);
        let (shutdown, _) = watch::channel(false);
        Self {
            executor,
            provider,
            emergency,
            breaker,
            predictor,
            events,
            scanning: AtomicBool::new(false),
            running: AtomicBool::new(false),
            cooldowns: Mutex::new(cooldowns),
            stats: Mutex::new(EngineStats::new(Utc::now())),
            shutdown,
            tasks: Mutex::new(Vec::new()),
            config,
        }
    }

    pub fn config(&self) -> &BotConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn stats(&self) -> EngineStats {
        self.stats.lock().await.clone()
    }

    pub async fn active_positions(&self) -> Vec<TrackedPosition> {
        self.executor.active_positions().await
    }

    pub async fn performance_summary(&self) -> crate::ports::executor::PerformanceSummary {
        self.executor.performance_summary().await
    }

    /// Seed cooldowns from persisted exits; entries outside the window are
    /// dropped.
    pub async fn preload_cooldowns(
        &self,
        entries: impl IntoIterator<Item = (String, DateTime<Utc>)>,
    ) {
        self.cooldowns.lock().await.load(entries);
    }

    /// Start the three recurring tasks. The first scan fires from the
    /// scheduler immediately, so `start` never blocks on market data.
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.send_replace(false);

        // Rebuild throttle state from anything the executor already holds
        let active = self.executor.active_positions().await;
        if !active.is_empty() {
            self.breaker.lock().await.sync_with(&active);
        }

        {
            let mut stats = self.stats.lock().await;
            stats.started_at = Utc::now();
        }

        self.emit(BotEventKind::EngineStarted);

        let mut tasks = self.tasks.lock().await;

        let engine = Arc::clone(self);
        let mut rx = self.shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(engine.config.scan_interval_secs));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => { engine.scan_once().await; }
                    _ = rx.changed() => break,
                }
            }
        }));

        let engine = Arc::clone(self);
        let mut rx = self.shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(
                engine.config.position_check_interval_secs,
            ));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => { engine.check_positions_once().await; }
                    _ = rx.changed() => break,
                }
            }
        }));

        let engine = Arc::clone(self);
        let mut rx = self.shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CHECKPOINT_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => { engine.checkpoint_once().await; }
                    _ = rx.changed() => break,
                }
            }
        }));

        tracing::info!(bot_id = %self.config.bot_id, "Engine started");
    }

    /// Cooperative stop: signal the tasks, wait for in-flight bodies to
    /// finish, run one final checkpoint, emit `engine:stopped`. Idempotent.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown.send_replace(true);

        let handles: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }

        self.checkpoint_once().await;

        let stats = self.stats.lock().await.clone();
        self.emit(BotEventKind::EngineStopped { stats });
        tracing::info!(bot_id = %self.config.bot_id, "Engine stopped");
    }

    /// One scan pass. Overlapping ticks are dropped, not queued.
    pub async fn scan_once(&self) {
        if self
            .scanning
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!(bot_id = %self.config.bot_id, "Scan already in progress, tick dropped");
            return;
        }
        self.scan_body().await;
        self.scanning.store(false, Ordering::SeqCst);
    }

    async fn scan_body(&self) {
        self.stats.lock().await.total_scans += 1;

        let decision = self.emergency.lock().await.can_trade();
        if !decision.allowed {
            let message = format!(
                "Emergency stop: {}",
                decision.reason.unwrap_or_else(|| "trading halted".to_string())
            );
            tracing::warn!(bot_id = %self.config.bot_id, %message, "Scan blocked");
            self.emit(BotEventKind::EngineError { message });
            return;
        }

        let active = self.executor.active_positions().await;
        if active.len() >= self.config.max_concurrent_positions {
            return;
        }
        let slots = self.config.max_concurrent_positions - active.len();

        let balance = self.executor.balance().await;
        if balance < self.config.min_position_lamports() {
            tracing::debug!(
                bot_id = %self.config.bot_id,
                balance,
                "Balance below minimum position size, skipping scan"
            );
            return;
        }

        let pools = match self.provider.list_eligible_pools(&self.config).await {
            Ok(pools) => pools,
            Err(e) => {
                tracing::warn!(bot_id = %self.config.bot_id, error = %e, "Eligible pool fetch failed");
                self.emergency.lock().await.record_api_error();
                self.emit(BotEventKind::EngineError {
                    message: format!("Pool fetch failed: {}", e),
                });
                return;
            }
        };

        let held: Vec<String> = active.iter().map(|p| p.pool_address.clone()).collect();
        let pools: Vec<PoolInfo> = {
            let mut cooldowns = self.cooldowns.lock().await;
            let now = Utc::now();
            cooldowns.prune(now);
            pools
                .into_iter()
                .filter(|p| !cooldowns.is_cooling_at(&p.address, now))
                .filter(|p| !held.contains(&p.address))
                .collect()
        };
        let eligible = pools.len();

        let candidates = self.select_candidates(pools, slots).await;

        let mut entered = 0usize;
        let total = candidates.len();
        for (i, candidate) in candidates.into_iter().enumerate() {
            if self.try_enter(&candidate).await {
                entered += 1;
            }
            if i + 1 < total {
                tokio::time::sleep(INTER_ENTRY_DELAY).await;
            }
        }

        self.emit(BotEventKind::ScanCompleted { eligible, entered });
    }

    /// Rank candidates under the configured strategy, capped at the free
    /// position slots.
    async fn select_candidates(&self, pools: Vec<PoolInfo>, slots: usize) -> Vec<Candidate> {
        match self.config.strategy_mode {
            StrategyMode::RuleBased => self.rule_candidates(pools, slots),
            StrategyMode::Ml => self.ml_candidates(pools, slots).await,
            StrategyMode::Hybrid => self.hybrid_candidates(pools, slots).await,
        }
    }

    /// Score everything, admit above the threshold, best first
    fn rule_candidates(&self, pools: Vec<PoolInfo>, limit: usize) -> Vec<Candidate> {
        let mut candidates: Vec<Candidate> = pools
            .into_iter()
            .map(|pool| {
                let score = self.provider.score(&pool);
                Candidate {
                    pool,
                    score: score.total,
                    ml_probability: None,
                }
            })
            .filter(|c| c.score >= self.config.entry_score_threshold)
            .collect();

        candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
        candidates.truncate(limit);
        candidates
    }

    /// Top pools by raw 1h volume go to the model; admission by the
    /// model's own threshold. Unavailable model means rule-based.
    async fn ml_candidates(&self, pools: Vec<PoolInfo>, slots: usize) -> Vec<Candidate> {
        let Some(predictor) = &self.predictor else {
            return self.rule_candidates(pools, slots);
        };

        let mut pools = pools;
        pools.sort_by(|a, b| b.volume_1h.total_cmp(&a.volume_1h));
        pools.truncate(ML_PREFILTER_LIMIT);

        let features: Vec<EntryFeatures> =
            pools.iter().map(EntryFeatures::from_pool).collect();
        let addresses: Vec<String> = pools.iter().map(|p| p.address.clone()).collect();

        match predictor.predict(&features, &addresses).await {
            Some(batch) => {
                let threshold = batch.threshold;
                let mut candidates: Vec<Candidate> = pools
                    .into_iter()
                    .zip(batch.predictions)
                    .filter(|(_, prediction)| prediction.probability >= threshold)
                    .map(|(pool, prediction)| {
                        let score = self.provider.score(&pool).total;
                        Candidate {
                            pool,
                            score,
                            ml_probability: Some(prediction.probability),
                        }
                    })
                    .collect();
                candidates.sort_by(|a, b| {
                    b.ml_probability
                        .unwrap_or(0.0)
                        .total_cmp(&a.ml_probability.unwrap_or(0.0))
                });
                candidates.truncate(slots);
                candidates
            }
            None => {
                tracing::warn!(
                    bot_id = %self.config.bot_id,
                    "Predictor unavailable, falling back to rule-based scoring"
                );
                self.rule_candidates(pools, slots)
            }
        }
    }

    /// Rule-based filter first; the model must also recommend entry. An
    /// unavailable model passes the rule-based leaders straight through.
    async fn hybrid_candidates(&self, pools: Vec<PoolInfo>, slots: usize) -> Vec<Candidate> {
        let ranked = self.rule_candidates(pools, HYBRID_CANDIDATE_LIMIT);
        let Some(predictor) = &self.predictor else {
            let mut top = ranked;
            top.truncate(slots);
            return top;
        };

        let features: Vec<EntryFeatures> =
            ranked.iter().map(|c| EntryFeatures::from_pool(&c.pool)).collect();
        let addresses: Vec<String> = ranked.iter().map(|c| c.pool.address.clone()).collect();

        match predictor.predict(&features, &addresses).await {
            Some(batch) => {
                let mut candidates: Vec<Candidate> = ranked
                    .into_iter()
                    .zip(batch.predictions)
                    .filter(|(_, prediction)| prediction.recommends_entry())
                    .map(|(mut candidate, prediction)| {
                        candidate.ml_probability = Some(prediction.probability);
                        candidate
                    })
                    .collect();
                candidates.sort_by(|a, b| {
                    b.ml_probability
                        .unwrap_or(0.0)
                        .total_cmp(&a.ml_probability.unwrap_or(0.0))
                });
                candidates.truncate(slots);
                candidates
            }
            None => {
                tracing::warn!(
                    bot_id = %self.config.bot_id,
                    "Predictor unavailable, using rule-based leaders directly"
                );
                let mut top = ranked;
                top.truncate(slots);
                top
            }
        }
    }

    /// Attempt one entry. Both safety gates are re-checked immediately
    /// before the executor call; a denial skips the candidate quietly.
    async fn try_enter(&self, candidate: &Candidate) -> bool {
        let pool = &candidate.pool;

        let balance = self.executor.balance().await;
        let size = self
            .config
            .position_size_lamports(balance)
            .min(balance.saturating_sub(RENT_RESERVE_LAMPORTS));
        if size < self.config.min_position_lamports() {
            tracing::debug!(bot_id = %self.config.bot_id, pool = %pool.address, "Sized below minimum, skipping");
            return false;
        }

        if !self.emergency.lock().await.can_trade().allowed {
            return false;
        }
        {
            let mut breaker = self.breaker.lock().await;
            let decision = breaker.can_open(&pool.address, size);
            if !decision.allowed {
                tracing::debug!(
                    bot_id = %self.config.bot_id,
                    pool = %pool.address,
                    reason = decision.reason.as_deref().unwrap_or(""),
                    "Circuit breaker denied entry"
                );
                return false;
            }
        }

        let bin = match self.provider.active_bin(pool).await {
            Ok(bin) => bin,
            Err(e) => {
                tracing::warn!(pool = %pool.address, error = %e, "Active bin unavailable");
                self.emergency.lock().await.record_api_error();
                return false;
            }
        };

        let amount_x = size / 2;
        let amount_y = size - amount_x;
        let request = OpenRequest {
            range: BinRange::around(bin.bin_id, self.config.default_bin_range),
            amount_x,
            amount_y,
            risk: RiskSnapshot {
                profit_target_pct: self.config.profit_target_pct,
                stop_loss_pct: self.config.stop_loss_pct,
                max_hold_minutes: self.config.max_hold_minutes,
                trailing_stop_enabled: self.config.trailing_stop_enabled,
                trailing_stop_pct: self.config.trailing_stop_pct,
            },
        };

        match self.executor.open(pool, request).await {
            Ok(receipt) => {
                self.breaker
                    .lock()
                    .await
                    .record_position_opened(&pool.address, size);
                self.stats.lock().await.positions_opened += 1;

                let position = self
                    .executor
                    .annotate_entry(
                        &receipt.position_id,
                        candidate.score,
                        candidate.ml_probability,
                        EntryFeatures::from_pool(pool),
                    )
                    .await
                    .unwrap_or(receipt.position);

                self.emit(BotEventKind::PositionOpened { position });
                true
            }
            Err(e) => {
                tracing::warn!(
                    bot_id = %self.config.bot_id,
                    pool = %pool.address,
                    error = %e,
                    "Entry failed"
                );
                false
            }
        }
    }

    /// One position-check pass over every active position
    pub async fn check_positions_once(&self) {
        for position in self.executor.active_positions().await {
            match self.executor.update(&position.id).await {
                Ok(Some(updated)) => {
                    self.emit(BotEventKind::PositionUpdated {
                        position: updated.clone(),
                    });
                    if let Some(reason) = Self::evaluate_exit(&updated, Utc::now()) {
                        if let Err(e) = self.close_position(&updated.id, reason).await {
                            tracing::warn!(
                                position = %updated.id,
                                reason = reason.as_str(),
                                error = %e,
                                "Exit failed, will retry next check"
                            );
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(position = %position.id, error = %e, "Position update failed");
                    self.emergency.lock().await.record_api_error();
                }
            }
        }
    }

    /// Exit decision order: take-profit, trailing stop, stop-loss, max
    /// hold.
    fn evaluate_exit(position: &TrackedPosition, now: DateTime<Utc>) -> Option<ExitReason> {
        let pnl = position.pnl_pct();

        if pnl >= position.profit_target_pct {
            return Some(ExitReason::TakeProfit);
        }

        if position.trailing_stop_enabled
            && position.high_water_mark_pct > position.trailing_stop_pct
            && pnl <= position.high_water_mark_pct - position.trailing_stop_pct
            && pnl < position.high_water_mark_pct
        {
            return Some(ExitReason::TrailingStop);
        }

        if pnl <= -position.stop_loss_pct {
            return Some(ExitReason::StopLoss);
        }

        if position.hold_minutes(now) >= position.max_hold_minutes {
            return Some(ExitReason::MaxHoldTime);
        }

        None
    }

    /// Close with full side effects: stats, safety recorders, cooldown,
    /// event.
    async fn close_position(
        &self,
        position_id: &str,
        reason: ExitReason,
    ) -> Result<CloseReceipt, ExecutorError> {
        let receipt = self.executor.close(position_id, reason).await?;
        let pnl = receipt.realized_pnl_sol;

        {
            let mut stats = self.stats.lock().await;
            stats.positions_closed += 1;
            if pnl > 0.0 {
                stats.wins += 1;
            } else {
                stats.losses += 1;
            }
            stats.realized_pnl_sol += pnl;
        }

        self.emergency.lock().await.record_trade_result(pnl);
        self.breaker.lock().await.record_position_closed(
            &receipt.position.pool_address,
            receipt.position.entry_value_lamports(),
        );
        self.cooldowns
            .lock()
            .await
            .record_exit(&receipt.position.pool_address);

        self.emit(BotEventKind::PositionClosed {
            position: receipt.position.clone(),
        });

        Ok(receipt)
    }

    /// User- or orchestrator-initiated close, mirroring every side effect
    /// of an engine-initiated one.
    pub async fn close_by_id(
        &self,
        position_id: &str,
        reason: ExitReason,
    ) -> Result<CloseReceipt, ExecutorError> {
        if self.executor.position(position_id).await.is_none() {
            return Err(ExecutorError::PositionNotFound(position_id.to_string()));
        }
        self.close_position(position_id, reason).await
    }

    /// Close every active position, reporting how many succeeded
    pub async fn close_all(&self, reason: ExitReason) -> usize {
        let mut closed = 0;
        for position in self.executor.active_positions().await {
            match self.close_position(&position.id, reason).await {
                Ok(_) => closed += 1,
                Err(e) => {
                    tracing::error!(position = %position.id, error = %e, "Close-all failed for position");
                }
            }
        }
        closed
    }

    /// Flush current price and unrealised P&L for every active position
    pub async fn checkpoint_once(&self) {
        for position in self.executor.active_positions().await {
            self.emit(BotEventKind::PositionUpdated { position });
        }
    }

    fn emit(&self, kind: BotEventKind) {
        let event = BotEvent::new(&self.config.bot_id, &self.config.user_id, kind);
        if self.events.send(event).is_err() {
            tracing::debug!(bot_id = %self.config.bot_id, "Event channel closed, dropping event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::position::{ExecutionMode, PositionStatus};

    fn position_with(pnl_price: f64, hwm: f64) -> TrackedPosition {
        TrackedPosition {
            id: "p".to_string(),
            mode: ExecutionMode::Simulation,
            status: PositionStatus::Active,
            pool_address: "pool".to_string(),
            pool_name: "pool".to_string(),
            mint_x: "x".to_string(),
            mint_y: "y".to_string(),
            bin_step: 25,
            entry_active_bin: 0,
            lower_bin: -10,
            upper_bin: 10,
            entry_price: 1.0,
            entry_timestamp: Utc::now(),
            entry_amount_x: 0,
            entry_amount_y: 1_000_000_000,
            entry_tx_signature: "sig".to_string(),
            entry_tx_cost_lamports: 0,
            entry_score: None,
            ml_probability: None,
            entry_features: None,
            profit_target_pct: 5.0,
            stop_loss_pct: 10.0,
            max_hold_minutes: 60,
            trailing_stop_enabled: true,
            trailing_stop_pct: 2.0,
            high_water_mark_pct: hwm,
            current_price: pnl_price,
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
    fn test_take_profit_first() {
        let position = position_with(1.06, 6.0);
        assert_eq!(
            TradingEngine::evaluate_exit(&position, Utc::now()),
            Some(ExitReason::TakeProfit)
        );
    }

    #[test]
    fn test_trailing_stop() {
        // HWM 4%, now at 1.5%: drawdown 2.5% >= trailing 2%
        let position = position_with(1.015, 4.0);
        assert_eq!(
            TradingEngine::evaluate_exit(&position, Utc::now()),
            Some(ExitReason::TrailingStop)
        );
    }

    #[test]
    fn test_trailing_needs_armed_hwm() {
        // HWM 1% has not cleared the 2% trailing distance
        let position = position_with(0.995, 1.0);
        assert_eq!(TradingEngine::evaluate_exit(&position, Utc::now()), None);
    }

    #[test]
    fn test_stop_loss() {
        let position = position_with(0.88, 0.0);
        assert_eq!(
            TradingEngine::evaluate_exit(&position, Utc::now()),
            Some(ExitReason::StopLoss)
        );
    }

    #[test]
    fn test_max_hold() {
        let mut position = position_with(1.0, 0.0);
        position.entry_timestamp = Utc::now() - chrono::Duration::minutes(61);
        assert_eq!(
            TradingEngine::evaluate_exit(&position, Utc::now()),
            Some(ExitReason::MaxHoldTime)
        );
    }

    #[test]
    fn test_hold_within_bounds() {
        let position = position_with(1.01, 1.0);
        assert_eq!(TradingEngine::evaluate_exit(&position, Utc::now()), None);
    }
}
