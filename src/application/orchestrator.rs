//! Bot Orchestrator
//!
//! The process-wide conductor: turns persisted bot rows into running
//! engines, bridges engine events to durable storage and the event bus,
//! serialises start/stop per bot through operation locks, and recovers
//! bots flagged running after a restart.
//!
//! Emergency-stop triggers arrive over a channel per bot; the handler
//! auto-closes every position, stops the engine, marks the bot row
//! `error`, and releases the bot from the running set. No lock inside the
//! emergency stop is ever held across that work.

use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

use crate::adapters::cache::SharedPoolCache;
use crate::adapters::chain::wallet::WalletManager;
use crate::adapters::storage::{BotRow, BotStatus, SqliteStore, StorageError};
use crate::application::event_bus::EventBus;
use crate::domain::bot_config::{BotConfig, BotConfigError};
use crate::domain::circuit_breaker::{CircuitBreaker, CircuitBreakerLimits};
use crate::domain::emergency_stop::{EmergencyStop, EmergencyStopLimits};
use crate::domain::events::{BotEvent, BotEventKind, EngineStats};
use crate::domain::position::{
    ExecutionMode, ExitReason, TrackedPosition, LAMPORTS_PER_SOL,
};
use crate::domain::scoring::MarketScorer;
use crate::engine::engine::TradingEngine;
use crate::engine::executor_live::{LiveExecutor, LiveExecutorConfig};
use crate::engine::executor_sim::SimulationExecutor;
use crate::engine::provider::MarketDataProvider;
use crate::ports::dlmm::{ChainReader, DlmmClient};
use crate::ports::executor::{Executor, PerformanceSummary};
use crate::ports::predictor::Predictor;
use crate::ports::swap::SwapClient;

/// Bots allowed per user
pub const MAX_BOTS_PER_USER: u64 = 10;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Bot already running: {0}")]
    AlreadyRunning(String),

    #[error("Bot not found: {0}")]
    BotNotFound(String),

    #[error("Bot is not running: {0}")]
    NotRunning(String),

    #[error("Position not found: {0}")]
    PositionNotFound(String),

    #[error("Live mode unavailable: {0}")]
    LiveModeUnavailable(String),

    #[error("Bot limit reached ({0} per user)")]
    BotLimitReached(u64),

    #[error("Invalid bot config: {0}")]
    Config(#[from] BotConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Dependencies needed only for live execution
#[derive(Clone)]
pub struct LiveDeps {
    pub dlmm: Arc<dyn DlmmClient>,
    pub chain: Arc<dyn ChainReader>,
    pub swap: Arc<dyn SwapClient>,
    pub wallet: Arc<WalletManager>,
    /// Explicit operator acknowledgement of live trading risk
    pub risk_confirmed: bool,
}

struct RunningBot {
    engine: Arc<TradingEngine>,
    emergency: Arc<Mutex<EmergencyStop>>,
    user_id: String,
}

pub struct BotOrchestrator {
    storage: Arc<SqliteStore>,
    cache: Arc<SharedPoolCache>,
    bus: Arc<EventBus>,
    predictor: Option<Arc<dyn Predictor>>,
    live: Option<LiveDeps>,
    running: Arc<Mutex<HashMap<String, RunningBot>>>,
    op_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl BotOrchestrator {
    pub fn new(
        storage: Arc<SqliteStore>,
        cache: Arc<SharedPoolCache>,
        bus: Arc<EventBus>,
        predictor: Option<Arc<dyn Predictor>>,
        live: Option<LiveDeps>,
    ) -> Arc<Self> {
        Arc::new(Self {
            storage,
            cache,
            bus,
            predictor,
            live,
            running: Arc::new(Mutex::new(HashMap::new())),
            op_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Persist a new bot row. Enforces the per-user cap and journals a
    /// distinct `bot_created` entry.
    pub async fn create_bot(&self, config: BotConfig) -> Result<(), OrchestratorError> {
        config.validate()?;
        let existing = self.storage.count_bots_for_user(&config.user_id).await?;
        if existing >= MAX_BOTS_PER_USER {
            return Err(OrchestratorError::BotLimitReached(MAX_BOTS_PER_USER));
        }

        let row = BotRow::new(config);
        self.storage.insert_bot(&row).await?;
        self.storage
            .append_trade_log(
                &row.bot_id,
                &row.user_id,
                None,
                "bot_created",
                &serde_json::json!({ "name": row.name }),
            )
            .await?;
        Ok(())
    }

    /// Start a bot from its persisted row. Serialised per bot; a second
    /// start while one is in flight waits, then fails on the running
    /// check.
    pub async fn start_bot(&self, bot_id: &str, user_id: &str) -> Result<(), OrchestratorError> {
        let lock = self.op_lock(bot_id).await;
        let _guard = lock.lock().await;

        if self.running.lock().await.contains_key(bot_id) {
            return Err(OrchestratorError::AlreadyRunning(bot_id.to_string()));
        }

        let row = self
            .storage
            .get_bot(bot_id)
            .await?
            .ok_or_else(|| OrchestratorError::BotNotFound(bot_id.to_string()))?;
        let config = row.to_config()?;

        self.storage
            .set_bot_status(bot_id, BotStatus::Starting, None)
            .await?;

        match self.build_and_start(&row, config, user_id).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let message = e.to_string();
                let _ = self
                    .storage
                    .set_bot_status(bot_id, BotStatus::Error, Some(&message))
                    .await;
                Err(e)
            }
        }
    }

    async fn build_and_start(
        &self,
        row: &BotRow,
        config: BotConfig,
        user_id: &str,
    ) -> Result<(), OrchestratorError> {
        let bot_id = config.bot_id.clone();

        let provider = Arc::new(MarketDataProvider::new(
            Arc::clone(&self.cache),
            self.live.as_ref().map(|l| Arc::clone(&l.dlmm)),
            MarketScorer::default(),
        ));

        // Restore persisted emergency-stop state; a malformed blob starts
        // fresh rather than starting less conservative than it should.
        let limits = EmergencyStopLimits {
            max_daily_loss_sol: config.max_daily_loss_sol,
            ..EmergencyStopLimits::default()
        };
        let mut emergency_inner = match row
            .emergency_stop_state
            .as_deref()
            .and_then(EmergencyStop::deserialize)
        {
            Some(state) => {
                tracing::info!(
                    bot_id = %bot_id,
                    total_pnl = state.total_pnl_sol,
                    triggered = state.triggered,
                    "Restored emergency-stop state"
                );
                EmergencyStop::restore(limits, state)
            }
            None => EmergencyStop::new(limits),
        };
        let trigger_rx = emergency_inner.on_trigger();
        let emergency = Arc::new(Mutex::new(emergency_inner));

        let breaker_limits = CircuitBreakerLimits {
            max_open_positions: config.max_concurrent_positions,
            max_position_lamports: (config.max_position_sol * LAMPORTS_PER_SOL) as u64,
            ..CircuitBreakerLimits::default()
        };
        let breaker = Arc::new(Mutex::new(CircuitBreaker::new(breaker_limits)));

        let predictor = if config.strategy_mode.uses_predictor() {
            self.predictor.clone()
        } else {
            None
        };

        let executor: Arc<dyn Executor> = match config.mode {
            ExecutionMode::Simulation => Arc::new(SimulationExecutor::new(
                Arc::clone(&provider),
                (config.sim_initial_balance_sol * LAMPORTS_PER_SOL) as u64,
            )),
            ExecutionMode::Live => {
                let live = self.live.as_ref().ok_or_else(|| {
                    OrchestratorError::LiveModeUnavailable(
                        "no chain dependencies configured".to_string(),
                    )
                })?;
                if !live.risk_confirmed {
                    return Err(OrchestratorError::LiveModeUnavailable(
                        "live trading risk not confirmed".to_string(),
                    ));
                }
                let balance = live
                    .chain
                    .balance_lamports(&live.wallet.public_key())
                    .await
                    .map_err(|e| OrchestratorError::LiveModeUnavailable(e.to_string()))?;
                if balance == 0 {
                    return Err(OrchestratorError::LiveModeUnavailable(
                        "wallet has no balance".to_string(),
                    ));
                }
                Arc::new(LiveExecutor::new(
                    Arc::clone(&provider),
                    Arc::clone(&live.dlmm),
                    Arc::clone(&live.chain),
                    Arc::clone(&live.swap),
                    Arc::clone(&live.wallet),
                    Arc::clone(&emergency),
                    Arc::clone(&breaker),
                    LiveExecutorConfig {
                        min_position_lamports: config.min_position_lamports(),
                    },
                ))
            }
        };

        // Re-adopt positions persisted before the last shutdown so the
        // executor map and the rows agree again.
        match self.storage.active_positions(&bot_id).await {
            Ok(persisted) if !persisted.is_empty() => {
                tracing::info!(bot_id = %bot_id, count = persisted.len(), "Adopting persisted positions");
                executor.adopt(persisted).await;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(bot_id = %bot_id, error = %e, "Persisted position reload failed")
            }
        }

        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<BotEvent>();
        let engine = Arc::new(TradingEngine::new(
            config.clone(),
            executor,
            provider,
            Arc::clone(&emergency),
            Arc::clone(&breaker),
            predictor,
            events_tx,
        ));

        // Cooldowns are rebuilt from recent closed positions
        let since = Utc::now() - Duration::minutes(config.cooldown_minutes);
        match self.storage.recent_exits(&bot_id, since).await {
            Ok(exits) => engine.preload_cooldowns(exits).await,
            Err(e) => {
                tracing::warn!(bot_id = %bot_id, error = %e, "Cooldown reload failed")
            }
        }

        // Persistence bridge: one task per bot, consuming the engine's
        // serial event stream.
        {
            let storage = Arc::clone(&self.storage);
            let bus = Arc::clone(&self.bus);
            let emergency = Arc::clone(&emergency);
            tokio::spawn(async move {
                while let Some(event) = events_rx.recv().await {
                    Self::handle_engine_event(&storage, &bus, &emergency, &event).await;
                }
            });
        }

        // Emergency-trigger handler: auto-close, stop, mark error, release
        {
            let storage = Arc::clone(&self.storage);
            let bus = Arc::clone(&self.bus);
            let engine = Arc::clone(&engine);
            let emergency = Arc::clone(&emergency);
            let running = Arc::clone(&self.running);
            let bot_id = bot_id.clone();
            let user_id = user_id.to_string();
            let mut trigger_rx = trigger_rx;
            tokio::spawn(async move {
                // A trigger is terminal for this run: handle it once, then
                // let the task end so the engine can be dropped.
                if let Some(reason) = trigger_rx.recv().await {
                    let message = format!("Emergency stop: {}", reason);
                    tracing::error!(bot_id = %bot_id, %message, "Auto-closing positions");

                    let closed = engine.close_all(ExitReason::EmergencyStop).await;
                    tracing::info!(bot_id = %bot_id, closed, "Emergency close-all finished");

                    engine.stop().await;

                    let blob = emergency.lock().await.serialize();
                    if let Err(e) = storage.save_emergency_state(&bot_id, &blob).await {
                        tracing::error!(bot_id = %bot_id, error = %e, "Emergency state save failed");
                    }
                    if let Err(e) = storage
                        .set_bot_status(&bot_id, BotStatus::Error, Some(&message))
                        .await
                    {
                        tracing::error!(bot_id = %bot_id, error = %e, "Bot error status save failed");
                    }

                    bus.emit(&BotEvent::new(
                        &bot_id,
                        &user_id,
                        BotEventKind::EngineError {
                            message: message.clone(),
                        },
                    ));

                    running.lock().await.remove(&bot_id);
                }
            });
        }

        // Register and mark running before the first scan can possibly
        // fire, so an instant emergency trigger is never overwritten.
        self.running.lock().await.insert(
            bot_id.clone(),
            RunningBot {
                engine: Arc::clone(&engine),
                emergency,
                user_id: user_id.to_string(),
            },
        );
        self.storage
            .set_bot_status(&bot_id, BotStatus::Running, None)
            .await?;

        engine.start().await;

        Ok(())
    }

    /// Stop a bot. Idempotent: stopping a non-running bot succeeds with
    /// `false`.
    pub async fn stop_bot(&self, bot_id: &str) -> Result<bool, OrchestratorError> {
        let lock = self.op_lock(bot_id).await;
        let _guard = lock.lock().await;

        let (engine, emergency) = {
            let running = self.running.lock().await;
            match running.get(bot_id) {
                Some(bot) => (Arc::clone(&bot.engine), Arc::clone(&bot.emergency)),
                None => return Ok(false),
            }
        };

        self.storage
            .set_bot_status(bot_id, BotStatus::Stopping, None)
            .await
            .ok();

        let blob = emergency.lock().await.serialize();
        if let Err(e) = self.storage.save_emergency_state(bot_id, &blob).await {
            tracing::error!(bot_id, error = %e, "Emergency state save failed on stop");
        }

        engine.stop().await;
        // Close the trigger channel so the per-bot handler task exits
        emergency.lock().await.clear_trigger_listeners();

        self.running.lock().await.remove(bot_id);
        self.storage
            .set_bot_status(bot_id, BotStatus::Stopped, None)
            .await?;
        Ok(true)
    }

    /// Manually trigger a bot's emergency stop; its trigger handler does
    /// the rest.
    pub async fn emergency_stop(&self, bot_id: &str) -> Result<(), OrchestratorError> {
        let running = self.running.lock().await;
        let bot = running
            .get(bot_id)
            .ok_or_else(|| OrchestratorError::NotRunning(bot_id.to_string()))?;
        bot.emergency
            .lock()
            .await
            .manual_trigger("Manually triggered");
        Ok(())
    }

    /// Stop every running bot, waiting for each to settle. Returns how
    /// many were running.
    pub async fn stop_all(&self) -> usize {
        let ids: Vec<String> = self.running.lock().await.keys().cloned().collect();
        let count = ids.len();

        let results =
            futures::future::join_all(ids.iter().map(|id| self.stop_bot(id))).await;
        for (id, result) in ids.iter().zip(results) {
            if let Err(e) = result {
                tracing::error!(bot_id = %id, error = %e, "Stop failed during shutdown");
            }
        }
        count
    }

    /// Restart every bot persisted as running. Failures mark the row
    /// `error` and move on.
    pub async fn recover_running_bots(&self) -> usize {
        let rows = match self.storage.list_bots_with_status(BotStatus::Running).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::error!(error = %e, "Recovery listing failed");
                return 0;
            }
        };

        let mut recovered = 0;
        for row in rows {
            match self.start_bot(&row.bot_id, &row.user_id).await {
                Ok(()) => {
                    tracing::info!(bot_id = %row.bot_id, "Bot recovered");
                    recovered += 1;
                }
                Err(e) => {
                    tracing::error!(bot_id = %row.bot_id, error = %e, "Recovery failed");
                    let _ = self
                        .storage
                        .set_bot_status(
                            &row.bot_id,
                            BotStatus::Error,
                            Some(&format!("Recovery failed: {}", e)),
                        )
                        .await;
                }
            }
        }
        recovered
    }

    /// User-initiated close, routed to whichever engine owns the position
    pub async fn close_position(
        &self,
        position_id: &str,
        reason: ExitReason,
    ) -> Result<(), OrchestratorError> {
        let engines: Vec<Arc<TradingEngine>> = {
            let running = self.running.lock().await;
            running.values().map(|b| Arc::clone(&b.engine)).collect()
        };

        for engine in engines {
            match engine.close_by_id(position_id, reason).await {
                Ok(_) => return Ok(()),
                Err(crate::ports::executor::ExecutorError::PositionNotFound(_)) => continue,
                Err(e) => {
                    tracing::error!(position_id, error = %e, "User-initiated close failed");
                    return Err(OrchestratorError::PositionNotFound(position_id.to_string()));
                }
            }
        }
        Err(OrchestratorError::PositionNotFound(position_id.to_string()))
    }

    pub async fn is_running(&self, bot_id: &str) -> bool {
        self.running.lock().await.contains_key(bot_id)
    }

    pub async fn running_count(&self) -> usize {
        self.running.lock().await.len()
    }

    /// Live telemetry for one bot: engine stats, executor performance,
    /// open positions.
    pub async fn bot_overview(
        &self,
        bot_id: &str,
    ) -> Option<(EngineStats, PerformanceSummary, Vec<TrackedPosition>)> {
        let running = self.running.lock().await;
        let bot = running.get(bot_id)?;
        let stats = bot.engine.stats().await;
        let summary = bot.engine.performance_summary().await;
        let positions = bot.engine.active_positions().await;
        Some((stats, summary, positions))
    }

    async fn op_lock(&self, bot_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.op_locks.lock().await;
        Arc::clone(
            locks
                .entry(bot_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// The persistence bridge. Every write is its own short transaction;
    /// failures are logged and never stop the engine.
    async fn handle_engine_event(
        storage: &SqliteStore,
        bus: &EventBus,
        emergency: &Mutex<EmergencyStop>,
        event: &BotEvent,
    ) {
        match &event.kind {
            BotEventKind::PositionOpened { position } => {
                if let Err(e) = storage
                    .insert_position(&event.bot_id, &event.user_id, position)
                    .await
                {
                    tracing::error!(position = %position.id, error = %e, "Position insert failed");
                }
                let details = serde_json::json!({
                    "pool_address": position.pool_address,
                    "pool_name": position.pool_name,
                    "entry_amount_lamports": position.entry_value_lamports(),
                    "score": position.entry_score,
                    "ml_probability": position.ml_probability,
                });
                Self::journal(storage, event, Some(&position.id), &details).await;
                let _ = storage.touch_activity(&event.bot_id).await;
                bus.emit(event);
            }
            BotEventKind::PositionClosed { position } => {
                if let Err(e) = storage.update_position_exit(position).await {
                    tracing::error!(position = %position.id, error = %e, "Position exit update failed");
                }
                let pnl_sol = position.realized_pnl_sol.unwrap_or(0.0);
                let pnl_lamports = (pnl_sol * LAMPORTS_PER_SOL).round() as i64;
                if let Err(e) = storage
                    .apply_trade_stats(&event.bot_id, pnl_sol > 0.0, pnl_lamports)
                    .await
                {
                    tracing::error!(bot_id = %event.bot_id, error = %e, "Trade stats update failed");
                }
                let details = serde_json::json!({
                    "pool_address": position.pool_address,
                    "reason": position.exit_reason.map(|r| r.as_str()),
                    "realized_pnl_sol": pnl_sol,
                    "result": if pnl_sol > 0.0 { "WIN" } else { "LOSS" },
                });
                Self::journal(storage, event, Some(&position.id), &details).await;
                bus.emit(event);

                // The engine has already recorded the trade result; the
                // accumulated state is durable from this point.
                let blob = emergency.lock().await.serialize();
                if let Err(e) = storage.save_emergency_state(&event.bot_id, &blob).await {
                    tracing::error!(bot_id = %event.bot_id, error = %e, "Emergency state save failed");
                }
            }
            BotEventKind::PositionUpdated { position } => {
                if let Some(unrealized) = position.unrealized_pnl_lamports() {
                    if let Err(e) = storage
                        .update_position_checkpoint(
                            &position.id,
                            position.current_price,
                            unrealized,
                        )
                        .await
                    {
                        tracing::debug!(position = %position.id, error = %e, "Checkpoint patch failed");
                    }
                }
            }
            BotEventKind::ScanCompleted { eligible, entered } => {
                let _ = storage.touch_activity(&event.bot_id).await;
                if *entered > 0 {
                    let details = serde_json::json!({
                        "eligible": eligible,
                        "entered": entered,
                    });
                    Self::journal(storage, event, None, &details).await;
                    bus.emit(event);
                }
            }
            BotEventKind::EngineStarted => {
                Self::journal(storage, event, None, &serde_json::json!({})).await;
                bus.emit(event);
            }
            BotEventKind::EngineStopped { stats } => {
                let details = serde_json::json!({
                    "total_scans": stats.total_scans,
                    "positions_opened": stats.positions_opened,
                    "positions_closed": stats.positions_closed,
                    "realized_pnl_sol": stats.realized_pnl_sol,
                });
                Self::journal(storage, event, None, &details).await;
                bus.emit(event);
            }
            BotEventKind::EngineError { message } => {
                if let Err(e) = storage.set_bot_error_message(&event.bot_id, message).await {
                    tracing::error!(bot_id = %event.bot_id, error = %e, "Error message save failed");
                }
                Self::journal(
                    storage,
                    event,
                    None,
                    &serde_json::json!({ "message": message }),
                )
                .await;
                bus.emit(event);
            }
        }
    }

    async fn journal(
        storage: &SqliteStore,
        event: &BotEvent,
        position_id: Option<&str>,
        details: &serde_json::Value,
    ) {
        if let Some(kind) = event.kind.trade_log_kind() {
            if let Err(e) = storage
                .append_trade_log(&event.bot_id, &event.user_id, position_id, kind, details)
                .await
            {
                tracing::error!(bot_id = %event.bot_id, kind, error = %e, "Trade log append failed");
            }
        }
    }
}
