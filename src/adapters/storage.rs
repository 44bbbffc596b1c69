//! SQLite Persistence
//!
//! Durable state for bots, positions and the trade journal. WAL journal
//! mode with foreign keys on; every write is one short statement so the
//! single writer never blocks long. Connection sits behind an async mutex
//! and is shared by the orchestrator's persistence bridge tasks.

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::domain::bot_config::{BotConfig, BotConfigError, StrategyMode};
use crate::domain::position::{
    EntryFeatures, ExecutionMode, ExitReason, PositionStatus, TrackedPosition,
};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("Bot not found: {0}")]
    BotNotFound(String),

    #[error("Position not found: {0}")]
    PositionNotFound(String),

    #[error("Row decode failed: {0}")]
    Decode(String),
}

/// Bot lifecycle status as persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BotStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl BotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BotStatus::Stopped => "stopped",
            BotStatus::Starting => "starting",
            BotStatus::Running => "running",
            BotStatus::Stopping => "stopping",
            BotStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stopped" => Some(BotStatus::Stopped),
            "starting" => Some(BotStatus::Starting),
            "running" => Some(BotStatus::Running),
            "stopping" => Some(BotStatus::Stopping),
            "error" => Some(BotStatus::Error),
            _ => None,
        }
    }
}

/// One persisted bot row
#[derive(Debug, Clone)]
pub struct BotRow {
    pub bot_id: String,
    pub user_id: String,
    pub name: String,
    pub status: BotStatus,
    pub config: BotConfig,
    pub total_trades: u64,
    pub winning_trades: u64,
    pub total_pnl_lamports: i64,
    pub last_error: Option<String>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub emergency_stop_state: Option<String>,
}

impl BotRow {
    pub fn new(config: BotConfig) -> Self {
        Self {
            bot_id: config.bot_id.clone(),
            user_id: config.user_id.clone(),
            name: config.name.clone(),
            status: BotStatus::Stopped,
            config,
            total_trades: 0,
            winning_trades: 0,
            total_pnl_lamports: 0,
            last_error: None,
            last_activity_at: None,
            emergency_stop_state: None,
        }
    }

    pub fn to_config(&self) -> Result<BotConfig, BotConfigError> {
        let config = self.config.clone();
        config.validate()?;
        Ok(config)
    }
}

fn ts(dt: DateTime<Utc>) -> i64 {
    dt.timestamp()
}

fn from_ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now)
}

pub struct SqliteStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let conn = Connection::open(path.as_ref())?;
        let store = Self::from_connection(conn)?;
        tracing::info!(path = %path.as_ref().display(), "Storage opened");
        Ok(store)
    }

    /// In-memory database for tests
    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StorageError> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Self::init_schema(&conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(db: &Connection) -> Result<(), StorageError> {
        db.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                wallet_address TEXT NOT NULL UNIQUE,
                sentinel_wallet_address TEXT,
                auth_nonce TEXT,
                auth_nonce_expires_at INTEGER,
                refresh_token_hash TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS bots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                bot_id TEXT NOT NULL UNIQUE,
                user_id TEXT NOT NULL,
                name TEXT NOT NULL,
                mode TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'stopped',
                strategy_mode TEXT NOT NULL,
                entry_score_threshold REAL NOT NULL,
                min_liquidity_usd REAL NOT NULL,
                max_liquidity_usd REAL NOT NULL,
                min_volume_24h_usd REAL NOT NULL,
                sol_pairs_only INTEGER NOT NULL,
                mint_blacklist TEXT NOT NULL DEFAULT '[]',
                position_size_sol REAL,
                position_size_percent REAL,
                min_position_sol REAL NOT NULL,
                max_position_sol REAL NOT NULL,
                default_bin_range INTEGER NOT NULL,
                max_concurrent_positions INTEGER NOT NULL,
                profit_target_pct REAL NOT NULL,
                stop_loss_pct REAL NOT NULL,
                trailing_stop_enabled INTEGER NOT NULL,
                trailing_stop_pct REAL NOT NULL,
                max_hold_minutes INTEGER NOT NULL,
                max_daily_loss_sol REAL NOT NULL,
                cooldown_minutes INTEGER NOT NULL,
                scan_interval_secs INTEGER NOT NULL,
                position_check_interval_secs INTEGER NOT NULL,
                sim_initial_balance_sol REAL NOT NULL,
                total_trades INTEGER NOT NULL DEFAULT 0,
                winning_trades INTEGER NOT NULL DEFAULT 0,
                total_pnl_lamports INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                last_activity_at INTEGER,
                emergency_stop_state TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS positions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                position_id TEXT NOT NULL UNIQUE,
                bot_id TEXT NOT NULL REFERENCES bots(bot_id) ON DELETE CASCADE,
                user_id TEXT NOT NULL,
                status TEXT NOT NULL,
                mode TEXT NOT NULL,
                pool_address TEXT NOT NULL,
                pool_name TEXT NOT NULL,
                mint_x TEXT NOT NULL,
                mint_y TEXT NOT NULL,
                bin_step INTEGER NOT NULL,
                entry_active_bin INTEGER NOT NULL,
                lower_bin INTEGER NOT NULL,
                upper_bin INTEGER NOT NULL,
                entry_price REAL NOT NULL,
                entry_timestamp INTEGER NOT NULL,
                entry_amount_x INTEGER NOT NULL,
                entry_amount_y INTEGER NOT NULL,
                entry_tx_signature TEXT NOT NULL,
                entry_tx_cost_lamports INTEGER NOT NULL,
                entry_score REAL,
                ml_probability REAL,
                entry_features TEXT,
                profit_target_pct REAL NOT NULL,
                stop_loss_pct REAL NOT NULL,
                max_hold_minutes INTEGER NOT NULL,
                trailing_stop_enabled INTEGER NOT NULL,
                trailing_stop_pct REAL NOT NULL,
                high_water_mark_pct REAL NOT NULL DEFAULT 0,
                current_price_per_token REAL,
                unrealized_pnl_lamports INTEGER,
                fees_earned_x INTEGER NOT NULL DEFAULT 0,
                fees_earned_y INTEGER NOT NULL DEFAULT 0,
                exit_price REAL,
                exit_timestamp INTEGER,
                exit_tx_signature TEXT,
                exit_reason TEXT,
                realized_pnl_sol REAL,
                exit_tx_cost_lamports INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS trade_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                bot_id TEXT NOT NULL REFERENCES bots(bot_id) ON DELETE CASCADE,
                user_id TEXT NOT NULL,
                position_id TEXT,
                event TEXT NOT NULL,
                details TEXT NOT NULL,
                timestamp INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS strategy_presets (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT,
                name TEXT NOT NULL,
                description TEXT,
                is_system INTEGER NOT NULL DEFAULT 0,
                config TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_positions_bot ON positions(bot_id);
            CREATE INDEX IF NOT EXISTS idx_positions_status ON positions(status);
            CREATE INDEX IF NOT EXISTS idx_trade_log_bot ON trade_log(bot_id);
            CREATE INDEX IF NOT EXISTS idx_bots_status ON bots(status);
            "#,
        )?;
        Ok(())
    }

    // =========================================================================
    // Bots
    // =========================================================================

    pub async fn insert_bot(&self, row: &BotRow) -> Result<(), StorageError> {
        let db = self.db.lock().await;
        let now = ts(Utc::now());
        let c = &row.config;
        db.execute(
            r#"
            INSERT INTO bots (
                bot_id, user_id, name, mode, status, strategy_mode,
                entry_score_threshold, min_liquidity_usd, max_liquidity_usd,
                min_volume_24h_usd, sol_pairs_only, mint_blacklist,
                position_size_sol, position_size_percent, min_position_sol,
                max_position_sol, default_bin_range, max_concurrent_positions,
                profit_target_pct, stop_loss_pct, trailing_stop_enabled,
                trailing_stop_pct, max_hold_minutes, max_daily_loss_sol,
                cooldown_minutes, scan_interval_secs, position_check_interval_secs,
                sim_initial_balance_sol, total_trades, winning_trades,
                total_pnl_lamports, last_error, emergency_stop_state,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                      ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24,
                      ?25, ?26, ?27, ?28, ?29, ?30, ?31, ?32, ?33, ?34, ?35)
            "#,
            params![
                row.bot_id,
                row.user_id,
                row.name,
                c.mode.as_str(),
                row.status.as_str(),
                c.strategy_mode.as_str(),
                c.entry_score_threshold,
                c.min_liquidity_usd,
                c.max_liquidity_usd,
                c.min_volume_24h_usd,
                c.sol_pairs_only as i64,
                serde_json::to_string(&c.mint_blacklist).unwrap_or_else(|_| "[]".into()),
                c.position_size_sol,
                c.position_size_percent,
                c.min_position_sol,
                c.max_position_sol,
                c.default_bin_range,
                c.max_concurrent_positions as i64,
                c.profit_target_pct,
                c.stop_loss_pct,
                c.trailing_stop_enabled as i64,
                c.trailing_stop_pct,
                c.max_hold_minutes,
                c.max_daily_loss_sol,
                c.cooldown_minutes,
                c.scan_interval_secs as i64,
                c.position_check_interval_secs as i64,
                c.sim_initial_balance_sol,
                row.total_trades as i64,
                row.winning_trades as i64,
                row.total_pnl_lamports,
                row.last_error,
                row.emergency_stop_state,
                now,
                now,
            ],
        )?;
        Ok(())
    }

    pub async fn get_bot(&self, bot_id: &str) -> Result<Option<BotRow>, StorageError> {
        let db = self.db.lock().await;
        let row = db
            .query_row(
                "SELECT * FROM bots WHERE bot_id = ?1",
                params![bot_id],
                Self::map_bot_row,
            )
            .optional()?;
        Ok(row)
    }

    pub async fn list_bots_with_status(
        &self,
        status: BotStatus,
    ) -> Result<Vec<BotRow>, StorageError> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare("SELECT * FROM bots WHERE status = ?1")?;
        let rows = stmt
            .query_map(params![status.as_str()], Self::map_bot_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub async fn list_bots_for_user(&self, user_id: &str) -> Result<Vec<BotRow>, StorageError> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare("SELECT * FROM bots WHERE user_id = ?1 ORDER BY id")?;
        let rows = stmt
            .query_map(params![user_id], Self::map_bot_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub async fn set_bot_status(
        &self,
        bot_id: &str,
        status: BotStatus,
        last_error: Option<&str>,
    ) -> Result<(), StorageError> {
        let db = self.db.lock().await;
        let changed = match last_error {
            Some(err) => db.execute(
                "UPDATE bots SET status = ?1, last_error = ?2, updated_at = ?3 WHERE bot_id = ?4",
                params![status.as_str(), err, ts(Utc::now()), bot_id],
            )?,
            None => db.execute(
                "UPDATE bots SET status = ?1, updated_at = ?2 WHERE bot_id = ?3",
                params![status.as_str(), ts(Utc::now()), bot_id],
            )?,
        };
        if changed == 0 {
            return Err(StorageError::BotNotFound(bot_id.to_string()));
        }
        Ok(())
    }

    pub async fn set_bot_error_message(
        &self,
        bot_id: &str,
        message: &str,
    ) -> Result<(), StorageError> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE bots SET last_error = ?1, updated_at = ?2 WHERE bot_id = ?3",
            params![message, ts(Utc::now()), bot_id],
        )?;
        Ok(())
    }

    pub async fn save_emergency_state(
        &self,
        bot_id: &str,
        blob: &str,
    ) -> Result<(), StorageError> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE bots SET emergency_stop_state = ?1, updated_at = ?2 WHERE bot_id = ?3",
            params![blob, ts(Utc::now()), bot_id],
        )?;
        Ok(())
    }

    pub async fn touch_activity(&self, bot_id: &str) -> Result<(), StorageError> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE bots SET last_activity_at = ?1 WHERE bot_id = ?2",
            params![ts(Utc::now()), bot_id],
        )?;
        Ok(())
    }

    /// Atomic stats bump on close: one trade, optional win, realised P&L
    pub async fn apply_trade_stats(
        &self,
        bot_id: &str,
        is_win: bool,
        pnl_lamports: i64,
    ) -> Result<(), StorageError> {
        let db = self.db.lock().await;
        db.execute(
            r#"
            UPDATE bots SET
                total_trades = total_trades + 1,
                winning_trades = winning_trades + ?1,
                total_pnl_lamports = total_pnl_lamports + ?2,
                updated_at = ?3
            WHERE bot_id = ?4
            "#,
            params![is_win as i64, pnl_lamports, ts(Utc::now()), bot_id],
        )?;
        Ok(())
    }

    /// Delete a bot and cascade its positions and trade log
    pub async fn delete_bot(&self, bot_id: &str) -> Result<(), StorageError> {
        let db = self.db.lock().await;
        let changed = db.execute("DELETE FROM bots WHERE bot_id = ?1", params![bot_id])?;
        if changed == 0 {
            return Err(StorageError::BotNotFound(bot_id.to_string()));
        }
        Ok(())
    }

    pub async fn count_bots_for_user(&self, user_id: &str) -> Result<u64, StorageError> {
        let db = self.db.lock().await;
        let count: i64 = db.query_row(
            "SELECT COUNT(*) FROM bots WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn map_bot_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<BotRow> {
        let mode_str: String = row.get("mode")?;
        let strategy_str: String = row.get("strategy_mode")?;
        let status_str: String = row.get("status")?;
        let blacklist_json: String = row.get("mint_blacklist")?;

        let config = BotConfig {
            bot_id: row.get("bot_id")?,
            user_id: row.get("user_id")?,
            name: row.get("name")?,
            mode: ExecutionMode::parse(&mode_str).unwrap_or(ExecutionMode::Simulation),
            strategy_mode: StrategyMode::parse(&strategy_str)
                .unwrap_or(StrategyMode::RuleBased),
            entry_score_threshold: row.get("entry_score_threshold")?,
            min_liquidity_usd: row.get("min_liquidity_usd")?,
            max_liquidity_usd: row.get("max_liquidity_usd")?,
            min_volume_24h_usd: row.get("min_volume_24h_usd")?,
            sol_pairs_only: row.get::<_, i64>("sol_pairs_only")? != 0,
            mint_blacklist: serde_json::from_str(&blacklist_json).unwrap_or_default(),
            position_size_sol: row.get("position_size_sol")?,
            position_size_percent: row.get("position_size_percent")?,
            min_position_sol: row.get("min_position_sol")?,
            max_position_sol: row.get("max_position_sol")?,
            default_bin_range: row.get("default_bin_range")?,
            max_concurrent_positions: row.get::<_, i64>("max_concurrent_positions")? as usize,
            profit_target_pct: row.get("profit_target_pct")?,
            stop_loss_pct: row.get("stop_loss_pct")?,
            trailing_stop_enabled: row.get::<_, i64>("trailing_stop_enabled")? != 0,
            trailing_stop_pct: row.get("trailing_stop_pct")?,
            max_hold_minutes: row.get("max_hold_minutes")?,
            max_daily_loss_sol: row.get("max_daily_loss_sol")?,
            cooldown_minutes: row.get("cooldown_minutes")?,
            scan_interval_secs: row.get::<_, i64>("scan_interval_secs")? as u64,
            position_check_interval_secs: row.get::<_, i64>("position_check_interval_secs")?
                as u64,
            sim_initial_balance_sol: row.get("sim_initial_balance_sol")?,
        };

        Ok(BotRow {
            bot_id: config.bot_id.clone(),
            user_id: config.user_id.clone(),
            name: config.name.clone(),
            status: BotStatus::parse(&status_str).unwrap_or(BotStatus::Stopped),
            config,
            total_trades: row.get::<_, i64>("total_trades")? as u64,
            winning_trades: row.get::<_, i64>("winning_trades")? as u64,
            total_pnl_lamports: row.get("total_pnl_lamports")?,
            last_error: row.get("last_error")?,
            last_activity_at: row
                .get::<_, Option<i64>>("last_activity_at")?
                .map(from_ts),
            emergency_stop_state: row.get("emergency_stop_state")?,
        })
    }

    // =========================================================================
    // Positions
    // =========================================================================

    pub async fn insert_position(
        &self,
        bot_id: &str,
        user_id: &str,
        position: &TrackedPosition,
    ) -> Result<(), StorageError> {
        let db = self.db.lock().await;
        let now = ts(Utc::now());
        let features_json = position
            .entry_features
            .as_ref()
            .and_then(|f| serde_json::to_string(f).ok());
        db.execute(
            r#"
            INSERT INTO positions (
                position_id, bot_id, user_id, status, mode,
                pool_address, pool_name, mint_x, mint_y, bin_step,
                entry_active_bin, lower_bin, upper_bin, entry_price,
                entry_timestamp, entry_amount_x, entry_amount_y,
                entry_tx_signature, entry_tx_cost_lamports, entry_score,
                ml_probability, entry_features, profit_target_pct,
                stop_loss_pct, max_hold_minutes, trailing_stop_enabled,
                trailing_stop_pct, high_water_mark_pct,
                current_price_per_token, fees_earned_x, fees_earned_y,
                exit_tx_cost_lamports, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                      ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24,
                      ?25, ?26, ?27, ?28, ?29, ?30, ?31, ?32, ?33, ?34)
            "#,
            params![
                position.id,
                bot_id,
                user_id,
                position.status.as_str(),
                position.mode.as_str(),
                position.pool_address,
                position.pool_name,
                position.mint_x,
                position.mint_y,
                position.bin_step,
                position.entry_active_bin,
                position.lower_bin,
                position.upper_bin,
                position.entry_price,
                ts(position.entry_timestamp),
                position.entry_amount_x as i64,
                position.entry_amount_y as i64,
                position.entry_tx_signature,
                position.entry_tx_cost_lamports as i64,
                position.entry_score,
                position.ml_probability,
                features_json,
                position.profit_target_pct,
                position.stop_loss_pct,
                position.max_hold_minutes,
                position.trailing_stop_enabled as i64,
                position.trailing_stop_pct,
                position.high_water_mark_pct,
                position.current_price,
                position.fees_earned_x as i64,
                position.fees_earned_y as i64,
                position.exit_tx_cost_lamports as i64,
                now,
                now,
            ],
        )?;
        Ok(())
    }

    pub async fn update_position_exit(
        &self,
        position: &TrackedPosition,
    ) -> Result<(), StorageError> {
        let db = self.db.lock().await;
        let changed = db.execute(
            r#"
            UPDATE positions SET
                status = ?1,
                exit_price = ?2,
                exit_timestamp = ?3,
                exit_tx_signature = ?4,
                exit_reason = ?5,
                realized_pnl_sol = ?6,
                exit_tx_cost_lamports = ?7,
                fees_earned_x = ?8,
                fees_earned_y = ?9,
                high_water_mark_pct = ?10,
                updated_at = ?11
            WHERE position_id = ?12
            "#,
            params![
                position.status.as_str(),
                position.exit_price,
                position.exit_timestamp.map(ts),
                position.exit_tx_signature,
                position.exit_reason.map(|r| r.as_str()),
                position.realized_pnl_sol,
                position.exit_tx_cost_lamports as i64,
                position.fees_earned_x as i64,
                position.fees_earned_y as i64,
                position.high_water_mark_pct,
                ts(Utc::now()),
                position.id,
            ],
        )?;
        if changed == 0 {
            return Err(StorageError::PositionNotFound(position.id.clone()));
        }
        Ok(())
    }

    /// Checkpoint patch: current price and linearly-derived unrealised P&L
    pub async fn update_position_checkpoint(
        &self,
        position_id: &str,
        current_price: f64,
        unrealized_pnl_lamports: i64,
    ) -> Result<(), StorageError> {
        let db = self.db.lock().await;
        db.execute(
            r#"
            UPDATE positions SET
                current_price_per_token = ?1,
                unrealized_pnl_lamports = ?2,
                updated_at = ?3
            WHERE position_id = ?4
            "#,
            params![
                current_price,
                unrealized_pnl_lamports,
                ts(Utc::now()),
                position_id
            ],
        )?;
        Ok(())
    }

    pub async fn get_position(
        &self,
        position_id: &str,
    ) -> Result<Option<TrackedPosition>, StorageError> {
        let db = self.db.lock().await;
        let row = db
            .query_row(
                "SELECT * FROM positions WHERE position_id = ?1",
                params![position_id],
                Self::map_position_row,
            )
            .optional()?;
        Ok(row)
    }

    pub async fn active_positions(
        &self,
        bot_id: &str,
    ) -> Result<Vec<TrackedPosition>, StorageError> {
        let db = self.db.lock().await;
        let mut stmt =
            db.prepare("SELECT * FROM positions WHERE bot_id = ?1 AND status = 'active'")?;
        let rows = stmt
            .query_map(params![bot_id], Self::map_position_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Pools exited since `since`, for cooldown reconstruction on start
    pub async fn recent_exits(
        &self,
        bot_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<(String, DateTime<Utc>)>, StorageError> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            r#"
            SELECT pool_address, exit_timestamp FROM positions
            WHERE bot_id = ?1 AND status = 'closed' AND exit_timestamp >= ?2
            "#,
        )?;
        let rows = stmt
            .query_map(params![bot_id, ts(since)], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    from_ts(row.get::<_, i64>(1)?),
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn map_position_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TrackedPosition> {
        let status_str: String = row.get("status")?;
        let mode_str: String = row.get("mode")?;
        let features_json: Option<String> = row.get("entry_features")?;
        let exit_reason_str: Option<String> = row.get("exit_reason")?;

        Ok(TrackedPosition {
            id: row.get("position_id")?,
            mode: ExecutionMode::parse(&mode_str).unwrap_or(ExecutionMode::Simulation),
            status: PositionStatus::parse(&status_str).unwrap_or(PositionStatus::Error),
            pool_address: row.get("pool_address")?,
            pool_name: row.get("pool_name")?,
            mint_x: row.get("mint_x")?,
            mint_y: row.get("mint_y")?,
            bin_step: row.get::<_, i64>("bin_step")? as u16,
            entry_active_bin: row.get("entry_active_bin")?,
            lower_bin: row.get("lower_bin")?,
            upper_bin: row.get("upper_bin")?,
            entry_price: row.get("entry_price")?,
            entry_timestamp: from_ts(row.get("entry_timestamp")?),
            entry_amount_x: row.get::<_, i64>("entry_amount_x")? as u64,
            entry_amount_y: row.get::<_, i64>("entry_amount_y")? as u64,
            entry_tx_signature: row.get("entry_tx_signature")?,
            entry_tx_cost_lamports: row.get::<_, i64>("entry_tx_cost_lamports")? as u64,
            entry_score: row.get("entry_score")?,
            ml_probability: row.get("ml_probability")?,
            entry_features: features_json
                .and_then(|json| serde_json::from_str::<EntryFeatures>(&json).ok()),
            profit_target_pct: row.get("profit_target_pct")?,
            stop_loss_pct: row.get("stop_loss_pct")?,
            max_hold_minutes: row.get("max_hold_minutes")?,
            trailing_stop_enabled: row.get::<_, i64>("trailing_stop_enabled")? != 0,
            trailing_stop_pct: row.get("trailing_stop_pct")?,
            high_water_mark_pct: row.get("high_water_mark_pct")?,
            current_price: row
                .get::<_, Option<f64>>("current_price_per_token")?
                .unwrap_or(0.0),
            fees_earned_x: row.get::<_, i64>("fees_earned_x")? as u64,
            fees_earned_y: row.get::<_, i64>("fees_earned_y")? as u64,
            exit_price: row.get("exit_price")?,
            exit_timestamp: row.get::<_, Option<i64>>("exit_timestamp")?.map(from_ts),
            exit_tx_signature: row.get("exit_tx_signature")?,
            exit_reason: exit_reason_str.as_deref().and_then(parse_exit_reason),
            realized_pnl_sol: row.get("realized_pnl_sol")?,
            exit_tx_cost_lamports: row.get::<_, i64>("exit_tx_cost_lamports")? as u64,
        })
    }

    // =========================================================================
    // Trade log
    // =========================================================================

    pub async fn append_trade_log(
        &self,
        bot_id: &str,
        user_id: &str,
        position_id: Option<&str>,
        event: &str,
        details: &serde_json::Value,
    ) -> Result<(), StorageError> {
        let db = self.db.lock().await;
        db.execute(
            r#"
            INSERT INTO trade_log (bot_id, user_id, position_id, event, details, timestamp)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                bot_id,
                user_id,
                position_id,
                event,
                details.to_string(),
                ts(Utc::now())
            ],
        )?;
        Ok(())
    }

    pub async fn trade_log_events(
        &self,
        bot_id: &str,
        event: &str,
    ) -> Result<Vec<serde_json::Value>, StorageError> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT details FROM trade_log WHERE bot_id = ?1 AND event = ?2 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![bot_id, event], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .filter_map(|s| serde_json::from_str(&s).ok())
            .collect())
    }

    // =========================================================================
    // Users and presets
    // =========================================================================

    pub async fn upsert_user(&self, wallet_address: &str) -> Result<i64, StorageError> {
        let db = self.db.lock().await;
        let now = ts(Utc::now());
        db.execute(
            r#"
            INSERT INTO users (wallet_address, created_at, updated_at)
            VALUES (?1, ?2, ?2)
            ON CONFLICT(wallet_address) DO UPDATE SET updated_at = ?2
            "#,
            params![wallet_address, now],
        )?;
        let id: i64 = db.query_row(
            "SELECT id FROM users WHERE wallet_address = ?1",
            params![wallet_address],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub async fn insert_preset(
        &self,
        user_id: Option<&str>,
        name: &str,
        description: Option<&str>,
        config: &serde_json::Value,
    ) -> Result<(), StorageError> {
        let db = self.db.lock().await;
        db.execute(
            r#"
            INSERT INTO strategy_presets (user_id, name, description, is_system, config, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                user_id,
                name,
                description,
                user_id.is_none() as i64,
                config.to_string(),
                ts(Utc::now())
            ],
        )?;
        Ok(())
    }

    /// System presets plus the user's own
    pub async fn list_presets(
        &self,
        user_id: &str,
    ) -> Result<Vec<(String, serde_json::Value)>, StorageError> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            r#"
            SELECT name, config FROM strategy_presets
            WHERE user_id IS NULL OR user_id = ?1
            ORDER BY is_system DESC, id
            "#,
        )?;
        let rows = stmt
            .query_map(params![user_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .filter_map(|(name, json)| {
                serde_json::from_str(&json).ok().map(|cfg| (name, cfg))
            })
            .collect())
    }
}

fn parse_exit_reason(s: &str) -> Option<ExitReason> {
    match s {
        "TAKE_PROFIT" => Some(ExitReason::TakeProfit),
        "TRAILING_STOP" => Some(ExitReason::TrailingStop),
        "STOP_LOSS" => Some(ExitReason::StopLoss),
        "MAX_HOLD_TIME" => Some(ExitReason::MaxHoldTime),
        "EMERGENCY_STOP" => Some(ExitReason::EmergencyStop),
        "USER_REQUESTED" => Some(ExitReason::UserRequested),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::position::tests::create_test_position;

    fn test_config(bot_id: &str) -> BotConfig {
        BotConfig {
            bot_id: bot_id.to_string(),
            user_id: "user-1".to_string(),
            name: "test bot".to_string(),
            ..BotConfig::default()
        }
    }

    async fn store_with_bot(bot_id: &str) -> SqliteStore {
        let store = SqliteStore::open_in_memory().unwrap();
        store.insert_bot(&BotRow::new(test_config(bot_id))).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_bot_roundtrip() {
        let store = store_with_bot("bot-1").await;
        let row = store.get_bot("bot-1").await.unwrap().unwrap();

        assert_eq!(row.bot_id, "bot-1");
        assert_eq!(row.status, BotStatus::Stopped);
        assert_eq!(row.config.max_concurrent_positions, 3);
        assert!(row.to_config().is_ok());
    }

    #[tokio::test]
    async fn test_missing_bot_is_none() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.get_bot("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_status_transitions() {
        let store = store_with_bot("bot-1").await;
        store
            .set_bot_status("bot-1", BotStatus::Running, None)
            .await
            .unwrap();

        let running = store.list_bots_with_status(BotStatus::Running).await.unwrap();
        assert_eq!(running.len(), 1);

        store
            .set_bot_status("bot-1", BotStatus::Error, Some("boom"))
            .await
            .unwrap();
        let row = store.get_bot("bot-1").await.unwrap().unwrap();
        assert_eq!(row.status, BotStatus::Error);
        assert_eq!(row.last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_emergency_state_persists() {
        let store = store_with_bot("bot-1").await;
        store
            .save_emergency_state("bot-1", r#"{"triggered":false}"#)
            .await
            .unwrap();

        let row = store.get_bot("bot-1").await.unwrap().unwrap();
        assert_eq!(
            row.emergency_stop_state.as_deref(),
            Some(r#"{"triggered":false}"#)
        );
    }

    #[tokio::test]
    async fn test_position_roundtrip() {
        let store = store_with_bot("bot-1").await;
        let mut position = create_test_position();
        position.entry_features = Some(EntryFeatures {
            volume_1h: 5_000.0,
            ..EntryFeatures::default()
        });
        position.entry_score = Some(160.0);

        store
            .insert_position("bot-1", "user-1", &position)
            .await
            .unwrap();

        let loaded = store.get_position(&position.id).await.unwrap().unwrap();
        assert_eq!(loaded.pool_address, position.pool_address);
        assert_eq!(loaded.entry_amount_y, position.entry_amount_y);
        assert_eq!(loaded.entry_score, Some(160.0));
        assert_eq!(
            loaded.entry_features.as_ref().map(|f| f.volume_1h),
            Some(5_000.0)
        );

        let active = store.active_positions("bot-1").await.unwrap();
        assert_eq!(active.len(), 1);
    }

    #[tokio::test]
    async fn test_position_exit_update() {
        let store = store_with_bot("bot-1").await;
        let mut position = create_test_position();
        store
            .insert_position("bot-1", "user-1", &position)
            .await
            .unwrap();

        position.status = PositionStatus::Closed;
        position.exit_price = Some(1.06);
        position.exit_timestamp = Some(Utc::now());
        position.exit_reason = Some(ExitReason::TakeProfit);
        position.realized_pnl_sol = Some(0.06);
        store.update_position_exit(&position).await.unwrap();

        let loaded = store.get_position(&position.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, PositionStatus::Closed);
        assert_eq!(loaded.exit_reason, Some(ExitReason::TakeProfit));
        assert!(store.active_positions("bot-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_checkpoint_patch() {
        let store = store_with_bot("bot-1").await;
        let position = create_test_position();
        store
            .insert_position("bot-1", "user-1", &position)
            .await
            .unwrap();

        store
            .update_position_checkpoint(&position.id, 1.03, 15_000_000)
            .await
            .unwrap();

        let loaded = store.get_position(&position.id).await.unwrap().unwrap();
        assert!((loaded.current_price - 1.03).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_trade_stats_accumulate() {
        let store = store_with_bot("bot-1").await;
        store.apply_trade_stats("bot-1", true, 60_000_000).await.unwrap();
        store.apply_trade_stats("bot-1", false, -20_000_000).await.unwrap();

        let row = store.get_bot("bot-1").await.unwrap().unwrap();
        assert_eq!(row.total_trades, 2);
        assert_eq!(row.winning_trades, 1);
        assert_eq!(row.total_pnl_lamports, 40_000_000);
    }

    #[tokio::test]
    async fn test_delete_cascades() {
        let store = store_with_bot("bot-1").await;
        let position = create_test_position();
        store
            .insert_position("bot-1", "user-1", &position)
            .await
            .unwrap();
        store
            .append_trade_log("bot-1", "user-1", None, "bot_created", &serde_json::json!({}))
            .await
            .unwrap();

        store.delete_bot("bot-1").await.unwrap();

        assert!(store.get_position(&position.id).await.unwrap().is_none());
        assert!(store
            .trade_log_events("bot-1", "bot_created")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_recent_exits_for_cooldowns() {
        let store = store_with_bot("bot-1").await;
        let mut position = create_test_position();
        position.status = PositionStatus::Closed;
        store
            .insert_position("bot-1", "user-1", &position)
            .await
            .unwrap();
        position.exit_timestamp = Some(Utc::now());
        store.update_position_exit(&position).await.unwrap();

        let exits = store
            .recent_exits("bot-1", Utc::now() - chrono::Duration::minutes(30))
            .await
            .unwrap();
        assert_eq!(exits.len(), 1);
        assert_eq!(exits[0].0, position.pool_address);
    }

    #[tokio::test]
    async fn test_presets() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .insert_preset(None, "conservative", Some("low risk"), &serde_json::json!({"stop_loss_pct": 5.0}))
            .await
            .unwrap();
        store
            .insert_preset(Some("user-1"), "mine", None, &serde_json::json!({}))
            .await
            .unwrap();
        store
            .insert_preset(Some("user-2"), "theirs", None, &serde_json::json!({}))
            .await
            .unwrap();

        let presets = store.list_presets("user-1").await.unwrap();
        assert_eq!(presets.len(), 2);
        // System presets sort first
        assert_eq!(presets[0].0, "conservative");
    }

    #[tokio::test]
    async fn test_user_upsert_idempotent() {
        let store = SqliteStore::open_in_memory().unwrap();
        let id1 = store.upsert_user("wallet-abc").await.unwrap();
        let id2 = store.upsert_user("wallet-abc").await.unwrap();
        assert_eq!(id1, id2);
    }
}
