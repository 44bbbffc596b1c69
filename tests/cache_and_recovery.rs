//! Orchestrator-level scenarios: the full persistence bridge, the
//! emergency-halt chain, crash recovery, and the shared cache contracts
//! exercised through the public API.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dlmm_pilot::adapters::cache::{CacheConfig, SharedPoolCache};
use dlmm_pilot::adapters::chain::wallet::WalletManager;
use dlmm_pilot::adapters::storage::{BotRow, BotStatus, SqliteStore};
use dlmm_pilot::application::event_bus::EventBus;
use dlmm_pilot::application::orchestrator::{BotOrchestrator, LiveDeps};
use dlmm_pilot::domain::bot_config::BotConfig;
use dlmm_pilot::domain::emergency_stop::{EmergencyStop, EmergencyStopState};
use dlmm_pilot::domain::position::{
    ExecutionMode, ExitReason, PositionStatus, TrackedPosition,
};
use dlmm_pilot::ports::dlmm::{ChainReader, DlmmClient};
use dlmm_pilot::ports::mocks::{
    test_pool, MockChainReader, MockDlmmClient, MockPoolApi, MockSwapClient,
};
use dlmm_pilot::ports::pool_api::{ActiveBin, PoolApi, PoolInfo};
use dlmm_pilot::ports::swap::SwapClient;

const SOL: f64 = 1_000_000_000.0;

struct Harness {
    orchestrator: Arc<BotOrchestrator>,
    storage: Arc<SqliteStore>,
    api: Arc<MockPoolApi>,
    dlmm: Arc<MockDlmmClient>,
    bus: Arc<EventBus>,
}

fn build(pools: Vec<PoolInfo>, scripts: Vec<(&str, Vec<f64>)>) -> Harness {
    let storage = Arc::new(SqliteStore::open_in_memory().unwrap());
    let api = Arc::new(MockPoolApi::with_pools(pools));
    let dlmm = Arc::new(MockDlmmClient::new(25));
    for (pool, prices) in scripts {
        dlmm.set_price_sequence(pool, prices);
    }
    let cache = Arc::new(SharedPoolCache::new(
        Arc::clone(&api) as Arc<dyn PoolApi>,
        CacheConfig::fast(),
    ));
    let bus = Arc::new(EventBus::new());

    let live = LiveDeps {
        dlmm: Arc::clone(&dlmm) as Arc<dyn DlmmClient>,
        chain: Arc::new(MockChainReader::new((10.0 * SOL) as u64)) as Arc<dyn ChainReader>,
        swap: Arc::new(MockSwapClient::new()) as Arc<dyn SwapClient>,
        wallet: Arc::new(WalletManager::new_random()),
        risk_confirmed: true,
    };

    let orchestrator = BotOrchestrator::new(
        Arc::clone(&storage),
        cache,
        Arc::clone(&bus),
        None,
        Some(live),
    );

    Harness {
        orchestrator,
        storage,
        api,
        dlmm,
        bus,
    }
}

fn fast_sim_config(bot_id: &str) -> BotConfig {
    BotConfig {
        bot_id: bot_id.to_string(),
        user_id: "user-1".to_string(),
        name: "scenario bot".to_string(),
        mode: ExecutionMode::Simulation,
        entry_score_threshold: 0.0,
        min_liquidity_usd: 0.0,
        max_liquidity_usd: 1e12,
        min_volume_24h_usd: 0.0,
        position_size_sol: Some(1.0),
        min_position_sol: 0.1,
        max_position_sol: 5.0,
        profit_target_pct: 5.0,
        stop_loss_pct: 10.0,
        max_hold_minutes: 60,
        cooldown_minutes: 30,
        scan_interval_secs: 1,
        position_check_interval_secs: 1,
        sim_initial_balance_sol: 10.0,
        ..BotConfig::default()
    }
}

fn seeded_position(bot_id: &str) -> TrackedPosition {
    TrackedPosition {
        id: "restored-1".to_string(),
        mode: ExecutionMode::Simulation,
        status: PositionStatus::Active,
        pool_address: "alpha".to_string(),
        pool_name: "alpha-SOL".to_string(),
        mint_x: "mint-alpha".to_string(),
        mint_y: dlmm_pilot::domain::bot_config::WRAPPED_SOL_MINT.to_string(),
        bin_step: 25,
        entry_active_bin: 0,
        lower_bin: -10,
        upper_bin: 10,
        entry_price: 1.0,
        entry_timestamp: Utc::now() - chrono::Duration::minutes(5),
        entry_amount_x: (0.5 * SOL) as u64,
        entry_amount_y: (0.5 * SOL) as u64,
        entry_tx_signature: format!("sig-{}", bot_id),
        entry_tx_cost_lamports: 5_000,
        entry_score: Some(160.0),
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

// =============================================================================
// Full simulation lifecycle through the persistence bridge
// =============================================================================

#[tokio::test]
async fn simulation_lifecycle_persists_stats() {
    let h = build(
        vec![test_pool("alpha", 1.0)],
        vec![("alpha", vec![1.0, 1.06])],
    );

    h.orchestrator
        .create_bot(fast_sim_config("bot-1"))
        .await
        .unwrap();
    h.orchestrator.start_bot("bot-1", "user-1").await.unwrap();

    // Initial scan opens at 1.0; the next check sees 1.06 and takes profit
    tokio::time::sleep(Duration::from_millis(2_500)).await;
    h.orchestrator.stop_bot("bot-1").await.unwrap();
    // Let the persistence bridge drain the final events
    tokio::time::sleep(Duration::from_millis(300)).await;

    let row = h.storage.get_bot("bot-1").await.unwrap().unwrap();
    assert_eq!(row.status, BotStatus::Stopped);
    assert_eq!(row.total_trades, 1);
    assert_eq!(row.winning_trades, 1);
    assert!(row.total_pnl_lamports > 0);
    assert!(row.last_activity_at.is_some());

    // The position row carries the full exit
    let opened = h
        .storage
        .trade_log_events("bot-1", "position_opened")
        .await
        .unwrap();
    assert_eq!(opened.len(), 1);
    let closed = h
        .storage
        .trade_log_events("bot-1", "position_closed")
        .await
        .unwrap();
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0]["result"], "WIN");
    assert_eq!(closed[0]["reason"], "TAKE_PROFIT");

    let started = h
        .storage
        .trade_log_events("bot-1", "bot_started")
        .await
        .unwrap();
    assert_eq!(started.len(), 1);
    let stopped = h
        .storage
        .trade_log_events("bot-1", "bot_stopped")
        .await
        .unwrap();
    assert_eq!(stopped.len(), 1);
}

// =============================================================================
// S3: daily-loss halt marks the bot row and stops the engine
// =============================================================================

#[tokio::test]
async fn daily_loss_halts_and_marks_error() {
    let h = build(vec![test_pool("alpha", 1.0)], vec![("alpha", vec![1.0])]);

    h.orchestrator
        .create_bot(fast_sim_config("bot-1"))
        .await
        .unwrap();

    // Two losing closes worth -0.6 and -0.5 SOL happened earlier today
    let state = EmergencyStopState {
        daily_pnl_sol: -1.1,
        total_pnl_sol: -1.1,
        consecutive_losses: 2,
        daily_reset_date: Utc::now().date_naive(),
        ..EmergencyStopState::default()
    };
    h.storage
        .save_emergency_state("bot-1", &serde_json::to_string(&state).unwrap())
        .await
        .unwrap();

    h.orchestrator.start_bot("bot-1", "user-1").await.unwrap();

    // The first scan's gate check trips the stop; the trigger handler
    // closes out and marks the row
    tokio::time::sleep(Duration::from_millis(800)).await;

    assert!(!h.orchestrator.is_running("bot-1").await);
    let row = h.storage.get_bot("bot-1").await.unwrap().unwrap();
    assert_eq!(row.status, BotStatus::Error);
    let last_error = row.last_error.unwrap();
    assert!(last_error.contains("Emergency stop"));
    assert!(last_error.contains("Daily loss"));

    // The persisted blob is at least as conservative as before
    let restored =
        EmergencyStop::deserialize(row.emergency_stop_state.as_deref().unwrap()).unwrap();
    assert!(restored.triggered);
    assert!(restored.daily_pnl_sol <= -1.1);
}

// =============================================================================
// S5: recovery restores positions, exposure and accumulated losses
// =============================================================================

#[tokio::test]
async fn recovery_restores_state() {
    let h = build(vec![test_pool("alpha", 1.0)], vec![("alpha", vec![1.0])]);

    // A bot that was running when the process died, with one active
    // position and -0.4 SOL of accumulated losses
    let mut config = fast_sim_config("bot-1");
    config.scan_interval_secs = 3600;
    config.position_check_interval_secs = 3600;
    h.storage.insert_bot(&BotRow::new(config)).await.unwrap();
    h.storage
        .set_bot_status("bot-1", BotStatus::Running, None)
        .await
        .unwrap();
    h.storage
        .insert_position("bot-1", "user-1", &seeded_position("bot-1"))
        .await
        .unwrap();
    let state = EmergencyStopState {
        total_pnl_sol: -0.4,
        daily_reset_date: Utc::now().date_naive(),
        ..EmergencyStopState::default()
    };
    h.storage
        .save_emergency_state("bot-1", &serde_json::to_string(&state).unwrap())
        .await
        .unwrap();

    let recovered = h.orchestrator.recover_running_bots().await;
    assert_eq!(recovered, 1);
    assert!(h.orchestrator.is_running("bot-1").await);

    // The executor adopted the persisted position
    let (_, _, positions) = h.orchestrator.bot_overview("bot-1").await.unwrap();
    assert_eq!(positions.len(), 1);
    assert_eq!(positions[0].id, "restored-1");
    assert_eq!(positions[0].entry_value_lamports(), SOL as u64);

    // Stopping re-persists the accumulated losses unchanged
    h.orchestrator.stop_bot("bot-1").await.unwrap();
    let row = h.storage.get_bot("bot-1").await.unwrap().unwrap();
    let restored =
        EmergencyStop::deserialize(row.emergency_stop_state.as_deref().unwrap()).unwrap();
    assert!((restored.total_pnl_sol + 0.4).abs() < 1e-9);
}

#[tokio::test]
async fn recovery_failure_marks_error() {
    // No live deps in this harness, so a live-mode bot cannot recover
    let storage = Arc::new(SqliteStore::open_in_memory().unwrap());
    let api = Arc::new(MockPoolApi::new());
    let cache = Arc::new(SharedPoolCache::new(
        Arc::clone(&api) as Arc<dyn PoolApi>,
        CacheConfig::fast(),
    ));
    let bus = Arc::new(EventBus::new());
    let orchestrator = BotOrchestrator::new(Arc::clone(&storage), cache, bus, None, None);

    let mut config = fast_sim_config("bot-live");
    config.mode = ExecutionMode::Live;
    storage.insert_bot(&BotRow::new(config)).await.unwrap();
    storage
        .set_bot_status("bot-live", BotStatus::Running, None)
        .await
        .unwrap();

    let recovered = orchestrator.recover_running_bots().await;
    assert_eq!(recovered, 0);

    let row = storage.get_bot("bot-live").await.unwrap().unwrap();
    assert_eq!(row.status, BotStatus::Error);
    assert!(row.last_error.unwrap().contains("Recovery failed"));
}

// =============================================================================
// User-initiated close through the orchestrator
// =============================================================================

#[tokio::test]
async fn user_close_routes_to_owning_engine() {
    let h = build(vec![test_pool("alpha", 1.0)], vec![("alpha", vec![1.0])]);

    h.orchestrator
        .create_bot(fast_sim_config("bot-1"))
        .await
        .unwrap();
    h.orchestrator.start_bot("bot-1", "user-1").await.unwrap();

    // Wait for the initial scan to open and persist
    tokio::time::sleep(Duration::from_millis(600)).await;
    let active = h.storage.active_positions("bot-1").await.unwrap();
    assert_eq!(active.len(), 1);

    h.orchestrator
        .close_position(&active[0].id, ExitReason::UserRequested)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let closed = h.storage.get_position(&active[0].id).await.unwrap().unwrap();
    assert_eq!(closed.status, PositionStatus::Closed);
    assert_eq!(closed.exit_reason, Some(ExitReason::UserRequested));

    // Unknown position ids surface as not-found
    assert!(h
        .orchestrator
        .close_position("missing", ExitReason::UserRequested)
        .await
        .is_err());

    h.orchestrator.stop_bot("bot-1").await.unwrap();
}

// =============================================================================
// Event bus receives the per-user stream
// =============================================================================

#[tokio::test]
async fn bus_forwards_user_events() {
    let h = build(vec![test_pool("alpha", 1.0)], vec![("alpha", vec![1.0])]);

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let seen_clone = Arc::clone(&seen);
    let _subscription = h.bus.subscribe_user(
        "user-1",
        Arc::new(move |event| {
            seen_clone
                .lock()
                .unwrap()
                .push(event.kind.name().to_string());
        }),
    );

    h.orchestrator
        .create_bot(fast_sim_config("bot-1"))
        .await
        .unwrap();
    h.orchestrator.start_bot("bot-1", "user-1").await.unwrap();
    tokio::time::sleep(Duration::from_millis(600)).await;
    h.orchestrator.stop_bot("bot-1").await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let names = seen.lock().unwrap().clone();
    assert!(names.contains(&"engine:started".to_string()));
    assert!(names.contains(&"position:opened".to_string()));
    assert!(names.contains(&"engine:stopped".to_string()));
    // Per-bot ordering: started strictly precedes stopped
    let started_at = names.iter().position(|n| n == "engine:started").unwrap();
    let stopped_at = names.iter().position(|n| n == "engine:stopped").unwrap();
    assert!(started_at < stopped_at);
}

// =============================================================================
// S4: cache coalescing under concurrency
// =============================================================================

#[tokio::test]
async fn concurrent_misses_issue_one_upstream_request() {
    let api = Arc::new(MockPoolApi::with_pools(vec![test_pool("alpha", 1.0)]));
    api.set_delay(Duration::from_millis(50));
    let cache = Arc::new(SharedPoolCache::new(
        Arc::clone(&api) as Arc<dyn PoolApi>,
        CacheConfig::fast(),
    ));

    let mut handles = Vec::new();
    for _ in 0..50 {
        let cache = Arc::clone(&cache);
        handles.push(tokio::spawn(async move { cache.get_pool("alpha").await }));
    }

    let mut values = Vec::new();
    for handle in handles {
        values.push(handle.await.unwrap().unwrap());
    }

    assert_eq!(api.pool_calls().len(), 1);
    assert!(values.iter().all(|p| p.address == "alpha"));

    // The 51st call inside the TTL issues nothing further
    cache.get_pool("alpha").await.unwrap();
    assert_eq!(api.pool_calls().len(), 1);
    assert!(cache.stats().coalesced >= 1);
}

// =============================================================================
// Stale value survives an upstream outage
// =============================================================================

#[tokio::test]
async fn stale_value_served_during_outage() {
    let api = Arc::new(MockPoolApi::with_pools(vec![test_pool("alpha", 2.0)]));
    let cache = SharedPoolCache::new(Arc::clone(&api) as Arc<dyn PoolApi>, CacheConfig::fast());

    let fresh = cache.get_pool("alpha").await.unwrap();
    assert!((fresh.current_price - 2.0).abs() < 1e-9);

    tokio::time::sleep(Duration::from_millis(200)).await;
    api.fail_always(true);

    let stale = cache.get_pool("alpha").await.unwrap();
    assert!((stale.current_price - 2.0).abs() < 1e-9);
    assert_eq!(cache.stats().stale_served, 1);

    // A pool never seen before still fails
    assert!(cache.get_pool("ghost").await.is_err());
}

// =============================================================================
// Active-bin snapshots expire on their own TTL
// =============================================================================

#[tokio::test]
async fn active_bin_ttl_expires() {
    let api = Arc::new(MockPoolApi::new());
    let cache = SharedPoolCache::new(Arc::clone(&api) as Arc<dyn PoolApi>, CacheConfig::fast());

    cache
        .cache_active_bin(
            "alpha",
            ActiveBin {
                bin_id: 7,
                price: 1.2,
            },
        )
        .await;
    assert!(cache.get_cached_active_bin("alpha").await.is_some());

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(cache.get_cached_active_bin("alpha").await.is_none());
}

// =============================================================================
// Property 10: emergency-state blob round trip via storage
// =============================================================================

#[tokio::test]
async fn emergency_blob_round_trips_through_storage() {
    let storage = SqliteStore::open_in_memory().unwrap();
    storage
        .insert_bot(&BotRow::new(fast_sim_config("bot-1")))
        .await
        .unwrap();

    let state = EmergencyStopState {
        triggered: true,
        trigger_reason: Some("test".to_string()),
        daily_pnl_sol: -0.25,
        total_pnl_sol: -1.75,
        consecutive_losses: 3,
        daily_reset_date: Utc::now().date_naive(),
        ..EmergencyStopState::default()
    };
    storage
        .save_emergency_state("bot-1", &serde_json::to_string(&state).unwrap())
        .await
        .unwrap();

    let row = storage.get_bot("bot-1").await.unwrap().unwrap();
    let restored =
        EmergencyStop::deserialize(row.emergency_stop_state.as_deref().unwrap()).unwrap();
    assert_eq!(restored, state);

    // Blobs missing an essential field are rejected outright
    assert!(EmergencyStop::deserialize(r#"{"triggered": true}"#).is_none());
}
