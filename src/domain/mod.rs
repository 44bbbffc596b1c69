//! Core business logic: bot configuration, tracked positions, market
//! scoring, and the per-bot safety layer.

pub mod bot_config;
pub mod circuit_breaker;
pub mod cooldown;
pub mod emergency_stop;
pub mod events;
pub mod position;
pub mod scoring;

pub use bot_config::{BotConfig, StrategyMode, WRAPPED_SOL_MINT};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerLimits, CircuitBreakerState};
pub use cooldown::CooldownTracker;
pub use emergency_stop::{EmergencyStop, EmergencyStopLimits, EmergencyStopState, GateDecision};
pub use events::{BotEvent, BotEventKind, EngineStats};
pub use position::{
    EntryFeatures, ExecutionMode, ExitReason, PositionStatus, TrackedPosition, LAMPORTS_PER_SOL,
};
pub use scoring::{MarketScore, MarketScorer, ScoreVerdict, ScoreWeights};
