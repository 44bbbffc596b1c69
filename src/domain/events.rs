//! Bot Lifecycle Events
//!
//! Typed events produced serially by each engine and consumed by the
//! orchestrator's persistence bridge and the event bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::position::TrackedPosition;

/// Per-engine transient counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStats {
    pub total_scans: u64,
    pub positions_opened: u64,
    pub positions_closed: u64,
    pub wins: u64,
    pub losses: u64,
    pub realized_pnl_sol: f64,
    pub started_at: DateTime<Utc>,
}

impl EngineStats {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            total_scans: 0,
            positions_opened: 0,
            positions_closed: 0,
            wins: 0,
            losses: 0,
            realized_pnl_sol: 0.0,
            started_at,
        }
    }

    pub fn win_rate_pct(&self) -> f64 {
        let closed = self.wins + self.losses;
        if closed == 0 {
            return 0.0;
        }
        self.wins as f64 / closed as f64 * 100.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BotEventKind {
    EngineStarted,
    EngineStopped { stats: EngineStats },
    EngineError { message: String },
    PositionOpened { position: TrackedPosition },
    PositionClosed { position: TrackedPosition },
    PositionUpdated { position: TrackedPosition },
    ScanCompleted { eligible: usize, entered: usize },
}

impl BotEventKind {
    /// Wire name used on the outbound event stream
    pub fn name(&self) -> &'static str {
        match self {
            BotEventKind::EngineStarted => "engine:started",
            BotEventKind::EngineStopped { .. } => "engine:stopped",
            BotEventKind::EngineError { .. } => "engine:error",
            BotEventKind::PositionOpened { .. } => "position:opened",
            BotEventKind::PositionClosed { .. } => "position:closed",
            BotEventKind::PositionUpdated { .. } => "position:updated",
            BotEventKind::ScanCompleted { .. } => "scan:completed",
        }
    }

    /// Trade-log kind for events that are journalled. `bot_created` exists
    /// as a distinct kind written at creation time, never from an engine
    /// event.
    pub fn trade_log_kind(&self) -> Option<&'static str> {
        match self {
            BotEventKind::EngineStarted => Some("bot_started"),
            BotEventKind::EngineStopped { .. } => Some("bot_stopped"),
            BotEventKind::EngineError { .. } => Some("bot_error"),
            BotEventKind::PositionOpened { .. } => Some("position_opened"),
            BotEventKind::PositionClosed { .. } => Some("position_closed"),
            BotEventKind::ScanCompleted { .. } => Some("scan_completed"),
            BotEventKind::PositionUpdated { .. } => None,
        }
    }
}

/// One emitted event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotEvent {
    pub bot_id: String,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: BotEventKind,
}

impl BotEvent {
    pub fn new(bot_id: impl Into<String>, user_id: impl Into<String>, kind: BotEventKind) -> Self {
        Self {
            bot_id: bot_id.into(),
            user_id: user_id.into(),
            timestamp: Utc::now(),
            kind,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names() {
        let event = BotEvent::new("b", "u", BotEventKind::EngineStarted);
        assert_eq!(event.kind.name(), "engine:started");
        assert_eq!(event.kind.trade_log_kind(), Some("bot_started"));
    }

    #[test]
    fn test_position_updated_not_journalled() {
        let kind = BotEventKind::ScanCompleted {
            eligible: 3,
            entered: 1,
        };
        assert_eq!(kind.trade_log_kind(), Some("scan_completed"));
    }

    #[test]
    fn test_win_rate() {
        let mut stats = EngineStats::new(Utc::now());
        assert_eq!(stats.win_rate_pct(), 0.0);
        stats.wins = 3;
        stats.losses = 1;
        assert_eq!(stats.win_rate_pct(), 75.0);
    }
}
