//! Emergency Stop
//!
//! Per-bot financial kill switch. Accumulates daily/total P&L, consecutive
//! losses, and rolling failure windows; denies trading once any limit is
//! breached and stays triggered until an operator reset. State serialises
//! to an opaque JSON blob so accumulated-loss protection survives restarts.
//!
//! Trigger notifications are delivered over channels rather than invoked
//! callbacks, so a transition never re-enters the caller while any lock is
//! held.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// Default cap on lifetime loss in SOL
pub const DEFAULT_MAX_TOTAL_LOSS_SOL: f64 = 5.0;

/// Default consecutive-loss cap
pub const DEFAULT_MAX_CONSECUTIVE_LOSSES: u32 = 5;

/// Default transaction failures allowed per rolling hour
pub const DEFAULT_MAX_TX_FAILURES_PER_HOUR: usize = 3;

/// Default API errors allowed per rolling hour
pub const DEFAULT_MAX_API_ERRORS_PER_HOUR: usize = 10;

#[derive(Debug, Error)]
pub enum EmergencyStopError {
    #[error("State blob is not valid JSON: {0}")]
    InvalidJson(String),
}

/// Limits the gate evaluates against
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EmergencyStopLimits {
    pub max_daily_loss_sol: f64,
    pub max_total_loss_sol: f64,
    pub max_consecutive_losses: u32,
    pub max_tx_failures_per_hour: usize,
    pub max_api_errors_per_hour: usize,
}

impl Default for EmergencyStopLimits {
    fn default() -> Self {
        Self {
            max_daily_loss_sol: 1.0,
            max_total_loss_sol: DEFAULT_MAX_TOTAL_LOSS_SOL,
            max_consecutive_losses: DEFAULT_MAX_CONSECUTIVE_LOSSES,
            max_tx_failures_per_hour: DEFAULT_MAX_TX_FAILURES_PER_HOUR,
            max_api_errors_per_hour: DEFAULT_MAX_API_ERRORS_PER_HOUR,
        }
    }
}

/// Persisted state. The blob written to the bot row is exactly this
/// structure serialised as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencyStopState {
    pub triggered: bool,
    #[serde(default)]
    pub trigger_reason: Option<String>,
    #[serde(default)]
    pub triggered_at: Option<DateTime<Utc>>,
    pub daily_pnl_sol: f64,
    pub total_pnl_sol: f64,
    #[serde(default)]
    pub consecutive_losses: u32,
    #[serde(default = "default_reset_date")]
    pub daily_reset_date: NaiveDate,
    #[serde(default)]
    pub tx_failures: Vec<DateTime<Utc>>,
    #[serde(default)]
    pub api_errors: Vec<DateTime<Utc>>,
    #[serde(default)]
    pub total_triggers: u32,
}

fn default_reset_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).expect("epoch date")
}

impl Default for EmergencyStopState {
    fn default() -> Self {
        Self {
            triggered: false,
            trigger_reason: None,
            triggered_at: None,
            daily_pnl_sol: 0.0,
            total_pnl_sol: 0.0,
            consecutive_losses: 0,
            daily_reset_date: default_reset_date(),
            tx_failures: Vec::new(),
            api_errors: Vec::new(),
            total_triggers: 0,
        }
    }
}

/// Outcome of a `can_trade` gate check
#[derive(Debug, Clone, PartialEq)]
pub struct GateDecision {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl GateDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// The per-bot kill switch
#[derive(Debug)]
pub struct EmergencyStop {
    limits: EmergencyStopLimits,
    state: EmergencyStopState,
    kill_switch: bool,
    trigger_listeners: Vec<mpsc::UnboundedSender<String>>,
}

impl EmergencyStop {
    pub fn new(limits: EmergencyStopLimits) -> Self {
        Self {
            limits,
            state: EmergencyStopState::default(),
            kill_switch: false,
            trigger_listeners: Vec::new(),
        }
    }

    /// Restore a previously persisted state. Listener registrations and the
    /// kill switch are not part of persisted state.
    pub fn restore(limits: EmergencyStopLimits, state: EmergencyStopState) -> Self {
        Self {
            limits,
            state,
            kill_switch: false,
            trigger_listeners: Vec::new(),
        }
    }

    /// Register for trigger notifications. Each transition to the triggered
    /// state sends the reason exactly once to every listener.
    pub fn on_trigger(&mut self) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.trigger_listeners.push(tx);
        rx
    }

    /// Drop every registered listener so their receivers close. Called on
    /// engine teardown.
    pub fn clear_trigger_listeners(&mut self) {
        self.trigger_listeners.clear();
    }

    pub fn can_trade(&mut self) -> GateDecision {
        self.can_trade_at(Utc::now())
    }

    /// Evaluate the gate at an explicit instant. Condition order matters:
    /// kill switch, existing trigger, daily loss, total loss, consecutive
    /// losses, tx failures, API errors.
    pub fn can_trade_at(&mut self, now: DateTime<Utc>) -> GateDecision {
        self.maybe_daily_reset(now);
        self.prune_windows(now);

        if self.kill_switch {
            return GateDecision::deny("Kill switch active");
        }

        if self.state.triggered {
            let reason = self
                .state
                .trigger_reason
                .clone()
                .unwrap_or_else(|| "Emergency stop triggered".to_string());
            return GateDecision::deny(reason);
        }

        if self.state.daily_pnl_sol <= -self.limits.max_daily_loss_sol {
            return self.trip(
                format!(
                    "Daily loss limit reached: {:.4} SOL (max {:.4})",
                    -self.state.daily_pnl_sol, self.limits.max_daily_loss_sol
                ),
                now,
            );
        }

        if self.state.total_pnl_sol <= -self.limits.max_total_loss_sol {
            return self.trip(
                format!(
                    "Total loss limit reached: {:.4} SOL (max {:.4})",
                    -self.state.total_pnl_sol, self.limits.max_total_loss_sol
                ),
                now,
            );
        }

        if self.state.consecutive_losses >= self.limits.max_consecutive_losses {
            return self.trip(
                format!(
                    "{} consecutive losses (max {})",
                    self.state.consecutive_losses, self.limits.max_consecutive_losses
                ),
                now,
            );
        }

        if self.state.tx_failures.len() >= self.limits.max_tx_failures_per_hour {
            return self.trip(
                format!(
                    "{} transaction failures in the last hour (max {})",
                    self.state.tx_failures.len(),
                    self.limits.max_tx_failures_per_hour
                ),
                now,
            );
        }

        if self.state.api_errors.len() >= self.limits.max_api_errors_per_hour {
            return self.trip(
                format!(
                    "{} API errors in the last hour (max {})",
                    self.state.api_errors.len(),
                    self.limits.max_api_errors_per_hour
                ),
                now,
            );
        }

        GateDecision::allow()
    }

    pub fn record_trade_result(&mut self, pnl_sol: f64) {
        self.record_trade_result_at(pnl_sol, Utc::now());
    }

    /// Fold a realised trade result into the accumulators
    pub fn record_trade_result_at(&mut self, pnl_sol: f64, now: DateTime<Utc>) {
        self.maybe_daily_reset(now);

        self.state.daily_pnl_sol += pnl_sol;
        self.state.total_pnl_sol += pnl_sol;

        if pnl_sol <= 0.0 {
            self.state.consecutive_losses += 1;
            tracing::debug!(
                pnl_sol,
                consecutive = self.state.consecutive_losses,
                daily = self.state.daily_pnl_sol,
                "Loss recorded"
            );
        } else {
            self.state.consecutive_losses = 0;
        }
    }

    pub fn record_tx_failure(&mut self) {
        self.record_tx_failure_at(Utc::now());
    }

    pub fn record_tx_failure_at(&mut self, now: DateTime<Utc>) {
        self.state.tx_failures.push(now);
        self.prune_windows(now);
    }

    pub fn record_api_error(&mut self) {
        self.record_api_error_at(Utc::now());
    }

    pub fn record_api_error_at(&mut self, now: DateTime<Utc>) {
        self.state.api_errors.push(now);
        self.prune_windows(now);
    }

    /// Operator-initiated trigger
    pub fn manual_trigger(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        self.trip(reason, Utc::now());
    }

    pub fn set_kill_switch(&mut self, active: bool) {
        self.kill_switch = active;
        tracing::warn!(active, "Kill switch changed");
    }

    /// Clear the trigger and rolling windows; accumulated P&L is preserved
    pub fn reset(&mut self) {
        self.state.triggered = false;
        self.state.trigger_reason = None;
        self.state.triggered_at = None;
        self.state.tx_failures.clear();
        self.state.api_errors.clear();
        tracing::info!("Emergency stop reset (P&L accumulators preserved)");
    }

    /// Wipe everything back to a fresh state
    pub fn full_reset(&mut self) {
        self.state = EmergencyStopState::default();
        tracing::info!("Emergency stop fully reset");
    }

    pub fn is_triggered(&self) -> bool {
        self.state.triggered
    }

    pub fn state(&self) -> &EmergencyStopState {
        &self.state
    }

    /// Serialise the persisted blob
    pub fn serialize(&self) -> String {
        serde_json::to_string(&self.state).unwrap_or_else(|e| {
            tracing::error!(error = %e, "Failed to serialise emergency-stop state");
            "{}".to_string()
        })
    }

    /// Deserialise a persisted blob. Permissive about extra or missing
    /// secondary fields, but the triggered flag and both P&L numbers must
    /// be present, else the blob is rejected.
    pub fn deserialize(blob: &str) -> Option<EmergencyStopState> {
        let value: serde_json::Value = serde_json::from_str(blob).ok()?;

        let obj = value.as_object()?;
        if !obj.get("triggered").map(|v| v.is_boolean()).unwrap_or(false) {
            return None;
        }
        if !obj.get("daily_pnl_sol").map(|v| v.is_number()).unwrap_or(false) {
            return None;
        }
        if !obj.get("total_pnl_sol").map(|v| v.is_number()).unwrap_or(false) {
            return None;
        }

        serde_json::from_value(value).ok()
    }

    fn trip(&mut self, reason: String, now: DateTime<Utc>) -> GateDecision {
        if !self.state.triggered {
            self.state.triggered = true;
            self.state.trigger_reason = Some(reason.clone());
            self.state.triggered_at = Some(now);
            self.state.total_triggers += 1;

            tracing::error!(reason = %reason, "EMERGENCY STOP TRIGGERED");

            self.trigger_listeners.retain(|tx| {
                if tx.send(reason.clone()).is_err() {
                    tracing::debug!("Trigger listener gone, dropping");
                    false
                } else {
                    true
                }
            });
        }
        GateDecision::deny(reason)
    }

    fn maybe_daily_reset(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        if today != self.state.daily_reset_date {
            if self.state.daily_reset_date != default_reset_date() {
                tracing::info!(
                    date = %today,
                    "UTC day rollover, resetting daily loss counters"
                );
            }
            self.state.daily_reset_date = today;
            self.state.daily_pnl_sol = 0.0;
            self.state.consecutive_losses = 0;
        }
    }

    fn prune_windows(&mut self, now: DateTime<Utc>) {
        let cutoff = now - Duration::hours(1);
        self.state.tx_failures.retain(|t| *t > cutoff);
        self.state.api_errors.retain(|t| *t > cutoff);
    }
}
