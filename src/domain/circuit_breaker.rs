//! Circuit Breaker
//!
//! Per-bot throttle over position count, exposure, transaction rate and
//! trade cooldown. Unlike the emergency stop it carries no persisted state:
//! on start or recovery it is rebuilt from the authoritative active
//! position list via `sync_with`.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

use super::position::TrackedPosition;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CircuitBreakerLimits {
    pub max_open_positions: usize,
    pub max_positions_per_pool: usize,
    /// Largest single position in lamports
    pub max_position_lamports: u64,
    /// Total exposure cap in lamports
    pub max_exposure_lamports: u64,
    pub max_tx_per_minute: usize,
    pub trade_cooldown_ms: i64,
    pub max_api_calls_per_minute: usize,
}

impl Default for CircuitBreakerLimits {
    fn default() -> Self {
        Self {
            max_open_positions: 5,
            max_positions_per_pool: 1,
            max_position_lamports: 10_000_000_000,  // 10 SOL
            max_exposure_lamports: 50_000_000_000,  // 50 SOL
            max_tx_per_minute: 10,
            trade_cooldown_ms: 2_000,
            max_api_calls_per_minute: 60,
        }
    }
}

/// Snapshot for telemetry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub open_positions: usize,
    pub positions_per_pool: HashMap<String, usize>,
    pub exposure_lamports: u64,
    pub last_trade_at: Option<DateTime<Utc>>,
    pub tx_in_last_minute: usize,
}

/// Outcome of a `can_open` check
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerDecision {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl BreakerDecision {
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

#[derive(Debug)]
pub struct CircuitBreaker {
    limits: CircuitBreakerLimits,
    open_positions: usize,
    per_pool: HashMap<String, usize>,
    exposure_lamports: u64,
    last_trade_at: Option<DateTime<Utc>>,
    tx_times: VecDeque<DateTime<Utc>>,
    api_times: VecDeque<DateTime<Utc>>,
}

impl CircuitBreaker {
    pub fn new(limits: CircuitBreakerLimits) -> Self {
        Self {
            limits,
            open_positions: 0,
            per_pool: HashMap::new(),
            exposure_lamports: 0,
            last_trade_at: None,
            tx_times: VecDeque::new(),
            api_times: VecDeque::new(),
        }
    }

    pub fn can_open(&mut self, pool_address: &str, amount_lamports: u64) -> BreakerDecision {
        self.can_open_at(pool_address, amount_lamports, Utc::now())
    }

    /// Checks run in order: total positions, per-pool positions, single
    /// position cap, exposure cap, tx rate, trade cooldown.
    pub fn can_open_at(
        &mut self,
        pool_address: &str,
        amount_lamports: u64,
        now: DateTime<Utc>,
    ) -> BreakerDecision {
        self.prune(now);

        if self.open_positions >= self.limits.max_open_positions {
            return BreakerDecision::deny(format!(
                "Max open positions reached ({})",
                self.limits.max_open_positions
            ));
        }

        let pool_count = self.per_pool.get(pool_address).copied().unwrap_or(0);
        if pool_count >= self.limits.max_positions_per_pool {
            return BreakerDecision::deny(format!(
                "Max positions for pool {} reached ({})",
                pool_address, self.limits.max_positions_per_pool
            ));
        }

        if amount_lamports > self.limits.max_position_lamports {
            return BreakerDecision::deny(format!(
                "Position size {} exceeds cap {}",
                amount_lamports, self.limits.max_position_lamports
            ));
        }

        if self.exposure_lamports + amount_lamports > self.limits.max_exposure_lamports {
            return BreakerDecision::deny(format!(
                "Exposure {} + {} would exceed cap {}",
                self.exposure_lamports, amount_lamports, self.limits.max_exposure_lamports
            ));
        }

        if self.tx_times.len() >= self.limits.max_tx_per_minute {
            return BreakerDecision::deny(format!(
                "Transaction rate limit reached ({}/min)",
                self.limits.max_tx_per_minute
            ));
        }

        if let Some(last) = self.last_trade_at {
            let elapsed_ms = (now - last).num_milliseconds();
            if elapsed_ms < self.limits.trade_cooldown_ms {
                return BreakerDecision::deny(format!(
                    "Trade cooldown: {} ms since last trade (min {})",
                    elapsed_ms, self.limits.trade_cooldown_ms
                ));
            }
        }

        BreakerDecision::allow()
    }

    pub fn record_position_opened(&mut self, pool_address: &str, amount_lamports: u64) {
        self.record_position_opened_at(pool_address, amount_lamports, Utc::now());
    }

    pub fn record_position_opened_at(
        &mut self,
        pool_address: &str,
        amount_lamports: u64,
        now: DateTime<Utc>,
    ) {
        self.open_positions += 1;
        *self.per_pool.entry(pool_address.to_string()).or_insert(0) += 1;
        self.exposure_lamports += amount_lamports;
        self.last_trade_at = Some(now);
        self.tx_times.push_back(now);
        self.prune(now);
    }

    /// Closed exposure is clamped at zero to tolerate amount mismatches
    /// between what was observed opened and what the close reports.
    pub fn record_position_closed(&mut self, pool_address: &str, amount_lamports: u64) {
        self.open_positions = self.open_positions.saturating_sub(1);
        if let Some(count) = self.per_pool.get_mut(pool_address) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.per_pool.remove(pool_address);
            }
        }
        self.exposure_lamports = self.exposure_lamports.saturating_sub(amount_lamports);
    }

    /// Rebuild counts and exposure from an authoritative position list
    pub fn sync_with(&mut self, positions: &[TrackedPosition]) {
        self.open_positions = positions.len();
        self.per_pool.clear();
        self.exposure_lamports = 0;
        for p in positions {
            *self.per_pool.entry(p.pool_address.clone()).or_insert(0) += 1;
            self.exposure_lamports += p.entry_value_lamports();
        }
        tracing::info!(
            positions = self.open_positions,
            exposure = self.exposure_lamports,
            "Circuit breaker synced from active positions"
        );
    }

    pub fn can_make_api_call(&mut self) -> bool {
        self.can_make_api_call_at(Utc::now())
    }

    pub fn can_make_api_call_at(&mut self, now: DateTime<Utc>) -> bool {
        self.prune(now);
        if self.api_times.len() >= self.limits.max_api_calls_per_minute {
            return false;
        }
        self.api_times.push_back(now);
        true
    }

    pub fn exposure_lamports(&self) -> u64 {
        self.exposure_lamports
    }

    pub fn open_positions(&self) -> usize {
        self.open_positions
    }

    pub fn state(&self) -> CircuitBreakerState {
        CircuitBreakerState {
            open_positions: self.open_positions,
            positions_per_pool: self.per_pool.clone(),
            exposure_lamports: self.exposure_lamports,
            last_trade_at: self.last_trade_at,
            tx_in_last_minute: self.tx_times.len(),
        }
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - Duration::minutes(1);
        while self.tx_times.front().map_or(false, |t| *t <= cutoff) {
            self.tx_times.pop_front();
        }
        while self.api_times.front().map_or(false, |t| *t <= cutoff) {
            self.api_times.pop_front();
        }
    }
}
