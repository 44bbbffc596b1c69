//! Rule-Based Market Scoring
//!
//! A pure scorer over pool metrics. Four sub-scores in [0, 100] are
//! weighted, summed and doubled so the admission threshold sits in the
//! familiar 150 regime. Weights, liquidity buckets and thresholds are
//! scorer parameters so they can be tested against calibration data.

use serde::{Deserialize, Serialize};

use crate::ports::pool_api::PoolInfo;

/// Relative weight of each sub-score
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScoreWeights {
    pub volume: f64,
    pub liquidity: f64,
    pub fee_tvl: f64,
    pub momentum: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            volume: 0.35,
            liquidity: 0.20,
            fee_tvl: 0.25,
            momentum: 0.20,
        }
    }
}

/// Hand-tuned liquidity sweet spot: pools inside [ideal_min, ideal_max]
/// score full marks, decaying towards the hard bounds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LiquidityBuckets {
    pub ideal_min_usd: f64,
    pub ideal_max_usd: f64,
}

impl Default for LiquidityBuckets {
    fn default() -> Self {
        Self {
            ideal_min_usd: 50_000.0,
            ideal_max_usd: 500_000.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScoreVerdict {
    Enter,
    Wait,
    Skip,
}

/// Computed score breakdown for one pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketScore {
    pub total: f64,
    pub volume_score: f64,
    pub liquidity_score: f64,
    pub fee_tvl_score: f64,
    pub momentum_score: f64,
    pub verdict: ScoreVerdict,
}

#[derive(Debug, Clone)]
pub struct MarketScorer {
    weights: ScoreWeights,
    buckets: LiquidityBuckets,
    enter_threshold: f64,
    wait_threshold: f64,
}

impl Default for MarketScorer {
    fn default() -> Self {
        Self {
            weights: ScoreWeights::default(),
            buckets: LiquidityBuckets::default(),
            enter_threshold: 150.0,
            wait_threshold: 100.0,
        }
    }
}

impl MarketScorer {
    pub fn new(weights: ScoreWeights, buckets: LiquidityBuckets) -> Self {
        Self {
            weights,
            buckets,
            ..Self::default()
        }
    }

    pub fn with_thresholds(mut self, enter: f64, wait: f64) -> Self {
        self.enter_threshold = enter;
        self.wait_threshold = wait;
        self
    }

    /// Score a pool. Pure: no I/O, no clock.
    pub fn score(&self, pool: &PoolInfo) -> MarketScore {
        let volume_score = Self::volume_score(pool.volume_24h);
        let liquidity_score = self.liquidity_score(pool.liquidity_usd);
        let fee_tvl_score = Self::fee_tvl_score(pool.fees_24h, pool.liquidity_usd);
        let momentum_score = Self::momentum_score(pool.apr);

        let weighted = volume_score * self.weights.volume
            + liquidity_score * self.weights.liquidity
            + fee_tvl_score * self.weights.fee_tvl
            + momentum_score * self.weights.momentum;

        let total = weighted * 2.0;

        let verdict = if total >= self.enter_threshold {
            ScoreVerdict::Enter
        } else if total >= self.wait_threshold {
            ScoreVerdict::Wait
        } else {
            ScoreVerdict::Skip
        };

        MarketScore {
            total,
            volume_score,
            liquidity_score,
            fee_tvl_score,
            momentum_score,
            verdict,
        }
    }

    /// 24h-volume sub-score, saturating at $1M
    fn volume_score(volume_24h: f64) -> f64 {
        if volume_24h <= 0.0 {
            return 0.0;
        }
        match volume_24h {
            v if v >= 1_000_000.0 => 100.0,
            v if v >= 500_000.0 => 85.0,
            v if v >= 250_000.0 => 70.0,
            v if v >= 100_000.0 => 55.0,
            v if v >= 50_000.0 => 40.0,
            v => (v / 50_000.0) * 40.0,
        }
    }

    /// Sweet-spot liquidity sub-score: full inside the ideal band, linear
    /// decay below, gentle decay above (deep pools dilute fee share).
    fn liquidity_score(&self, liquidity_usd: f64) -> f64 {
        if liquidity_usd <= 0.0 {
            return 0.0;
        }
        if liquidity_usd < self.buckets.ideal_min_usd {
            (liquidity_usd / self.buckets.ideal_min_usd) * 100.0
        } else if liquidity_usd <= self.buckets.ideal_max_usd {
            100.0
        } else {
            let over = liquidity_usd / self.buckets.ideal_max_usd;
            (100.0 / over).max(20.0)
        }
    }

    /// Daily fee yield against TVL; 5%/day saturates
    fn fee_tvl_score(fees_24h: f64, liquidity_usd: f64) -> f64 {
        let ratio = fees_24h / liquidity_usd.max(1.0);
        ((ratio / 0.05) * 100.0).min(100.0)
    }

    /// APR-based momentum; 200% APR saturates
    fn momentum_score(apr: f64) -> f64 {
        if apr <= 0.0 {
            return 0.0;
        }
        (apr / 2.0).min(100.0)
    }
}
