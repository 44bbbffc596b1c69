//! Upstream Pool API Port
//!
//! The DLMM pool-universe API the shared cache fronts. Implementations:
//! the HTTP adapter in production, a recording mock in tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum PoolApiError {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("Response decoding failed: {0}")]
    Decode(String),

    #[error("Pool not found: {0}")]
    NotFound(String),
}

/// One pool record as reported by the upstream API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolInfo {
    pub address: String,
    pub name: String,
    pub mint_x: String,
    pub mint_y: String,
    /// Geometric price increment between adjacent bins, in basis points
    pub bin_step: u16,
    /// Current price of X in Y
    pub current_price: f64,
    pub liquidity_usd: f64,
    pub volume_30m: f64,
    pub volume_1h: f64,
    pub volume_2h: f64,
    pub volume_4h: f64,
    pub volume_24h: f64,
    pub fees_30m: f64,
    pub fees_1h: f64,
    pub fees_24h: f64,
    pub apr: f64,
    /// Flagged by the API operator; never a candidate
    #[serde(default)]
    pub blacklisted: bool,
}

/// Active-bin snapshot for a pool
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ActiveBin {
    pub bin_id: i32,
    pub price: f64,
}

#[async_trait]
pub trait PoolApi: Send + Sync {
    /// Fetch the full pool universe
    async fn fetch_all_pools(&self) -> Result<Vec<PoolInfo>, PoolApiError>;

    /// Fetch a single pool by address
    async fn fetch_pool(&self, address: &str) -> Result<PoolInfo, PoolApiError>;
}
