//! HTTP Pool API Client
//!
//! Thin `reqwest` client for the upstream DLMM pool API. All freshness,
//! rate limiting and retry behaviour lives in the shared cache; this
//! adapter only speaks the wire format.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use crate::ports::pool_api::{PoolApi, PoolApiError, PoolInfo};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Upstream wire format for one pool
#[derive(Debug, Deserialize)]
struct ApiPool {
    address: String,
    name: String,
    mint_x: String,
    mint_y: String,
    bin_step: u16,
    current_price: f64,
    liquidity: f64,
    #[serde(default)]
    volume_30m: f64,
    #[serde(default)]
    volume_1h: f64,
    #[serde(default)]
    volume_2h: f64,
    #[serde(default)]
    volume_4h: f64,
    #[serde(default)]
    volume_24h: f64,
    #[serde(default)]
    fees_30m: f64,
    #[serde(default)]
    fees_1h: f64,
    #[serde(default)]
    fees_24h: f64,
    #[serde(default)]
    apr: f64,
    #[serde(default)]
    is_blacklisted: bool,
}

impl From<ApiPool> for PoolInfo {
    fn from(p: ApiPool) -> Self {
        PoolInfo {
            address: p.address,
            name: p.name,
            mint_x: p.mint_x,
            mint_y: p.mint_y,
            bin_step: p.bin_step,
            current_price: p.current_price,
            liquidity_usd: p.liquidity,
            volume_30m: p.volume_30m,
            volume_1h: p.volume_1h,
            volume_2h: p.volume_2h,
            volume_4h: p.volume_4h,
            volume_24h: p.volume_24h,
            fees_30m: p.fees_30m,
            fees_1h: p.fees_1h,
            fees_24h: p.fees_24h,
            apr: p.apr,
            blacklisted: p.is_blacklisted,
        }
    }
}

pub struct HttpPoolApi {
    base_url: String,
    client: reqwest::Client,
}

impl HttpPoolApi {
    pub fn new(base_url: impl Into<String>) -> Result<Self, PoolApiError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| PoolApiError::Http(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            client,
        })
    }
}

#[async_trait]
impl PoolApi for HttpPoolApi {
    async fn fetch_all_pools(&self) -> Result<Vec<PoolInfo>, PoolApiError> {
        let url = format!("{}/pools", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| PoolApiError::Http(e.to_string()))?;

        if !response.status().is_success() {
            return Err(PoolApiError::Http(format!(
                "GET /pools returned {}",
                response.status()
            )));
        }

        let pools: Vec<ApiPool> = response
            .json()
            .await
            .map_err(|e| PoolApiError::Decode(e.to_string()))?;

        Ok(pools.into_iter().map(PoolInfo::from).collect())
    }

    async fn fetch_pool(&self, address: &str) -> Result<PoolInfo, PoolApiError> {
        let url = format!("{}/pools/{}", self.base_url, address);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| PoolApiError::Http(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(PoolApiError::NotFound(address.to_string()));
        }

        if !response.status().is_success() {
            return Err(PoolApiError::Http(format!(
                "GET /pools/{} returned {}",
                address,
                response.status()
            )));
        }

        let pool: ApiPool = response
            .json()
            .await
            .map_err(|e| PoolApiError::Decode(e.to_string()))?;

        Ok(pool.into())
    }
}
