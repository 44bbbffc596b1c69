//! Remote Predictor Client
//!
//! HTTP client for the entry-probability model service. A short request
//! timeout keeps a slow model from stalling scans; health responses are
//! cached for thirty seconds; every failure maps to `None` so the engine
//! falls back to rule-based scoring.

use async_trait::async_trait;
use serde::Serialize;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::domain::position::EntryFeatures;
use crate::ports::predictor::{BatchPrediction, Predictor, PredictorHealth};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const HEALTH_TTL: Duration = Duration::from_secs(30);
const API_KEY_HEADER: &str = "X-ML-API-Key";

#[derive(Serialize)]
struct PredictRequest {
    features: Vec<[f64; 12]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pool_addresses: Option<Vec<String>>,
}

pub struct MlClient {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
    health_cache: Mutex<Option<(PredictorHealth, Instant)>>,
}

impl MlClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Option<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .ok()?;
        Some(Self {
            base_url: base_url.into(),
            api_key,
            client,
            health_cache: Mutex::new(None),
        })
    }

    fn with_key(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.header(API_KEY_HEADER, key),
            None => req,
        }
    }

    async fn fetch_health(&self) -> Option<PredictorHealth> {
        let url = format!("{}/health", self.base_url);
        let response = self.with_key(self.client.get(&url)).send().await.ok()?;
        if !response.status().is_success() {
            tracing::debug!(status = %response.status(), "Predictor health check failed");
            return None;
        }
        response.json().await.ok()
    }
}

#[async_trait]
impl Predictor for MlClient {
    async fn health(&self) -> Option<PredictorHealth> {
        {
            let cache = self.health_cache.lock().await;
            if let Some((health, at)) = cache.as_ref() {
                if at.elapsed() < HEALTH_TTL {
                    return Some(health.clone());
                }
            }
        }

        let health = self.fetch_health().await?;
        *self.health_cache.lock().await = Some((health.clone(), Instant::now()));
        Some(health)
    }

    async fn predict(
        &self,
        features: &[EntryFeatures],
        pool_addresses: &[String],
    ) -> Option<BatchPrediction> {
        if features.is_empty() {
            return None;
        }

        let body = PredictRequest {
            features: features.iter().map(|f| f.to_array()).collect(),
            pool_addresses: if pool_addresses.is_empty() {
                None
            } else {
                Some(pool_addresses.to_vec())
            },
        };

        let url = format!("{}/predict", self.base_url);
        let response = match self.with_key(self.client.post(&url)).json(&body).send().await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "Predictor request failed, falling back");
                return None;
            }
        };

        if !response.status().is_success() {
            tracing::warn!(status = %response.status(), "Predictor returned error, falling back");
            return None;
        }

        match response.json::<BatchPrediction>().await {
            Ok(batch) if batch.predictions.len() == features.len() => Some(batch),
            Ok(batch) => {
                tracing::warn!(
                    expected = features.len(),
                    got = batch.predictions.len(),
                    "Predictor row count mismatch, falling back"
                );
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "Predictor response decode failed, falling back");
                None
            }
        }
    }
}
