//! Remote Predictor Port
//!
//! Contract for the entry-probability model service. Both methods swallow
//! transport failures: a `None` tells the engine to fall back to rule-based
//! scoring, never to stop scanning.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::position::EntryFeatures;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictorHealth {
    pub status: String,
    pub model: String,
    pub version: String,
    pub threshold: f64,
    #[serde(default)]
    pub feature_names: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    pub probability: f64,
    pub recommendation: String,
    pub confidence: f64,
    #[serde(default)]
    pub pool_address: Option<String>,
}

impl Prediction {
    /// Whether the model recommends entering
    pub fn recommends_entry(&self) -> bool {
        self.recommendation.eq_ignore_ascii_case("enter")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchPrediction {
    pub predictions: Vec<Prediction>,
    pub model: String,
    pub threshold: f64,
}

#[async_trait]
pub trait Predictor: Send + Sync {
    /// Cached model health; None while the service is unreachable
    async fn health(&self) -> Option<PredictorHealth>;

    /// Batch-predict entry probabilities for feature rows. Row order
    /// matches the input order. None on any failure.
    async fn predict(
        &self,
        features: &[EntryFeatures],
        pool_addresses: &[String],
    ) -> Option<BatchPrediction>;
}
