use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use shared_config::AppConfig;

use crate::error::EstimationError;
use crate::models::{EstimationContext, EstimationMode, MlPrediction, WaitTimeEstimation};

/// One stage of the fallback chain.
#[async_trait]
pub trait WaitTimeEstimator: Send + Sync {
    async fn estimate(
        &self,
        context: &EstimationContext,
    ) -> Result<WaitTimeEstimation, EstimationError>;

    fn is_available(&self) -> bool {
        true
    }

    fn mode(&self) -> EstimationMode;

    /// Minimum confidence below which the chain discards this stage's
    /// result and falls through.
    fn min_confidence(&self) -> f64 {
        0.0
    }
}

/// Calls the external prediction service. The service owns all feature
/// computation; the request carries only the appointment identifier.
pub struct MlWaitTimeEstimator {
    client: reqwest::Client,
    base_url: String,
    min_confidence: f64,
}

impl MlWaitTimeEstimator {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.ml_service_url.trim_end_matches('/').to_string(),
            min_confidence: config.ml_min_confidence,
        }
    }

    pub fn with_base_url(base_url: impl Into<String>, min_confidence: f64) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            min_confidence,
        }
    }
}

#[async_trait]
impl WaitTimeEstimator for MlWaitTimeEstimator {
    #[instrument(skip(self, context), fields(appointment_id = %context.entry.id))]
    async fn estimate(
        &self,
        context: &EstimationContext,
    ) -> Result<WaitTimeEstimation, EstimationError> {
        if !self.is_available() {
            return Err(EstimationError::Unavailable(
                "prediction service URL not configured".to_string(),
            ));
        }

        let response = self
            .client
            .post(format!("{}/predict", self.base_url))
            .json(&json!({ "appointment_id": context.entry.id }))
            .send()
            .await
            .map_err(|e| EstimationError::Service(format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(EstimationError::Service(format!(
                "prediction service returned {}",
                response.status()
            )));
        }

        let prediction: MlPrediction = response
            .json()
            .await
            .map_err(|e| EstimationError::Service(format!("invalid prediction body: {}", e)))?;

        Ok(WaitTimeEstimation {
            wait_time_minutes: prediction.wait_time_minutes.max(0),
            confidence: prediction.confidence.clamp(0.0, 1.0),
            mode: EstimationMode::Ml,
            explanation: prediction.explanation.map(|e| e.to_string()),
        })
    }

    fn is_available(&self) -> bool {
        !self.base_url.is_empty()
    }

    fn mode(&self) -> EstimationMode {
        EstimationMode::Ml
    }

    fn min_confidence(&self) -> f64 {
        self.min_confidence
    }
}

/// Queue arithmetic: patients ahead times the per-visit average, plus a
/// half-visit allowance for a consultation already underway.
pub struct RuleBasedEstimator;

#[async_trait]
impl WaitTimeEstimator for RuleBasedEstimator {
    async fn estimate(
        &self,
        context: &EstimationContext,
    ) -> Result<WaitTimeEstimation, EstimationError> {
        let per_visit = if context.historical.sample_size > 0 {
            context.historical.avg_consultation_minutes
        } else {
            f64::from(context.config.default_duration_minutes)
        };
        if per_visit <= 0.0 {
            return Err(EstimationError::MissingData(
                "no usable consultation duration".to_string(),
            ));
        }

        let mut wait = context.patients_ahead as f64 * per_visit;
        if context.in_progress > 0 {
            wait += per_visit / 2.0;
        }

        let confidence = (0.8 - 0.05 * context.patients_ahead as f64).clamp(0.4, 0.8);

        Ok(WaitTimeEstimation {
            wait_time_minutes: wait.round() as i32,
            confidence,
            mode: EstimationMode::RuleBased,
            explanation: Some(format!(
                "{} ahead at {:.0} min per visit",
                context.patients_ahead, per_visit
            )),
        })
    }

    fn mode(&self) -> EstimationMode {
        EstimationMode::RuleBased
    }
}

/// Serves the staff member's observed average wait as-is.
pub struct HistoricalAverageEstimator;

#[async_trait]
impl WaitTimeEstimator for HistoricalAverageEstimator {
    async fn estimate(
        &self,
        context: &EstimationContext,
    ) -> Result<WaitTimeEstimation, EstimationError> {
        if context.historical.sample_size == 0 {
            return Err(EstimationError::MissingData(
                "no historical samples for staff member".to_string(),
            ));
        }

        Ok(WaitTimeEstimation {
            wait_time_minutes: context.historical.avg_wait_minutes.round().max(0.0) as i32,
            confidence: 0.5,
            mode: EstimationMode::HistoricalAverage,
            explanation: Some(format!(
                "average of {} past visits",
                context.historical.sample_size
            )),
        })
    }

    fn mode(&self) -> EstimationMode {
        EstimationMode::HistoricalAverage
    }
}

/// Runs the stages in order until one produces a usable result. Stage
/// failures stay inside the chain; callers always get an estimation.
pub struct EstimationChain {
    ml: Arc<dyn WaitTimeEstimator>,
    rule_based: Arc<dyn WaitTimeEstimator>,
    historical: Arc<dyn WaitTimeEstimator>,
    cache: Mutex<HashMap<Uuid, (Instant, WaitTimeEstimation)>>,
    cache_ttl: Duration,
}

impl EstimationChain {
    pub fn new(
        ml: Arc<dyn WaitTimeEstimator>,
        rule_based: Arc<dyn WaitTimeEstimator>,
        historical: Arc<dyn WaitTimeEstimator>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            ml,
            rule_based,
            historical,
            cache: Mutex::new(HashMap::new()),
            cache_ttl,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            Arc::new(MlWaitTimeEstimator::new(config)),
            Arc::new(RuleBasedEstimator),
            Arc::new(HistoricalAverageEstimator),
            Duration::from_secs(config.estimation_cache_ttl_seconds),
        )
    }

    /// Serves a cached estimation while it is fresh; otherwise runs the
    /// chain and caches the result.
    pub async fn estimate(&self, context: &EstimationContext) -> WaitTimeEstimation {
        {
            let cache = self.cache.lock().await;
            if let Some((at, cached)) = cache.get(&context.entry.id) {
                if at.elapsed() < self.cache_ttl {
                    debug!(appointment_id = %context.entry.id, "Serving cached estimation");
                    return cached.clone();
                }
            }
        }
        self.estimate_fresh(context).await
    }

    /// Bypasses the cache, used after a disruption invalidates whatever
    /// was displayed. The fresh result replaces the cached one.
    pub async fn estimate_fresh(&self, context: &EstimationContext) -> WaitTimeEstimation {
        let estimation = self.run_chain(context).await;
        self.cache
            .lock()
            .await
            .insert(context.entry.id, (Instant::now(), estimation.clone()));
        estimation
    }

    #[instrument(skip(self, context), fields(appointment_id = %context.entry.id))]
    async fn run_chain(&self, context: &EstimationContext) -> WaitTimeEstimation {
        if context.config.ml_enabled && self.ml.is_available() {
            let min_confidence = self.ml.min_confidence().max(context.config.ml_min_confidence);
            match self.ml.estimate(context).await {
                Ok(estimation) if estimation.confidence >= min_confidence => {
                    return estimation;
                }
                Ok(estimation) => {
                    debug!(
                        confidence = estimation.confidence,
                        minimum = min_confidence,
                        "ML estimation below confidence floor, falling through"
                    );
                }
                Err(e) => {
                    warn!("ML estimator failed: {}", e);
                }
            }
        }

        match self.rule_based.estimate(context).await {
            Ok(estimation) => return estimation,
            Err(e) => warn!("Rule-based estimator failed: {}", e),
        }

        match self.historical.estimate(context).await {
            Ok(estimation) => return estimation,
            Err(e) => warn!("Historical-average estimator failed: {}", e),
        }

        warn!(
            appointment_id = %context.entry.id,
            "All estimators failed, serving static default"
        );
        WaitTimeEstimation::static_default()
    }
}
