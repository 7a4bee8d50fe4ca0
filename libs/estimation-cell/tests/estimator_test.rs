use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use estimation_cell::{
    EstimationChain, EstimationContext, EstimationMode, HistoricalAverageEstimator,
    MlWaitTimeEstimator, RuleBasedEstimator,
};
use queue_cell::testing::entry_fixture;
use queue_cell::{ClinicQueueConfig, HistoricalAverages};

fn context(ml_enabled: bool) -> EstimationContext {
    let clinic_id = Uuid::new_v4();
    let mut config = ClinicQueueConfig::slotted(clinic_id);
    config.ml_enabled = ml_enabled;

    EstimationContext {
        entry: entry_fixture(clinic_id, Uuid::new_v4(), 4, Utc::now()),
        patients_ahead: 3,
        in_progress: 1,
        historical: HistoricalAverages {
            avg_consultation_minutes: 10.0,
            avg_wait_minutes: 22.4,
            sample_size: 40,
        },
        config,
    }
}

fn chain_against(server: &MockServer, ttl: Duration) -> EstimationChain {
    EstimationChain::new(
        Arc::new(MlWaitTimeEstimator::with_base_url(server.uri(), 0.6)),
        Arc::new(RuleBasedEstimator),
        Arc::new(HistoricalAverageEstimator),
        ttl,
    )
}

#[tokio::test]
async fn confident_ml_prediction_wins() {
    let server = MockServer::start().await;
    let ctx = context(true);

    Mock::given(method("POST"))
        .and(path("/predict"))
        .and(body_partial_json(json!({ "appointment_id": ctx.entry.id })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "wait_time_minutes": 23,
            "confidence": 0.91
        })))
        .expect(1)
        .mount(&server)
        .await;

    let estimation = chain_against(&server, Duration::from_secs(30))
        .estimate(&ctx)
        .await;

    assert_eq!(estimation.mode, EstimationMode::Ml);
    assert_eq!(estimation.wait_time_minutes, 23);
    assert!((estimation.confidence - 0.91).abs() < f64::EPSILON);
}

#[tokio::test]
async fn ml_failure_never_propagates() {
    let server = MockServer::start().await;
    let ctx = context(true);

    Mock::given(method("POST"))
        .and(path("/predict"))
        .respond_with(ResponseTemplate::new(500).set_body_string("model crashed"))
        .expect(1)
        .mount(&server)
        .await;

    let estimation = chain_against(&server, Duration::from_secs(30))
        .estimate(&ctx)
        .await;

    assert!(matches!(
        estimation.mode,
        EstimationMode::RuleBased | EstimationMode::HistoricalAverage | EstimationMode::Fallback
    ));
}

#[tokio::test]
async fn low_confidence_ml_prediction_is_discarded() {
    let server = MockServer::start().await;
    let ctx = context(true);

    Mock::given(method("POST"))
        .and(path("/predict"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "wait_time_minutes": 5,
            "confidence": 0.2
        })))
        .expect(1)
        .mount(&server)
        .await;

    let estimation = chain_against(&server, Duration::from_secs(30))
        .estimate(&ctx)
        .await;

    assert_eq!(estimation.mode, EstimationMode::RuleBased);
}

#[tokio::test]
async fn ml_is_skipped_when_clinic_disables_it() {
    let server = MockServer::start().await;
    let ctx = context(false);

    Mock::given(method("POST"))
        .and(path("/predict"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "wait_time_minutes": 1,
            "confidence": 0.99
        })))
        .expect(0)
        .mount(&server)
        .await;

    let estimation = chain_against(&server, Duration::from_secs(30))
        .estimate(&ctx)
        .await;

    // Three patients ahead at ten minutes each, plus half a visit for the
    // consultation underway.
    assert_eq!(estimation.mode, EstimationMode::RuleBased);
    assert_eq!(estimation.wait_time_minutes, 35);
    assert!((estimation.confidence - 0.65).abs() < 1e-9);
}

#[tokio::test]
async fn historical_average_backs_up_the_rules() {
    let server = MockServer::start().await;
    let mut ctx = context(false);
    // Averages exist but the per-visit duration is unusable.
    ctx.historical.avg_consultation_minutes = 0.0;
    ctx.config.default_duration_minutes = 0;

    let estimation = chain_against(&server, Duration::from_secs(30))
        .estimate(&ctx)
        .await;

    assert_eq!(estimation.mode, EstimationMode::HistoricalAverage);
    assert_eq!(estimation.wait_time_minutes, 22);
    assert!((estimation.confidence - 0.5).abs() < f64::EPSILON);
}

#[tokio::test]
async fn static_default_when_every_stage_fails() {
    let server = MockServer::start().await;
    let mut ctx = context(false);
    ctx.historical = HistoricalAverages {
        avg_consultation_minutes: 0.0,
        avg_wait_minutes: 0.0,
        sample_size: 0,
    };
    ctx.config.default_duration_minutes = 0;

    let estimation = chain_against(&server, Duration::from_secs(30))
        .estimate(&ctx)
        .await;

    assert_eq!(estimation.mode, EstimationMode::Fallback);
    assert_eq!(estimation.wait_time_minutes, 15);
    assert!((estimation.confidence - 0.3).abs() < f64::EPSILON);
}

#[tokio::test]
async fn duplicate_requests_inside_the_ttl_hit_the_cache() {
    let server = MockServer::start().await;
    let ctx = context(true);

    Mock::given(method("POST"))
        .and(path("/predict"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "wait_time_minutes": 18,
            "confidence": 0.8
        })))
        .expect(1)
        .mount(&server)
        .await;

    let chain = chain_against(&server, Duration::from_secs(30));
    let first = chain.estimate(&ctx).await;
    let second = chain.estimate(&ctx).await;

    assert_eq!(first.wait_time_minutes, second.wait_time_minutes);
}

#[tokio::test]
async fn estimate_fresh_bypasses_the_cache() {
    let server = MockServer::start().await;
    let ctx = context(true);

    Mock::given(method("POST"))
        .and(path("/predict"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "wait_time_minutes": 18,
            "confidence": 0.8
        })))
        .expect(2)
        .mount(&server)
        .await;

    let chain = chain_against(&server, Duration::from_secs(30));
    chain.estimate(&ctx).await;
    chain.estimate_fresh(&ctx).await;
}

#[tokio::test]
async fn cached_estimations_expire_after_the_ttl() {
    let server = MockServer::start().await;
    let ctx = context(true);

    Mock::given(method("POST"))
        .and(path("/predict"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "wait_time_minutes": 18,
            "confidence": 0.8
        })))
        .expect(2)
        .mount(&server)
        .await;

    let chain = chain_against(&server, Duration::from_millis(40));
    chain.estimate(&ctx).await;
    tokio::time::sleep(Duration::from_millis(60)).await;
    chain.estimate(&ctx).await;
}
