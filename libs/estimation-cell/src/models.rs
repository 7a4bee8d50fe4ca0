use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use queue_cell::{ClinicQueueConfig, HistoricalAverages, QueueEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DisruptionType {
    LateArrival,
    NoShow,
    PatientReturned,
    LongerThanExpected,
    ShorterThanExpected,
    QueueOverride,
    EmergencyInserted,
    AppointmentRunningOver,
}

/// One recorded schedule disruption, buffered per clinic until the next
/// recalculation consumes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Disruption {
    pub kind: DisruptionType,
    pub appointment_id: Uuid,
    pub clinic_id: Uuid,
    pub detail: String,
    pub detected_at: DateTime<Utc>,
}

impl Disruption {
    pub fn new(kind: DisruptionType, appointment_id: Uuid, clinic_id: Uuid, detail: impl Into<String>) -> Self {
        Self {
            kind,
            appointment_id,
            clinic_id,
            detail: detail.into(),
            detected_at: Utc::now(),
        }
    }
}

/// One reason found while inspecting a single entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisruptionReason {
    pub kind: DisruptionType,
    /// Signed deviation in whole minutes where the reason has one, e.g.
    /// minutes late or minutes over the estimated duration.
    pub delta_minutes: Option<i64>,
    pub detail: String,
}

/// Outcome of a disruption inspection for one queue entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisruptionCheck {
    pub has_disruption: bool,
    pub reasons: Vec<DisruptionReason>,
    /// Whether the existing prediction is still worth showing to the
    /// patient while a fresh one is pending.
    pub should_show_estimation: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EstimationMode {
    Ml,
    RuleBased,
    HistoricalAverage,
    Fallback,
}

impl EstimationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            EstimationMode::Ml => "ml",
            EstimationMode::RuleBased => "rule-based",
            EstimationMode::HistoricalAverage => "historical-average",
            EstimationMode::Fallback => "fallback",
        }
    }
}

/// A wait-time prediction for one waiting patient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitTimeEstimation {
    pub wait_time_minutes: i32,
    /// 0.0 to 1.0.
    pub confidence: f64,
    pub mode: EstimationMode,
    pub explanation: Option<String>,
}

impl WaitTimeEstimation {
    /// Last-resort estimation when every estimator stage fails.
    pub fn static_default() -> Self {
        Self {
            wait_time_minutes: 15,
            confidence: 0.3,
            mode: EstimationMode::Fallback,
            explanation: Some("static default".to_string()),
        }
    }
}

/// Everything an estimator may look at for one entry. Assembled once per
/// recalculation so estimators never touch the store themselves.
#[derive(Debug, Clone)]
pub struct EstimationContext {
    pub entry: QueueEntry,
    /// Waiting entries ranked ahead of this one in the same clinic-day.
    pub patients_ahead: usize,
    /// Consultations currently underway at the clinic.
    pub in_progress: usize,
    pub historical: HistoricalAverages,
    pub config: ClinicQueueConfig,
}

/// Wire shape returned by the external prediction service.
#[derive(Debug, Clone, Deserialize)]
pub struct MlPrediction {
    pub wait_time_minutes: i32,
    pub confidence: f64,
    #[serde(default)]
    pub explanation: Option<Value>,
}
