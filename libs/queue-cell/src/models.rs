use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Appointment lifecycle. Absence is not a status of its own: an absent
/// patient stays in `Waiting` with `is_present = false` and an open
/// `AbsentPatientRecord`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AppointmentStatus {
    Scheduled,
    Waiting,
    InProgress,
    Completed,
    Cancelled,
    NoShow,
    Rescheduled,
}

impl AppointmentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AppointmentStatus::Completed
                | AppointmentStatus::Cancelled
                | AppointmentStatus::NoShow
                | AppointmentStatus::Rescheduled
        )
    }

    pub fn can_transition_to(&self, target: &AppointmentStatus) -> bool {
        use AppointmentStatus::*;
        match (self, target) {
            (Scheduled, Waiting) => true,
            (Scheduled, Cancelled | NoShow | Rescheduled) => true,
            (Waiting, InProgress) => true,
            (Waiting, Cancelled | NoShow | Rescheduled) => true,
            (InProgress, Completed) => true,
            _ => false,
        }
    }
}

/// Scheduling mode of a clinic. Legacy configurations still carry the
/// `fixed` and `hybrid` labels; both parse as slotted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueMode {
    Slotted,
    Fluid,
}

impl QueueMode {
    pub fn parse(raw: &str) -> Result<Self, String> {
        match raw.to_ascii_lowercase().as_str() {
            "slotted" | "fixed" | "hybrid" => Ok(QueueMode::Slotted),
            "fluid" => Ok(QueueMode::Fluid),
            other => Err(format!("unknown queue mode: {}", other)),
        }
    }
}

impl<'de> Deserialize<'de> for QueueMode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        QueueMode::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// An appointment as it sits in a clinic's daily queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: Uuid,
    pub clinic_id: Uuid,
    pub staff_id: Uuid,
    pub patient_id: Uuid,
    pub appointment_date: NaiveDate,
    pub scheduled_time: DateTime<Utc>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// 1-based rank, unique among active entries for a clinic-day.
    pub queue_position: i32,
    pub original_queue_position: i32,
    pub status: AppointmentStatus,
    pub is_present: bool,
    pub skip_count: i32,
    pub skip_reason: Option<String>,
    /// Set when staff calls the patient into the room, not on self check-in.
    pub checked_in_at: Option<DateTime<Utc>>,
    pub actual_end_time: Option<DateTime<Utc>>,
    pub estimated_duration_minutes: i32,
    pub predicted_wait_time: Option<i32>,
    pub predicted_start_time: Option<DateTime<Utc>>,
    pub prediction_mode: Option<String>,
    pub prediction_confidence: Option<f64>,
    pub last_prediction_update: Option<DateTime<Utc>>,
    /// Fluid mode only.
    pub priority_score: Option<f64>,
    pub marked_absent_at: Option<DateTime<Utc>>,
    pub returned_at: Option<DateTime<Utc>>,
    pub is_walk_in: bool,
    pub is_emergency: bool,
}

impl QueueEntry {
    pub fn has_open_absence(&self) -> bool {
        !self.is_present && self.marked_absent_at.is_some() && self.returned_at.is_none()
    }

    pub fn was_repositioned(&self) -> bool {
        self.original_queue_position != self.queue_position
    }
}

/// Partial update applied to a queue entry row; `None` fields are untouched.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueEntryPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<AppointmentStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_present: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checked_in_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_count: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority_score: Option<f64>,
}

/// Prediction write-back for one appointment, batched by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionPatch {
    pub appointment_id: Uuid,
    pub predicted_wait_time: i32,
    pub predicted_start_time: DateTime<Utc>,
    pub prediction_mode: String,
    pub prediction_confidence: f64,
    pub last_prediction_update: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitlistStatus {
    Waiting,
    Notified,
    Promoted,
    Expired,
    Cancelled,
}

/// Walk-in candidate waiting for a freed slot. Consumed by the slotted
/// strategy as a higher-priority source than scheduled walk-ins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitlistEntry {
    pub id: Uuid,
    pub clinic_id: Uuid,
    pub patient_id: Uuid,
    pub date: NaiveDate,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub priority_score: f64,
    pub status: WaitlistStatus,
}

/// Audit of one absence episode. At most one open (unreturned, not
/// auto-cancelled) record may exist per appointment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbsentPatientRecord {
    pub id: Uuid,
    pub appointment_id: Uuid,
    pub clinic_id: Uuid,
    pub marked_absent_at: DateTime<Utc>,
    pub grace_period_ends_at: DateTime<Utc>,
    pub returned_at: Option<DateTime<Utc>>,
    pub auto_cancelled: bool,
}

impl AbsentPatientRecord {
    pub fn is_open(&self) -> bool {
        self.returned_at.is_none() && !self.auto_cancelled
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueOverrideAction {
    PatientCalled,
    MarkedAbsent,
    Returned,
    Reordered,
    Completed,
    WaitlistPromoted,
}

/// Append-only audit row for every manual or automatic queue mutation.
/// Never updated after insertion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueOverride {
    pub id: Uuid,
    pub appointment_id: Uuid,
    pub clinic_id: Uuid,
    pub action: QueueOverrideAction,
    pub previous_position: Option<i32>,
    pub new_position: Option<i32>,
    pub performed_by: String,
    pub reason: Option<String>,
    pub previous_state: Value,
    pub new_state: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClinicQueueConfig {
    pub clinic_id: Uuid,
    pub mode: QueueMode,
    pub waitlist_enabled: bool,
    pub ml_enabled: bool,
    pub ml_min_confidence: f64,
    pub default_duration_minutes: i32,
}

impl ClinicQueueConfig {
    pub fn slotted(clinic_id: Uuid) -> Self {
        Self {
            clinic_id,
            mode: QueueMode::Slotted,
            waitlist_enabled: false,
            ml_enabled: false,
            ml_min_confidence: 0.6,
            default_duration_minutes: 15,
        }
    }
}

/// Aggregated analytics for one staff member, read by the estimators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoricalAverages {
    pub avg_consultation_minutes: f64,
    pub avg_wait_minutes: f64,
    pub sample_size: i64,
}

// ---------------------------------------------------------------------------
// Request DTOs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateAppointmentRequest {
    pub clinic_id: Uuid,
    pub staff_id: Uuid,
    pub patient_id: Uuid,
    pub appointment_date: NaiveDate,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub estimated_duration_minutes: Option<i32>,
    #[serde(default)]
    pub is_walk_in: bool,
    #[serde(default)]
    pub is_emergency: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallNextPatientRequest {
    pub clinic_id: Uuid,
    pub staff_id: Uuid,
    pub date: NaiveDate,
    pub performed_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkAbsentRequest {
    pub appointment_id: Uuid,
    pub reason: Option<String>,
    /// Minutes before the absence may be auto-cancelled; defaults to 30.
    pub grace_period_minutes: Option<i64>,
    pub performed_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReorderQueueRequest {
    pub appointment_id: Uuid,
    pub new_position: i32,
    pub reason: Option<String>,
    pub performed_by: String,
}
