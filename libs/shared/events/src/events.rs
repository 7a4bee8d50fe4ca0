use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Closed set of domain events emitted by the queue engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueEventType {
    PatientAddedToQueue,
    PatientCheckedIn,
    PatientCalled,
    PatientMarkedAbsent,
    PatientReturned,
    QueuePositionChanged,
    AppointmentStatusChanged,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    pub event_id: Uuid,
    pub event_type: QueueEventType,
    pub appointment_id: Uuid,
    pub clinic_id: Uuid,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent {
    pub fn new(
        event_type: QueueEventType,
        appointment_id: Uuid,
        clinic_id: Uuid,
        payload: Value,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            appointment_id,
            clinic_id,
            payload,
            timestamp: Utc::now(),
        }
    }
}
