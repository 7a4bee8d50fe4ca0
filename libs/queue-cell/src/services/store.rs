use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::Method;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use shared_database::SupabaseClient;

use crate::error::QueueError;
use crate::models::{
    AbsentPatientRecord, ClinicQueueConfig, CreateAppointmentRequest, HistoricalAverages,
    PredictionPatch, QueueEntry, QueueEntryPatch, QueueOverride, WaitlistEntry, WaitlistStatus,
};

/// Repository contract over the external appointment store. Every remote
/// failure surfaces as `QueueError::Database` with the original cause in the
/// message.
#[async_trait]
pub trait AppointmentStore: Send + Sync {
    async fn get_queue_entry_by_id(&self, id: Uuid) -> Result<QueueEntry, QueueError>;

    /// All entries for one staff member on one day, ordered by queue position.
    async fn get_daily_schedule(
        &self,
        staff_id: Uuid,
        date: NaiveDate,
    ) -> Result<Vec<QueueEntry>, QueueError>;

    /// Row creation goes through the store RPC, which also assigns the next
    /// free queue position atomically.
    async fn create_queue_entry(
        &self,
        request: &CreateAppointmentRequest,
    ) -> Result<QueueEntry, QueueError>;

    async fn update_queue_entry(
        &self,
        id: Uuid,
        patch: &QueueEntryPatch,
    ) -> Result<QueueEntry, QueueError>;

    async fn batch_update_predictions(
        &self,
        patches: &[PredictionPatch],
    ) -> Result<(), QueueError>;

    async fn check_in_patient(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<QueueEntry, QueueError>;

    async fn mark_absent(&self, id: Uuid, at: DateTime<Utc>) -> Result<QueueEntry, QueueError>;

    async fn mark_patient_returned(
        &self,
        id: Uuid,
        new_position: i32,
        at: DateTime<Utc>,
    ) -> Result<QueueEntry, QueueError>;

    async fn create_absent_patient(
        &self,
        record: &AbsentPatientRecord,
    ) -> Result<(), QueueError>;

    async fn get_open_absence(
        &self,
        appointment_id: Uuid,
    ) -> Result<Option<AbsentPatientRecord>, QueueError>;

    async fn create_queue_override(&self, row: &QueueOverride) -> Result<(), QueueError>;

    async fn get_next_queue_position(
        &self,
        clinic_id: Uuid,
        date: NaiveDate,
    ) -> Result<i32, QueueError>;

    async fn get_clinic_config_by_staff_id(
        &self,
        staff_id: Uuid,
    ) -> Result<ClinicQueueConfig, QueueError>;

    async fn record_actual_wait_time(
        &self,
        id: Uuid,
        wait_minutes: i64,
        duration_minutes: i64,
    ) -> Result<(), QueueError>;

    /// Present, waiting entries for a clinic-day; the recalculation input.
    async fn get_waiting_appointments(
        &self,
        clinic_id: Uuid,
        date: NaiveDate,
    ) -> Result<Vec<QueueEntry>, QueueError>;

    /// Everything currently in consultation, across clinics; the sweep input.
    async fn get_in_progress_appointments(&self) -> Result<Vec<QueueEntry>, QueueError>;

    async fn get_waitlist(
        &self,
        clinic_id: Uuid,
        date: NaiveDate,
    ) -> Result<Vec<WaitlistEntry>, QueueError>;

    async fn update_waitlist_status(
        &self,
        id: Uuid,
        status: WaitlistStatus,
    ) -> Result<(), QueueError>;

    async fn get_historical_averages(
        &self,
        staff_id: Uuid,
    ) -> Result<HistoricalAverages, QueueError>;
}

/// PostgREST-backed implementation. Carries an optional service token; without
/// one, Supabase rejects the call and the 401 surfaces as a `Database` error.
pub struct SupabaseAppointmentStore {
    supabase: Arc<SupabaseClient>,
    auth_token: Option<String>,
}

impl SupabaseAppointmentStore {
    pub fn new(supabase: Arc<SupabaseClient>, auth_token: Option<String>) -> Self {
        Self {
            supabase,
            auth_token,
        }
    }

    fn token(&self) -> Option<&str> {
        self.auth_token.as_deref()
    }

    fn db_err(e: anyhow::Error) -> QueueError {
        QueueError::Database(e.to_string())
    }

    async fn first_entry(&self, path: &str, what: &str) -> Result<QueueEntry, QueueError> {
        let rows: Vec<QueueEntry> = self
            .supabase
            .request(Method::GET, path, self.token(), None)
            .await
            .map_err(Self::db_err)?;

        rows.into_iter()
            .next()
            .ok_or_else(|| QueueError::NotFound(what.to_string()))
    }
}

#[async_trait]
impl AppointmentStore for SupabaseAppointmentStore {
    async fn get_queue_entry_by_id(&self, id: Uuid) -> Result<QueueEntry, QueueError> {
        let path = format!("/rest/v1/appointments?id=eq.{}&limit=1", id);
        self.first_entry(&path, &format!("appointment {}", id)).await
    }

    async fn get_daily_schedule(
        &self,
        staff_id: Uuid,
        date: NaiveDate,
    ) -> Result<Vec<QueueEntry>, QueueError> {
        let path = format!(
            "/rest/v1/appointments?staff_id=eq.{}&appointment_date=eq.{}&order=queue_position.asc",
            staff_id, date
        );
        self.supabase
            .request(Method::GET, &path, self.token(), None)
            .await
            .map_err(Self::db_err)
    }

    async fn create_queue_entry(
        &self,
        request: &CreateAppointmentRequest,
    ) -> Result<QueueEntry, QueueError> {
        debug!("Creating queue entry for patient {}", request.patient_id);
        self.supabase
            .rpc(
                "create_queue_entry",
                self.token(),
                serde_json::to_value(request)
                    .map_err(|e| QueueError::Database(e.to_string()))?,
            )
            .await
            .map_err(Self::db_err)
    }

    async fn update_queue_entry(
        &self,
        id: Uuid,
        patch: &QueueEntryPatch,
    ) -> Result<QueueEntry, QueueError> {
        let path = format!("/rest/v1/appointments?id=eq.{}", id);
        let body = serde_json::to_value(patch).map_err(|e| QueueError::Database(e.to_string()))?;

        let rows: Vec<QueueEntry> = self
            .supabase
            .request(Method::PATCH, &path, self.token(), Some(body))
            .await
            .map_err(Self::db_err)?;

        rows.into_iter()
            .next()
            .ok_or_else(|| QueueError::NotFound(format!("appointment {}", id)))
    }

    async fn batch_update_predictions(
        &self,
        patches: &[PredictionPatch],
    ) -> Result<(), QueueError> {
        if patches.is_empty() {
            return Ok(());
        }
        debug!("Writing {} prediction patches", patches.len());
        let _: serde_json::Value = self
            .supabase
            .rpc(
                "batch_update_predictions",
                self.token(),
                json!({ "patches": patches }),
            )
            .await
            .map_err(Self::db_err)?;
        Ok(())
    }

    async fn check_in_patient(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<QueueEntry, QueueError> {
        self.supabase
            .rpc(
                "check_in_patient",
                self.token(),
                json!({ "appointment_id": id, "arrived_at": at }),
            )
            .await
            .map_err(Self::db_err)
    }

    async fn mark_absent(&self, id: Uuid, at: DateTime<Utc>) -> Result<QueueEntry, QueueError> {
        self.supabase
            .rpc(
                "mark_patient_absent",
                self.token(),
                json!({ "appointment_id": id, "marked_absent_at": at }),
            )
            .await
            .map_err(Self::db_err)
    }

    async fn mark_patient_returned(
        &self,
        id: Uuid,
        new_position: i32,
        at: DateTime<Utc>,
    ) -> Result<QueueEntry, QueueError> {
        self.supabase
            .rpc(
                "mark_patient_returned",
                self.token(),
                json!({
                    "appointment_id": id,
                    "new_position": new_position,
                    "returned_at": at
                }),
            )
            .await
            .map_err(Self::db_err)
    }

    async fn create_absent_patient(
        &self,
        record: &AbsentPatientRecord,
    ) -> Result<(), QueueError> {
        let body =
            serde_json::to_value(record).map_err(|e| QueueError::Database(e.to_string()))?;
        let _: Vec<AbsentPatientRecord> = self
            .supabase
            .request(Method::POST, "/rest/v1/absent_patients", self.token(), Some(body))
            .await
            .map_err(Self::db_err)?;
        Ok(())
    }

    async fn get_open_absence(
        &self,
        appointment_id: Uuid,
    ) -> Result<Option<AbsentPatientRecord>, QueueError> {
        let path = format!(
            "/rest/v1/absent_patients?appointment_id=eq.{}&returned_at=is.null&auto_cancelled=eq.false&limit=1",
            appointment_id
        );
        let rows: Vec<AbsentPatientRecord> = self
            .supabase
            .request(Method::GET, &path, self.token(), None)
            .await
            .map_err(Self::db_err)?;
        Ok(rows.into_iter().next())
    }

    async fn create_queue_override(&self, row: &QueueOverride) -> Result<(), QueueError> {
        let body = serde_json::to_value(row).map_err(|e| QueueError::Database(e.to_string()))?;
        let _: Vec<QueueOverride> = self
            .supabase
            .request(Method::POST, "/rest/v1/queue_overrides", self.token(), Some(body))
            .await
            .map_err(Self::db_err)?;
        Ok(())
    }

    async fn get_next_queue_position(
        &self,
        clinic_id: Uuid,
        date: NaiveDate,
    ) -> Result<i32, QueueError> {
        self.supabase
            .rpc(
                "get_next_queue_position",
                self.token(),
                json!({ "clinic_id": clinic_id, "date": date }),
            )
            .await
            .map_err(Self::db_err)
    }

    async fn get_clinic_config_by_staff_id(
        &self,
        staff_id: Uuid,
    ) -> Result<ClinicQueueConfig, QueueError> {
        self.supabase
            .rpc(
                "get_clinic_config_by_staff_id",
                self.token(),
                json!({ "staff_id": staff_id }),
            )
            .await
            .map_err(Self::db_err)
    }

    async fn record_actual_wait_time(
        &self,
        id: Uuid,
        wait_minutes: i64,
        duration_minutes: i64,
    ) -> Result<(), QueueError> {
        let _: serde_json::Value = self
            .supabase
            .rpc(
                "record_actual_wait_time",
                self.token(),
                json!({
                    "appointment_id": id,
                    "wait_minutes": wait_minutes,
                    "duration_minutes": duration_minutes
                }),
            )
            .await
            .map_err(Self::db_err)?;
        Ok(())
    }

    async fn get_waiting_appointments(
        &self,
        clinic_id: Uuid,
        date: NaiveDate,
    ) -> Result<Vec<QueueEntry>, QueueError> {
        let path = format!(
            "/rest/v1/appointments?clinic_id=eq.{}&appointment_date=eq.{}&status=eq.WAITING&is_present=eq.true&order=queue_position.asc",
            clinic_id, date
        );
        self.supabase
            .request(Method::GET, &path, self.token(), None)
            .await
            .map_err(Self::db_err)
    }

    async fn get_in_progress_appointments(&self) -> Result<Vec<QueueEntry>, QueueError> {
        let path = "/rest/v1/appointments?status=eq.IN_PROGRESS";
        self.supabase
            .request(Method::GET, path, self.token(), None)
            .await
            .map_err(Self::db_err)
    }

    async fn get_waitlist(
        &self,
        clinic_id: Uuid,
        date: NaiveDate,
    ) -> Result<Vec<WaitlistEntry>, QueueError> {
        let path = format!(
            "/rest/v1/waitlist_entries?clinic_id=eq.{}&date=eq.{}&status=eq.waiting&order=priority_score.desc",
            clinic_id, date
        );
        self.supabase
            .request(Method::GET, &path, self.token(), None)
            .await
            .map_err(Self::db_err)
    }

    async fn update_waitlist_status(
        &self,
        id: Uuid,
        status: WaitlistStatus,
    ) -> Result<(), QueueError> {
        let path = format!("/rest/v1/waitlist_entries?id=eq.{}", id);
        let _: Vec<WaitlistEntry> = self
            .supabase
            .request(
                Method::PATCH,
                &path,
                self.token(),
                Some(json!({ "status": status })),
            )
            .await
            .map_err(Self::db_err)?;
        Ok(())
    }

    async fn get_historical_averages(
        &self,
        staff_id: Uuid,
    ) -> Result<HistoricalAverages, QueueError> {
        self.supabase
            .rpc(
                "get_staff_historical_averages",
                self.token(),
                json!({ "staff_id": staff_id }),
            )
            .await
            .map_err(Self::db_err)
    }
}
