//! In-memory store double and fixtures shared by the engine's test suites.

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::error::QueueError;
use crate::models::{
    AbsentPatientRecord, AppointmentStatus, ClinicQueueConfig, CreateAppointmentRequest,
    HistoricalAverages, PredictionPatch, QueueEntry, QueueEntryPatch, QueueOverride,
    WaitlistEntry, WaitlistStatus,
};
use crate::services::store::AppointmentStore;

/// A queue entry with test defaults: waiting, present, 15-minute slot.
pub fn entry_fixture(
    clinic_id: Uuid,
    staff_id: Uuid,
    position: i32,
    scheduled_time: DateTime<Utc>,
) -> QueueEntry {
    QueueEntry {
        id: Uuid::new_v4(),
        clinic_id,
        staff_id,
        patient_id: Uuid::new_v4(),
        appointment_date: scheduled_time.date_naive(),
        scheduled_time,
        start_time: scheduled_time,
        end_time: scheduled_time + Duration::minutes(15),
        queue_position: position,
        original_queue_position: position,
        status: AppointmentStatus::Waiting,
        is_present: true,
        skip_count: 0,
        skip_reason: None,
        checked_in_at: None,
        actual_end_time: None,
        estimated_duration_minutes: 15,
        predicted_wait_time: None,
        predicted_start_time: None,
        prediction_mode: None,
        prediction_confidence: None,
        last_prediction_update: None,
        priority_score: None,
        marked_absent_at: None,
        returned_at: None,
        is_walk_in: false,
        is_emergency: false,
    }
}

pub fn waitlist_fixture(clinic_id: Uuid, date: NaiveDate, priority_score: f64) -> WaitlistEntry {
    let window_start = Utc::now();
    WaitlistEntry {
        id: Uuid::new_v4(),
        clinic_id,
        patient_id: Uuid::new_v4(),
        date,
        window_start,
        window_end: window_start + Duration::hours(4),
        priority_score,
        status: WaitlistStatus::Waiting,
    }
}

/// In-memory `AppointmentStore` with the same observable semantics as the
/// PostgREST implementation, plus accessors for asserting on writes.
///
/// `yielding()` makes every call suspend once, giving concurrency tests the
/// interleaving points a remote store has. `gated()` additionally parks
/// `get_waiting_appointments` until `open_gate`, so a test can hold a
/// recalculation pass in flight.
#[derive(Default)]
pub struct InMemoryAppointmentStore {
    entries: Mutex<HashMap<Uuid, QueueEntry>>,
    absences: Mutex<Vec<AbsentPatientRecord>>,
    overrides: Mutex<Vec<QueueOverride>>,
    waitlist: Mutex<Vec<WaitlistEntry>>,
    configs: Mutex<HashMap<Uuid, ClinicQueueConfig>>,
    averages: Mutex<HashMap<Uuid, HistoricalAverages>>,
    recorded_waits: Mutex<Vec<(Uuid, i64, i64)>>,
    prediction_batches: Mutex<Vec<Vec<PredictionPatch>>>,
    yield_on_access: bool,
    waiting_gate: Option<Semaphore>,
}

impl InMemoryAppointmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn yielding() -> Self {
        Self {
            yield_on_access: true,
            ..Self::default()
        }
    }

    pub fn gated() -> Self {
        Self {
            waiting_gate: Some(Semaphore::new(0)),
            ..Self::default()
        }
    }

    /// Lets `permits` parked queue reads through.
    pub fn open_gate(&self, permits: usize) {
        if let Some(gate) = &self.waiting_gate {
            gate.add_permits(permits);
        }
    }

    pub fn insert_entry(&self, entry: QueueEntry) {
        self.entries.lock().unwrap().insert(entry.id, entry);
    }

    pub fn insert_waitlist(&self, entry: WaitlistEntry) {
        self.waitlist.lock().unwrap().push(entry);
    }

    pub fn set_config(&self, staff_id: Uuid, config: ClinicQueueConfig) {
        self.configs.lock().unwrap().insert(staff_id, config);
    }

    pub fn set_averages(&self, staff_id: Uuid, averages: HistoricalAverages) {
        self.averages.lock().unwrap().insert(staff_id, averages);
    }

    pub fn entry(&self, id: Uuid) -> Option<QueueEntry> {
        self.entries.lock().unwrap().get(&id).cloned()
    }

    pub fn overrides(&self) -> Vec<QueueOverride> {
        self.overrides.lock().unwrap().clone()
    }

    pub fn absence_records(&self) -> Vec<AbsentPatientRecord> {
        self.absences.lock().unwrap().clone()
    }

    pub fn recorded_waits(&self) -> Vec<(Uuid, i64, i64)> {
        self.recorded_waits.lock().unwrap().clone()
    }

    pub fn prediction_batches(&self) -> Vec<Vec<PredictionPatch>> {
        self.prediction_batches.lock().unwrap().clone()
    }

    async fn pause(&self) {
        if self.yield_on_access {
            tokio::task::yield_now().await;
        }
    }

    fn with_entry<T>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut QueueEntry) -> T,
    ) -> Result<T, QueueError> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries
            .get_mut(&id)
            .ok_or_else(|| QueueError::NotFound(format!("appointment {}", id)))?;
        Ok(f(entry))
    }
}

#[async_trait]
impl AppointmentStore for InMemoryAppointmentStore {
    async fn get_queue_entry_by_id(&self, id: Uuid) -> Result<QueueEntry, QueueError> {
        self.pause().await;
        self.entry(id)
            .ok_or_else(|| QueueError::NotFound(format!("appointment {}", id)))
    }

    async fn get_daily_schedule(
        &self,
        staff_id: Uuid,
        date: NaiveDate,
    ) -> Result<Vec<QueueEntry>, QueueError> {
        self.pause().await;
        let mut rows: Vec<QueueEntry> = self
            .entries
            .lock()
            .unwrap()
            .values()
            .filter(|e| e.staff_id == staff_id && e.appointment_date == date)
            .cloned()
            .collect();
        rows.sort_by_key(|e| e.queue_position);
        Ok(rows)
    }

    async fn create_queue_entry(
        &self,
        request: &CreateAppointmentRequest,
    ) -> Result<QueueEntry, QueueError> {
        self.pause().await;
        let start_time = request
            .start_time
            .ok_or_else(|| QueueError::Database("start_time missing".to_string()))?;
        let position = self
            .get_next_queue_position(request.clinic_id, request.appointment_date)
            .await?;

        let mut entry = entry_fixture(request.clinic_id, request.staff_id, position, start_time);
        entry.patient_id = request.patient_id;
        entry.appointment_date = request.appointment_date;
        entry.end_time = request.end_time.unwrap_or(entry.end_time);
        entry.status = AppointmentStatus::Scheduled;
        entry.is_present = false;
        entry.estimated_duration_minutes = request.estimated_duration_minutes.unwrap_or(15);
        entry.is_walk_in = request.is_walk_in;
        entry.is_emergency = request.is_emergency;

        self.insert_entry(entry.clone());
        Ok(entry)
    }

    async fn update_queue_entry(
        &self,
        id: Uuid,
        patch: &QueueEntryPatch,
    ) -> Result<QueueEntry, QueueError> {
        self.pause().await;
        self.with_entry(id, |entry| {
            if let Some(status) = patch.status {
                entry.status = status;
            }
            if let Some(is_present) = patch.is_present {
                entry.is_present = is_present;
            }
            if let Some(position) = patch.queue_position {
                entry.queue_position = position;
            }
            if let Some(at) = patch.checked_in_at {
                entry.checked_in_at = Some(at);
            }
            if let Some(at) = patch.actual_end_time {
                entry.actual_end_time = Some(at);
            }
            if let Some(count) = patch.skip_count {
                entry.skip_count = count;
            }
            if let Some(reason) = &patch.skip_reason {
                entry.skip_reason = Some(reason.clone());
            }
            if let Some(score) = patch.priority_score {
                entry.priority_score = Some(score);
            }
            entry.clone()
        })
    }

    async fn batch_update_predictions(
        &self,
        patches: &[PredictionPatch],
    ) -> Result<(), QueueError> {
        self.pause().await;
        for patch in patches {
            self.with_entry(patch.appointment_id, |entry| {
                entry.predicted_wait_time = Some(patch.predicted_wait_time);
                entry.predicted_start_time = Some(patch.predicted_start_time);
                entry.prediction_mode = Some(patch.prediction_mode.clone());
                entry.prediction_confidence = Some(patch.prediction_confidence);
                entry.last_prediction_update = Some(patch.last_prediction_update);
            })?;
        }
        self.prediction_batches.lock().unwrap().push(patches.to_vec());
        Ok(())
    }

    async fn check_in_patient(
        &self,
        id: Uuid,
        _at: DateTime<Utc>,
    ) -> Result<QueueEntry, QueueError> {
        self.pause().await;
        self.with_entry(id, |entry| {
            entry.status = AppointmentStatus::Waiting;
            entry.is_present = true;
            entry.clone()
        })
    }

    async fn mark_absent(&self, id: Uuid, at: DateTime<Utc>) -> Result<QueueEntry, QueueError> {
        self.pause().await;
        self.with_entry(id, |entry| {
            entry.is_present = false;
            entry.marked_absent_at = Some(at);
            entry.returned_at = None;
            entry.clone()
        })
    }

    async fn mark_patient_returned(
        &self,
        id: Uuid,
        new_position: i32,
        at: DateTime<Utc>,
    ) -> Result<QueueEntry, QueueError> {
        self.pause().await;
        let updated = self.with_entry(id, |entry| {
            entry.is_present = true;
            entry.status = AppointmentStatus::Waiting;
            entry.queue_position = new_position;
            entry.returned_at = Some(at);
            entry.clone()
        })?;

        let mut absences = self.absences.lock().unwrap();
        if let Some(open) = absences
            .iter_mut()
            .find(|r| r.appointment_id == id && r.is_open())
        {
            open.returned_at = Some(at);
        }

        Ok(updated)
    }

    async fn create_absent_patient(
        &self,
        record: &AbsentPatientRecord,
    ) -> Result<(), QueueError> {
        self.pause().await;
        self.absences.lock().unwrap().push(record.clone());
        Ok(())
    }

    async fn get_open_absence(
        &self,
        appointment_id: Uuid,
    ) -> Result<Option<AbsentPatientRecord>, QueueError> {
        self.pause().await;
        Ok(self
            .absences
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.appointment_id == appointment_id && r.is_open())
            .cloned())
    }

    async fn create_queue_override(&self, row: &QueueOverride) -> Result<(), QueueError> {
        self.pause().await;
        self.overrides.lock().unwrap().push(row.clone());
        Ok(())
    }

    async fn get_next_queue_position(
        &self,
        clinic_id: Uuid,
        date: NaiveDate,
    ) -> Result<i32, QueueError> {
        self.pause().await;
        let max = self
            .entries
            .lock()
            .unwrap()
            .values()
            .filter(|e| e.clinic_id == clinic_id && e.appointment_date == date)
            .map(|e| e.queue_position)
            .max()
            .unwrap_or(0);
        Ok(max + 1)
    }

    async fn get_clinic_config_by_staff_id(
        &self,
        staff_id: Uuid,
    ) -> Result<ClinicQueueConfig, QueueError> {
        self.pause().await;
        self.configs
            .lock()
            .unwrap()
            .get(&staff_id)
            .cloned()
            .ok_or_else(|| QueueError::NotFound(format!("clinic config for staff {}", staff_id)))
    }

    async fn record_actual_wait_time(
        &self,
        id: Uuid,
        wait_minutes: i64,
        duration_minutes: i64,
    ) -> Result<(), QueueError> {
        self.pause().await;
        self.recorded_waits
            .lock()
            .unwrap()
            .push((id, wait_minutes, duration_minutes));
        Ok(())
    }

    async fn get_waiting_appointments(
        &self,
        clinic_id: Uuid,
        date: NaiveDate,
    ) -> Result<Vec<QueueEntry>, QueueError> {
        self.pause().await;
        if let Some(gate) = &self.waiting_gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|_| QueueError::Database("gate closed".to_string()))?;
            permit.forget();
        }
        let mut rows: Vec<QueueEntry> = self
            .entries
            .lock()
            .unwrap()
            .values()
            .filter(|e| {
                e.clinic_id == clinic_id
                    && e.appointment_date == date
                    && e.status == AppointmentStatus::Waiting
                    && e.is_present
            })
            .cloned()
            .collect();
        rows.sort_by_key(|e| e.queue_position);
        Ok(rows)
    }

    async fn get_in_progress_appointments(&self) -> Result<Vec<QueueEntry>, QueueError> {
        self.pause().await;
        Ok(self
            .entries
            .lock()
            .unwrap()
            .values()
            .filter(|e| e.status == AppointmentStatus::InProgress)
            .cloned()
            .collect())
    }

    async fn get_waitlist(
        &self,
        clinic_id: Uuid,
        date: NaiveDate,
    ) -> Result<Vec<WaitlistEntry>, QueueError> {
        self.pause().await;
        let mut rows: Vec<WaitlistEntry> = self
            .waitlist
            .lock()
            .unwrap()
            .iter()
            .filter(|w| {
                w.clinic_id == clinic_id && w.date == date && w.status == WaitlistStatus::Waiting
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            b.priority_score
                .partial_cmp(&a.priority_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(rows)
    }

    async fn update_waitlist_status(
        &self,
        id: Uuid,
        status: WaitlistStatus,
    ) -> Result<(), QueueError> {
        self.pause().await;
        let mut waitlist = self.waitlist.lock().unwrap();
        let entry = waitlist
            .iter_mut()
            .find(|w| w.id == id)
            .ok_or_else(|| QueueError::NotFound(format!("waitlist entry {}", id)))?;
        entry.status = status;
        Ok(())
    }

    async fn get_historical_averages(
        &self,
        staff_id: Uuid,
    ) -> Result<HistoricalAverages, QueueError> {
        self.pause().await;
        Ok(self
            .averages
            .lock()
            .unwrap()
            .get(&staff_id)
            .cloned()
            .unwrap_or(HistoricalAverages {
                avg_consultation_minutes: 0.0,
                avg_wait_minutes: 0.0,
                sample_size: 0,
            }))
    }
}
