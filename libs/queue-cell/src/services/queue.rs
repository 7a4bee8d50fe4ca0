use chrono::Utc;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use shared_events::{DomainEvent, EventBus, QueueEventType};

use crate::error::QueueError;
use crate::models::{
    AbsentPatientRecord, AppointmentStatus, CallNextPatientRequest, CreateAppointmentRequest,
    MarkAbsentRequest, QueueEntry, QueueEntryPatch, QueueOverride, QueueOverrideAction,
    ReorderQueueRequest, WaitlistEntry, WaitlistStatus,
};
use crate::services::store::AppointmentStore;
use crate::services::strategy::{strategy_for_mode, NextPatient, StrategyContext};

const DEFAULT_GRACE_PERIOD_MINUTES: i64 = 30;

#[derive(Debug, Clone)]
pub enum CallNextOutcome {
    Called {
        entry: QueueEntry,
        can_call_early: bool,
    },
    WaitlistNotified {
        entry: WaitlistEntry,
    },
}

/// Façade over the appointment state machine. Every operation follows the
/// same shape: validate, mutate the store, write a `QueueOverride` audit row,
/// publish a domain event.
///
/// Mutating operations for the same clinic are serialized through a
/// per-clinic async mutex; every state-machine guard runs on a fresh read
/// taken under that lock, so two racing calls cannot both pass the same
/// guard.
pub struct QueueService {
    store: Arc<dyn AppointmentStore>,
    events: Arc<EventBus>,
    clinic_locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl QueueService {
    pub fn new(store: Arc<dyn AppointmentStore>, events: Arc<EventBus>) -> Self {
        Self {
            store,
            events,
            clinic_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn clinic_lock(&self, clinic_id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.clinic_locks.lock().await;
        Arc::clone(locks.entry(clinic_id).or_default())
    }

    /// The entry is fetched here only to locate its clinic; callers re-read
    /// it under the returned lock before checking any guard.
    async fn lock_for_appointment(&self, id: Uuid) -> Result<Arc<Mutex<()>>, QueueError> {
        let clinic_id = self.store.get_queue_entry_by_id(id).await?.clinic_id;
        Ok(self.clinic_lock(clinic_id).await)
    }

    fn publish(&self, event_type: QueueEventType, appointment_id: Uuid, clinic_id: Uuid, payload: Value) {
        self.events
            .publish(DomainEvent::new(event_type, appointment_id, clinic_id, payload));
    }

    async fn audit(
        &self,
        action: QueueOverrideAction,
        before: &QueueEntry,
        after: &QueueEntry,
        performed_by: &str,
        reason: Option<String>,
    ) -> Result<(), QueueError> {
        let row = QueueOverride {
            id: Uuid::new_v4(),
            appointment_id: after.id,
            clinic_id: after.clinic_id,
            action,
            previous_position: Some(before.queue_position),
            new_position: Some(after.queue_position),
            performed_by: performed_by.to_string(),
            reason,
            previous_state: serde_json::to_value(before).unwrap_or(Value::Null),
            new_state: serde_json::to_value(after).unwrap_or(Value::Null),
            created_at: Utc::now(),
        };
        self.store.create_queue_override(&row).await
    }

    /// Create a new appointment/queue entry. Appointments in the past are
    /// rejected unless they are walk-ins, which may be logged retroactively.
    #[instrument(skip(self, request), fields(patient_id = %request.patient_id))]
    pub async fn create_appointment(
        &self,
        request: CreateAppointmentRequest,
    ) -> Result<QueueEntry, QueueError> {
        let start_time = request
            .start_time
            .ok_or_else(|| QueueError::Validation("start_time is required".to_string()))?;
        request
            .end_time
            .ok_or_else(|| QueueError::Validation("end_time is required".to_string()))?;

        if start_time < Utc::now() && !request.is_walk_in {
            return Err(QueueError::Validation(
                "appointment cannot be scheduled in the past".to_string(),
            ));
        }

        let lock = self.clinic_lock(request.clinic_id).await;
        let _guard = lock.lock().await;

        let entry = self.store.create_queue_entry(&request).await?;

        info!(
            "Created appointment {} at queue position {}",
            entry.id, entry.queue_position
        );

        self.publish(
            QueueEventType::PatientAddedToQueue,
            entry.id,
            entry.clinic_id,
            json!({
                "entry": entry,
                "is_walk_in": request.is_walk_in,
                "is_emergency": request.is_emergency,
            }),
        );

        Ok(entry)
    }

    /// Front-desk arrival: Scheduled -> Waiting with `is_present = true`.
    #[instrument(skip(self))]
    pub async fn check_in_patient(&self, id: Uuid) -> Result<QueueEntry, QueueError> {
        let lock = self.lock_for_appointment(id).await?;
        let _guard = lock.lock().await;

        let entry = self.store.get_queue_entry_by_id(id).await?;

        match entry.status {
            AppointmentStatus::Completed | AppointmentStatus::Cancelled => {
                return Err(QueueError::BusinessRule(format!(
                    "cannot check in appointment {} with status {:?}",
                    id, entry.status
                )));
            }
            status if status.is_terminal() => {
                return Err(QueueError::BusinessRule(format!(
                    "cannot check in appointment {} with status {:?}",
                    id, entry.status
                )));
            }
            AppointmentStatus::InProgress => {
                return Err(QueueError::BusinessRule(format!(
                    "appointment {} is already in progress",
                    id
                )));
            }
            AppointmentStatus::Waiting if entry.is_present => {
                return Err(QueueError::BusinessRule(format!(
                    "patient for appointment {} is already checked in",
                    id
                )));
            }
            _ => {}
        }

        let now = Utc::now();
        let updated = self.store.check_in_patient(id, now).await?;

        self.publish(
            QueueEventType::PatientCheckedIn,
            updated.id,
            updated.clinic_id,
            json!({
                "entry": updated,
                "scheduled_time": updated.scheduled_time,
                "arrived_at": now,
            }),
        );

        Ok(updated)
    }

    /// Apply the clinic's queue strategy and move the winner to InProgress.
    #[instrument(skip(self, request), fields(clinic_id = %request.clinic_id))]
    pub async fn call_next_patient(
        &self,
        request: CallNextPatientRequest,
    ) -> Result<CallNextOutcome, QueueError> {
        let config = self
            .store
            .get_clinic_config_by_staff_id(request.staff_id)
            .await?;

        let lock = self.clinic_lock(request.clinic_id).await;
        let _guard = lock.lock().await;

        let schedule = self
            .store
            .get_daily_schedule(request.staff_id, request.date)
            .await?;

        let waitlist = if config.waitlist_enabled {
            Some(self.store.get_waitlist(request.clinic_id, request.date).await?)
        } else {
            None
        };

        let strategy = strategy_for_mode(config.mode);
        let ctx = StrategyContext {
            now: Utc::now(),
            config,
        };

        let next = strategy
            .next_patient(&schedule, &ctx, waitlist.as_deref())
            .ok_or_else(|| {
                QueueError::NotFound(format!(
                    "no eligible patient for clinic {} on {}",
                    request.clinic_id, request.date
                ))
            })?;

        match next {
            NextPatient::Scheduled {
                entry,
                can_call_early,
            } => {
                let patch = QueueEntryPatch {
                    status: Some(AppointmentStatus::InProgress),
                    checked_in_at: Some(ctx.now),
                    ..Default::default()
                };
                let updated = self.store.update_queue_entry(entry.id, &patch).await?;

                self.audit(
                    QueueOverrideAction::PatientCalled,
                    &entry,
                    &updated,
                    &request.performed_by,
                    None,
                )
                .await?;

                info!("Called patient for appointment {}", updated.id);

                self.publish(
                    QueueEventType::PatientCalled,
                    updated.id,
                    updated.clinic_id,
                    json!({
                        "entry": updated,
                        "can_call_early": can_call_early,
                    }),
                );

                Ok(CallNextOutcome::Called {
                    entry: updated,
                    can_call_early,
                })
            }
            NextPatient::FromWaitlist {
                entry,
                notify_immediately,
            } => {
                self.store
                    .update_waitlist_status(entry.id, WaitlistStatus::Notified)
                    .await?;

                let row = QueueOverride {
                    id: Uuid::new_v4(),
                    appointment_id: entry.id,
                    clinic_id: entry.clinic_id,
                    action: QueueOverrideAction::WaitlistPromoted,
                    previous_position: None,
                    new_position: None,
                    performed_by: request.performed_by.clone(),
                    reason: None,
                    previous_state: serde_json::to_value(&entry).unwrap_or(Value::Null),
                    new_state: Value::Null,
                    created_at: Utc::now(),
                };
                self.store.create_queue_override(&row).await?;

                self.publish(
                    QueueEventType::PatientCalled,
                    entry.id,
                    entry.clinic_id,
                    json!({
                        "waitlist_entry": entry,
                        "from_waitlist": true,
                        "notify_immediately": notify_immediately,
                    }),
                );

                Ok(CallNextOutcome::WaitlistNotified { entry })
            }
        }
    }

    /// Flag an absence. Double-marking an unresolved absence is a conflict.
    #[instrument(skip(self, request), fields(appointment_id = %request.appointment_id))]
    pub async fn mark_patient_absent(
        &self,
        request: MarkAbsentRequest,
    ) -> Result<QueueEntry, QueueError> {
        let lock = self.lock_for_appointment(request.appointment_id).await?;
        let _guard = lock.lock().await;

        let entry = self
            .store
            .get_queue_entry_by_id(request.appointment_id)
            .await?;

        if entry.status.is_terminal() {
            return Err(QueueError::BusinessRule(format!(
                "cannot mark absent appointment {} with status {:?}",
                entry.id, entry.status
            )));
        }

        if entry.has_open_absence()
            || self.store.get_open_absence(entry.id).await?.is_some()
        {
            return Err(QueueError::Conflict(format!(
                "appointment {} already has an unresolved absence",
                entry.id
            )));
        }

        let now = Utc::now();
        let updated = self.store.mark_absent(entry.id, now).await?;

        let grace_minutes = request
            .grace_period_minutes
            .unwrap_or(DEFAULT_GRACE_PERIOD_MINUTES);
        let record = AbsentPatientRecord {
            id: Uuid::new_v4(),
            appointment_id: entry.id,
            clinic_id: entry.clinic_id,
            marked_absent_at: now,
            grace_period_ends_at: now + chrono::Duration::minutes(grace_minutes),
            returned_at: None,
            auto_cancelled: false,
        };
        self.store.create_absent_patient(&record).await?;

        self.audit(
            QueueOverrideAction::MarkedAbsent,
            &entry,
            &updated,
            &request.performed_by,
            request.reason.clone(),
        )
        .await?;

        warn!("Marked appointment {} absent", entry.id);

        self.publish(
            QueueEventType::PatientMarkedAbsent,
            updated.id,
            updated.clinic_id,
            json!({
                "entry": updated,
                "reason": request.reason,
                "grace_period_ends_at": record.grace_period_ends_at,
            }),
        );

        Ok(updated)
    }

    /// Resolve an open absence: back to Waiting at the end of the line.
    #[instrument(skip(self))]
    pub async fn mark_patient_returned(
        &self,
        id: Uuid,
        performed_by: &str,
    ) -> Result<QueueEntry, QueueError> {
        let lock = self.lock_for_appointment(id).await?;
        let _guard = lock.lock().await;

        let entry = self.store.get_queue_entry_by_id(id).await?;

        if self.store.get_open_absence(id).await?.is_none() {
            return Err(QueueError::BusinessRule(format!(
                "appointment {} has no open absence to resolve",
                id
            )));
        }

        let now = Utc::now();
        let new_position = self
            .store
            .get_next_queue_position(entry.clinic_id, entry.appointment_date)
            .await?;
        let updated = self
            .store
            .mark_patient_returned(id, new_position, now)
            .await?;

        self.audit(
            QueueOverrideAction::Returned,
            &entry,
            &updated,
            performed_by,
            None,
        )
        .await?;

        info!(
            "Appointment {} returned to queue at position {}",
            id, new_position
        );

        self.publish(
            QueueEventType::PatientReturned,
            updated.id,
            updated.clinic_id,
            json!({
                "entry": updated,
                "new_position": new_position,
            }),
        );

        Ok(updated)
    }

    /// Complete an in-progress consultation and record the actuals.
    #[instrument(skip(self))]
    pub async fn complete_appointment(
        &self,
        id: Uuid,
        performed_by: &str,
    ) -> Result<QueueEntry, QueueError> {
        let lock = self.lock_for_appointment(id).await?;
        let _guard = lock.lock().await;

        let entry = self.store.get_queue_entry_by_id(id).await?;

        if entry.status == AppointmentStatus::Completed {
            return Err(QueueError::Conflict(format!(
                "appointment {} is already completed",
                id
            )));
        }
        if entry.status != AppointmentStatus::InProgress {
            return Err(QueueError::BusinessRule(format!(
                "cannot complete appointment {} with status {:?}",
                id, entry.status
            )));
        }

        let now = Utc::now();
        let patch = QueueEntryPatch {
            status: Some(AppointmentStatus::Completed),
            actual_end_time: Some(now),
            ..Default::default()
        };
        let updated = self.store.update_queue_entry(id, &patch).await?;

        if let Some(checked_in_at) = entry.checked_in_at {
            let wait_minutes = (checked_in_at - entry.scheduled_time).num_minutes();
            let duration_minutes = (now - checked_in_at).num_minutes();
            self.store
                .record_actual_wait_time(id, wait_minutes, duration_minutes)
                .await?;
        }

        self.audit(
            QueueOverrideAction::Completed,
            &entry,
            &updated,
            performed_by,
            None,
        )
        .await?;

        info!("Completed appointment {}", id);

        self.publish(
            QueueEventType::AppointmentStatusChanged,
            updated.id,
            updated.clinic_id,
            json!({
                "entry": updated,
                "status": "COMPLETED",
            }),
        );

        Ok(updated)
    }

    /// Move an entry to a new queue position. Same-position calls are a
    /// no-op: no store write, no audit row, no event.
    #[instrument(skip(self, request), fields(appointment_id = %request.appointment_id))]
    pub async fn reorder_queue(
        &self,
        request: ReorderQueueRequest,
    ) -> Result<QueueEntry, QueueError> {
        if request.new_position < 1 {
            return Err(QueueError::Validation(format!(
                "queue position must be >= 1, got {}",
                request.new_position
            )));
        }

        let lock = self.lock_for_appointment(request.appointment_id).await?;
        let _guard = lock.lock().await;

        let entry = self
            .store
            .get_queue_entry_by_id(request.appointment_id)
            .await?;

        if entry.status.is_terminal() {
            return Err(QueueError::BusinessRule(format!(
                "cannot reorder appointment {} with status {:?}",
                entry.id, entry.status
            )));
        }

        if entry.queue_position == request.new_position {
            return Ok(entry);
        }

        let patch = QueueEntryPatch {
            queue_position: Some(request.new_position),
            ..Default::default()
        };
        let updated = self.store.update_queue_entry(entry.id, &patch).await?;

        self.audit(
            QueueOverrideAction::Reordered,
            &entry,
            &updated,
            &request.performed_by,
            request.reason.clone(),
        )
        .await?;

        self.publish(
            QueueEventType::QueuePositionChanged,
            updated.id,
            updated.clinic_id,
            json!({
                "entry": updated,
                "previous_position": entry.queue_position,
                "new_position": request.new_position,
            }),
        );

        Ok(updated)
    }
}
