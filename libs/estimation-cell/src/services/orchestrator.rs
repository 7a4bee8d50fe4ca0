use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use queue_cell::{
    AppointmentStore, ClinicQueueConfig, HistoricalAverages, PredictionPatch, QueueEntry,
};
use shared_config::AppConfig;
use shared_events::{DomainEvent, EventBus, QueueEventType, SubscriptionHandle};

use crate::models::{Disruption, DisruptionType, EstimationContext};
use crate::services::disruption::{
    DisruptionDetector, DURATION_ANOMALY_THRESHOLD_MINUTES, LATE_ARRIVAL_THRESHOLD_MINUTES,
};
use crate::services::estimators::EstimationChain;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Quiet period before a triggered recalculation actually runs; repeated
    /// triggers for the same clinic within it coalesce into one pass.
    pub debounce: Duration,
    pub sweep_interval: Duration,
    /// Upper bound on estimations run concurrently within one clinic pass.
    pub batch_size: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(2),
            sweep_interval: Duration::from_secs(60),
            batch_size: 5,
        }
    }
}

impl From<&AppConfig> for OrchestratorConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            debounce: Duration::from_millis(config.recalculation_debounce_ms),
            sweep_interval: Duration::from_secs(config.sweep_interval_seconds),
            batch_size: config.recalculation_batch_size,
        }
    }
}

/// Keeps displayed wait times honest: listens to queue events, buffers
/// disruptions per clinic, and rewrites predictions for every waiting
/// patient of an affected clinic after a debounce window.
///
/// `initialize` must be called before any event is of interest and
/// `cleanup` on shutdown; dropping without `cleanup` leaks the sweep task
/// until the runtime stops.
pub struct WaitTimeEstimationOrchestrator {
    inner: Arc<Inner>,
    events: Arc<EventBus>,
    subscriptions: Mutex<Vec<SubscriptionHandle>>,
    sweep: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    store: Arc<dyn AppointmentStore>,
    chain: Arc<EstimationChain>,
    config: OrchestratorConfig,
    /// Per-clinic disruption buffer, consumed when that clinic's
    /// recalculation completes.
    disruptions: Mutex<HashMap<Uuid, Vec<Disruption>>>,
    /// Per-clinic debounce task still inside its quiet period,
    /// cancel-and-replace on re-trigger. Tasks remove themselves when the
    /// timer fires, so an abort only ever cancels a timer, never a running
    /// recalculation.
    pending: Mutex<HashMap<Uuid, JoinHandle<()>>>,
}

const SUBSCRIBED_EVENTS: [QueueEventType; 7] = [
    QueueEventType::PatientCalled,
    QueueEventType::AppointmentStatusChanged,
    QueueEventType::PatientMarkedAbsent,
    QueueEventType::PatientReturned,
    QueueEventType::QueuePositionChanged,
    QueueEventType::PatientCheckedIn,
    QueueEventType::PatientAddedToQueue,
];

impl WaitTimeEstimationOrchestrator {
    pub fn new(
        store: Arc<dyn AppointmentStore>,
        events: Arc<EventBus>,
        chain: Arc<EstimationChain>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                chain,
                config,
                disruptions: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
            }),
            events,
            subscriptions: Mutex::new(Vec::new()),
            sweep: Mutex::new(None),
        }
    }

    /// Subscribes to every queue event and starts the running-over sweep.
    pub async fn initialize(&self) {
        let mut subscriptions = self.subscriptions.lock().await;
        if !subscriptions.is_empty() {
            warn!("Orchestrator already initialized, skipping");
            return;
        }

        for event_type in SUBSCRIBED_EVENTS {
            let inner = Arc::clone(&self.inner);
            let handle = self
                .events
                .subscribe(event_type, move |event| {
                    let inner = Arc::clone(&inner);
                    Box::pin(async move { inner.handle_event(event).await })
                })
                .await;
            subscriptions.push(handle);
        }

        let inner = Arc::clone(&self.inner);
        *self.sweep.lock().await = Some(tokio::spawn(async move {
            inner.sweep_loop().await;
        }));

        info!("Wait-time estimation orchestrator initialized");
    }

    /// Unsubscribes every handler and cancels the sweep and all pending
    /// debounce tasks. Safe to call more than once.
    pub async fn cleanup(&self) {
        for handle in self.subscriptions.lock().await.drain(..) {
            handle.unsubscribe().await;
        }

        if let Some(sweep) = self.sweep.lock().await.take() {
            sweep.abort();
        }

        for (_, pending) in self.inner.pending.lock().await.drain() {
            pending.abort();
        }
        self.inner.disruptions.lock().await.clear();

        info!("Wait-time estimation orchestrator stopped");
    }

    /// Disruptions recorded for a clinic and not yet consumed by a
    /// recalculation.
    pub async fn buffered_disruptions(&self, clinic_id: Uuid) -> Vec<Disruption> {
        self.inner
            .disruptions
            .lock()
            .await
            .get(&clinic_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl Inner {
    async fn handle_event(self: Arc<Self>, event: DomainEvent) -> anyhow::Result<()> {
        debug!(
            "Orchestrator handling {:?} for clinic {}",
            event.event_type, event.clinic_id
        );

        match event.event_type {
            QueueEventType::PatientCalled => {
                self.schedule_recalculation(event.clinic_id).await;
            }
            QueueEventType::AppointmentStatusChanged => {
                if event.payload["status"] == "COMPLETED" {
                    if let Some(entry) = parse_entry(&event.payload) {
                        let check = DisruptionDetector::check(&entry, event.timestamp);
                        for reason in check.reasons.into_iter().filter(|r| {
                            matches!(
                                r.kind,
                                DisruptionType::LongerThanExpected
                                    | DisruptionType::ShorterThanExpected
                            )
                        }) {
                            self.record_disruption(Disruption::new(
                                reason.kind,
                                event.appointment_id,
                                event.clinic_id,
                                reason.detail,
                            ))
                            .await;
                        }
                    }
                    self.schedule_recalculation(event.clinic_id).await;
                }
            }
            QueueEventType::PatientMarkedAbsent => {
                self.record_disruption(Disruption::new(
                    DisruptionType::NoShow,
                    event.appointment_id,
                    event.clinic_id,
                    "patient marked absent",
                ))
                .await;
                self.schedule_recalculation(event.clinic_id).await;
            }
            QueueEventType::PatientReturned => {
                self.record_disruption(Disruption::new(
                    DisruptionType::PatientReturned,
                    event.appointment_id,
                    event.clinic_id,
                    "patient returned to the queue",
                ))
                .await;
                self.schedule_recalculation(event.clinic_id).await;
            }
            QueueEventType::QueuePositionChanged => {
                self.record_disruption(Disruption::new(
                    DisruptionType::QueueOverride,
                    event.appointment_id,
                    event.clinic_id,
                    "queue manually reordered",
                ))
                .await;
                self.schedule_recalculation(event.clinic_id).await;
            }
            QueueEventType::PatientCheckedIn => {
                // A punctual check-in changes nothing for other patients.
                let scheduled = parse_time(&event.payload, "scheduled_time");
                let arrived = parse_time(&event.payload, "arrived_at").unwrap_or(event.timestamp);
                if let Some(scheduled) = scheduled {
                    let late_by = (arrived - scheduled).num_minutes();
                    if late_by > LATE_ARRIVAL_THRESHOLD_MINUTES {
                        self.record_disruption(Disruption::new(
                            DisruptionType::LateArrival,
                            event.appointment_id,
                            event.clinic_id,
                            format!("arrived {} minutes late", late_by),
                        ))
                        .await;
                        self.schedule_recalculation(event.clinic_id).await;
                    }
                }
            }
            QueueEventType::PatientAddedToQueue => {
                let is_emergency = event.payload["is_emergency"] == true;
                let is_walk_in = event.payload["is_walk_in"] == true;
                if is_emergency {
                    self.record_disruption(Disruption::new(
                        DisruptionType::EmergencyInserted,
                        event.appointment_id,
                        event.clinic_id,
                        "emergency appointment inserted",
                    ))
                    .await;
                    self.schedule_recalculation(event.clinic_id).await;
                } else if is_walk_in {
                    self.schedule_recalculation(event.clinic_id).await;
                }
            }
        }

        Ok(())
    }

    async fn record_disruption(&self, disruption: Disruption) {
        debug!(
            "Recording {:?} disruption for clinic {}",
            disruption.kind, disruption.clinic_id
        );
        self.disruptions
            .lock()
            .await
            .entry(disruption.clinic_id)
            .or_default()
            .push(disruption);
    }

    /// Cancel-and-replace debounce: the newest trigger restarts the quiet
    /// period, so a burst of disruptions produces a single pass.
    async fn schedule_recalculation(self: Arc<Self>, clinic_id: Uuid) {
        let mut pending = self.pending.lock().await;
        if let Some(previous) = pending.remove(&clinic_id) {
            previous.abort();
        }

        let inner = Arc::clone(&self);
        let debounce = self.config.debounce;
        pending.insert(
            clinic_id,
            tokio::spawn(async move {
                tokio::time::sleep(debounce).await;
                // Out of the pending map first: a trigger arriving from here
                // on schedules a follow-up pass instead of cancelling this
                // one.
                inner.pending.lock().await.remove(&clinic_id);
                inner.recalculate(clinic_id).await;
            }),
        );
    }

    #[instrument(skip(self))]
    async fn recalculate(&self, clinic_id: Uuid) {
        let date = Utc::now().date_naive();
        let mut waiting = match self.store.get_waiting_appointments(clinic_id, date).await {
            Ok(entries) => entries,
            Err(e) => {
                error!("Recalculation aborted, cannot load queue: {}", e);
                return;
            }
        };

        if waiting.is_empty() {
            self.disruptions.lock().await.remove(&clinic_id);
            debug!("No waiting appointments for clinic {}", clinic_id);
            return;
        }

        let in_progress = match self.store.get_in_progress_appointments().await {
            Ok(entries) => entries
                .iter()
                .filter(|entry| entry.clinic_id == clinic_id)
                .count(),
            Err(e) => {
                warn!("Could not count in-progress consultations: {}", e);
                0
            }
        };

        waiting.sort_by_key(|entry| entry.queue_position);

        let mut configs: HashMap<Uuid, ClinicQueueConfig> = HashMap::new();
        let mut averages: HashMap<Uuid, HistoricalAverages> = HashMap::new();
        let mut contexts = Vec::with_capacity(waiting.len());
        for (index, entry) in waiting.into_iter().enumerate() {
            let config = match configs.get(&entry.staff_id) {
                Some(config) => config.clone(),
                None => match self.store.get_clinic_config_by_staff_id(entry.staff_id).await {
                    Ok(config) => {
                        configs.insert(entry.staff_id, config.clone());
                        config
                    }
                    Err(e) => {
                        warn!("Skipping entry {}, no clinic config: {}", entry.id, e);
                        continue;
                    }
                },
            };
            let historical = match averages.get(&entry.staff_id) {
                Some(historical) => historical.clone(),
                None => {
                    let historical = match self.store.get_historical_averages(entry.staff_id).await
                    {
                        Ok(historical) => historical,
                        Err(e) => {
                            warn!("No historical averages for staff {}: {}", entry.staff_id, e);
                            HistoricalAverages {
                                avg_consultation_minutes: 0.0,
                                avg_wait_minutes: 0.0,
                                sample_size: 0,
                            }
                        }
                    };
                    averages.insert(entry.staff_id, historical.clone());
                    historical
                }
            };

            contexts.push(EstimationContext {
                entry,
                patients_ahead: index,
                in_progress,
                historical,
                config,
            });
        }

        let now = Utc::now();
        let mut patches = Vec::with_capacity(contexts.len());
        for chunk in contexts.chunks(self.config.batch_size.max(1)) {
            let results = join_all(chunk.iter().map(|context| async move {
                (context.entry.id, self.chain.estimate_fresh(context).await)
            }))
            .await;

            for (appointment_id, estimation) in results {
                patches.push(PredictionPatch {
                    appointment_id,
                    predicted_wait_time: estimation.wait_time_minutes,
                    predicted_start_time: now
                        + chrono::Duration::minutes(i64::from(estimation.wait_time_minutes)),
                    prediction_mode: estimation.mode.as_str().to_string(),
                    prediction_confidence: estimation.confidence,
                    last_prediction_update: now,
                });
            }
        }

        if let Err(e) = self.store.batch_update_predictions(&patches).await {
            // Buffer kept so the next trigger retries with these disruptions.
            error!("Prediction write-back failed for clinic {}: {}", clinic_id, e);
            return;
        }

        let consumed = self
            .disruptions
            .lock()
            .await
            .remove(&clinic_id)
            .map(|buffered| buffered.len())
            .unwrap_or(0);
        info!(
            "Recalculated {} predictions for clinic {}, {} disruptions consumed",
            patches.len(),
            clinic_id,
            consumed
        );
    }

    async fn sweep_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.sweep_interval);
        // First tick completes immediately
        interval.tick().await;
        loop {
            interval.tick().await;
            Arc::clone(&self).sweep().await;
        }
    }

    /// Flags consultations silently running past their estimate; the
    /// completion path only sees overruns after the fact.
    async fn sweep(self: Arc<Self>) {
        let in_progress = match self.store.get_in_progress_appointments().await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Running-over sweep skipped: {}", e);
                return;
            }
        };

        let now = Utc::now();
        for entry in in_progress {
            let Some(checked_in) = entry.checked_in_at else {
                continue;
            };
            let over =
                (now - checked_in).num_minutes() - i64::from(entry.estimated_duration_minutes);
            if over > DURATION_ANOMALY_THRESHOLD_MINUTES {
                self.record_disruption(Disruption::new(
                    DisruptionType::AppointmentRunningOver,
                    entry.id,
                    entry.clinic_id,
                    format!("in progress {} minutes over the estimate", over),
                ))
                .await;
                Arc::clone(&self).schedule_recalculation(entry.clinic_id).await;
            }
        }
    }
}

fn parse_entry(payload: &Value) -> Option<QueueEntry> {
    payload
        .get("entry")
        .cloned()
        .and_then(|raw| serde_json::from_value(raw).ok())
}

fn parse_time(payload: &Value, key: &str) -> Option<DateTime<Utc>> {
    payload
        .get(key)
        .cloned()
        .and_then(|raw| serde_json::from_value(raw).ok())
}
