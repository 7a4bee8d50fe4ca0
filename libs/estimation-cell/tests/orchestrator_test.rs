use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use estimation_cell::{
    DisruptionType, EstimationChain, HistoricalAverageEstimator, MlWaitTimeEstimator,
    OrchestratorConfig, RuleBasedEstimator, WaitTimeEstimationOrchestrator,
};
use queue_cell::testing::{entry_fixture, InMemoryAppointmentStore};
use queue_cell::{AppointmentStatus, AppointmentStore, ClinicQueueConfig, HistoricalAverages};
use shared_events::{DomainEvent, EventBus, QueueEventType};

struct Harness {
    store: Arc<InMemoryAppointmentStore>,
    events: Arc<EventBus>,
    orchestrator: WaitTimeEstimationOrchestrator,
}

impl Harness {
    async fn new(config: OrchestratorConfig) -> Self {
        Self::with_store(Arc::new(InMemoryAppointmentStore::new()), config).await
    }

    async fn with_store(store: Arc<InMemoryAppointmentStore>, config: OrchestratorConfig) -> Self {
        let events = EventBus::new();

        // No prediction service in play; the chain lands on the rule-based
        // stage without touching the network.
        let chain = Arc::new(EstimationChain::new(
            Arc::new(MlWaitTimeEstimator::with_base_url("", 0.6)),
            Arc::new(RuleBasedEstimator),
            Arc::new(HistoricalAverageEstimator),
            Duration::from_secs(30),
        ));

        let orchestrator = WaitTimeEstimationOrchestrator::new(
            store.clone(),
            Arc::clone(&events),
            chain,
            config,
        );
        orchestrator.initialize().await;

        Self {
            store,
            events,
            orchestrator,
        }
    }

    fn seed_waiting_clinic(&self, count: i32) -> (Uuid, Uuid) {
        let clinic_id = Uuid::new_v4();
        let staff_id = Uuid::new_v4();
        self.store
            .set_config(staff_id, ClinicQueueConfig::slotted(clinic_id));
        self.store.set_averages(
            staff_id,
            HistoricalAverages {
                avg_consultation_minutes: 10.0,
                avg_wait_minutes: 20.0,
                sample_size: 25,
            },
        );
        for position in 1..=count {
            self.store
                .insert_entry(entry_fixture(clinic_id, staff_id, position, Utc::now()));
        }
        (clinic_id, staff_id)
    }

    async fn teardown(&self) {
        self.orchestrator.cleanup().await;
        self.events.shutdown().await;
    }
}

fn reorder_event(clinic_id: Uuid) -> DomainEvent {
    DomainEvent::new(
        QueueEventType::QueuePositionChanged,
        Uuid::new_v4(),
        clinic_id,
        json!({ "previous_position": 1, "new_position": 4 }),
    )
}

#[tokio::test(start_paused = true)]
async fn burst_of_triggers_coalesces_into_one_recalculation() {
    let h = Harness::new(OrchestratorConfig {
        debounce: Duration::from_millis(200),
        sweep_interval: Duration::from_secs(3_600),
        batch_size: 2,
    })
    .await;
    let (clinic_id, _) = h.seed_waiting_clinic(3);

    for _ in 0..5 {
        h.events.publish(reorder_event(clinic_id));
    }

    tokio::time::sleep(Duration::from_secs(2)).await;

    let batches = h.store.prediction_batches();
    assert_eq!(batches.len(), 1, "five triggers must produce one pass");
    assert_eq!(batches[0].len(), 3);
    assert!(batches[0]
        .iter()
        .all(|patch| patch.prediction_mode == "rule-based"));

    // The clinic's disruption buffer was consumed by the pass.
    assert!(h.orchestrator.buffered_disruptions(clinic_id).await.is_empty());

    h.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn clinics_debounce_independently() {
    let h = Harness::new(OrchestratorConfig {
        debounce: Duration::from_millis(200),
        sweep_interval: Duration::from_secs(3_600),
        batch_size: 5,
    })
    .await;
    let (clinic_a, _) = h.seed_waiting_clinic(1);
    let (clinic_b, _) = h.seed_waiting_clinic(2);

    h.events.publish(reorder_event(clinic_a));
    h.events.publish(reorder_event(clinic_b));

    tokio::time::sleep(Duration::from_secs(2)).await;

    let batches = h.store.prediction_batches();
    assert_eq!(batches.len(), 2);

    let sizes: Vec<usize> = batches.iter().map(|b| b.len()).collect();
    assert!(sizes.contains(&1) && sizes.contains(&2));

    h.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn predictions_are_written_back_to_every_waiting_entry() {
    let h = Harness::new(OrchestratorConfig {
        debounce: Duration::from_millis(100),
        sweep_interval: Duration::from_secs(3_600),
        batch_size: 2,
    })
    .await;
    let (clinic_id, staff_id) = h.seed_waiting_clinic(4);

    h.events.publish(reorder_event(clinic_id));
    tokio::time::sleep(Duration::from_secs(2)).await;

    let schedule = h
        .store
        .get_daily_schedule(staff_id, Utc::now().date_naive())
        .await
        .expect("schedule should load");
    assert_eq!(schedule.len(), 4);
    for entry in &schedule {
        assert!(entry.predicted_wait_time.is_some());
        assert!(entry.predicted_start_time.is_some());
        assert!(entry.prediction_confidence.is_some());
        assert!(entry.last_prediction_update.is_some());
    }

    // The head of the queue waits the least.
    let first = schedule.iter().find(|e| e.queue_position == 1).unwrap();
    let last = schedule.iter().find(|e| e.queue_position == 4).unwrap();
    assert!(first.predicted_wait_time < last.predicted_wait_time);

    h.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn late_check_in_is_buffered_but_punctual_one_is_not() {
    let h = Harness::new(OrchestratorConfig {
        debounce: Duration::from_secs(3_600),
        sweep_interval: Duration::from_secs(3_600),
        batch_size: 5,
    })
    .await;
    let late_clinic = Uuid::new_v4();
    let punctual_clinic = Uuid::new_v4();
    let now = Utc::now();

    h.events.publish(DomainEvent::new(
        QueueEventType::PatientCheckedIn,
        Uuid::new_v4(),
        late_clinic,
        json!({
            "scheduled_time": now - chrono::Duration::minutes(20),
            "arrived_at": now,
        }),
    ));
    h.events.publish(DomainEvent::new(
        QueueEventType::PatientCheckedIn,
        Uuid::new_v4(),
        punctual_clinic,
        json!({
            "scheduled_time": now,
            "arrived_at": now,
        }),
    ));

    tokio::time::sleep(Duration::from_millis(100)).await;

    let buffered = h.orchestrator.buffered_disruptions(late_clinic).await;
    assert_eq!(buffered.len(), 1);
    assert_eq!(buffered[0].kind, DisruptionType::LateArrival);

    assert!(h
        .orchestrator
        .buffered_disruptions(punctual_clinic)
        .await
        .is_empty());

    h.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn emergency_insertions_are_buffered() {
    let h = Harness::new(OrchestratorConfig {
        debounce: Duration::from_secs(3_600),
        sweep_interval: Duration::from_secs(3_600),
        batch_size: 5,
    })
    .await;
    let clinic_id = Uuid::new_v4();

    h.events.publish(DomainEvent::new(
        QueueEventType::PatientAddedToQueue,
        Uuid::new_v4(),
        clinic_id,
        json!({ "is_emergency": true, "is_walk_in": false }),
    ));
    h.events.publish(DomainEvent::new(
        QueueEventType::PatientAddedToQueue,
        Uuid::new_v4(),
        clinic_id,
        json!({ "is_emergency": false, "is_walk_in": false }),
    ));

    tokio::time::sleep(Duration::from_millis(100)).await;

    let buffered = h.orchestrator.buffered_disruptions(clinic_id).await;
    assert_eq!(buffered.len(), 1);
    assert_eq!(buffered[0].kind, DisruptionType::EmergencyInserted);

    h.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn completed_overrun_is_recorded_from_the_event_payload() {
    let h = Harness::new(OrchestratorConfig {
        debounce: Duration::from_secs(3_600),
        sweep_interval: Duration::from_secs(3_600),
        batch_size: 5,
    })
    .await;
    let clinic_id = Uuid::new_v4();
    let now = Utc::now();

    let mut entry = entry_fixture(clinic_id, Uuid::new_v4(), 1, now - chrono::Duration::minutes(40));
    entry.status = AppointmentStatus::Completed;
    entry.checked_in_at = Some(now - chrono::Duration::minutes(40));
    entry.actual_end_time = Some(now);
    entry.estimated_duration_minutes = 15;

    h.events.publish(DomainEvent::new(
        QueueEventType::AppointmentStatusChanged,
        entry.id,
        clinic_id,
        json!({ "entry": entry, "status": "COMPLETED" }),
    ));

    tokio::time::sleep(Duration::from_millis(100)).await;

    let buffered = h.orchestrator.buffered_disruptions(clinic_id).await;
    assert!(buffered
        .iter()
        .any(|d| d.kind == DisruptionType::LongerThanExpected));

    h.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn sweep_raises_running_over_and_cleanup_cancels_pending_work() {
    let h = Harness::new(OrchestratorConfig {
        debounce: Duration::from_secs(10),
        sweep_interval: Duration::from_secs(60),
        batch_size: 5,
    })
    .await;
    let clinic_id = Uuid::new_v4();
    let staff_id = Uuid::new_v4();

    let mut running_over = entry_fixture(clinic_id, staff_id, 1, Utc::now());
    running_over.status = AppointmentStatus::InProgress;
    running_over.checked_in_at = Some(Utc::now() - chrono::Duration::minutes(30));
    running_over.estimated_duration_minutes = 15;
    h.store.insert_entry(running_over.clone());

    tokio::time::sleep(Duration::from_secs(61)).await;

    let buffered = h.orchestrator.buffered_disruptions(clinic_id).await;
    assert_eq!(buffered.len(), 1);
    assert_eq!(buffered[0].kind, DisruptionType::AppointmentRunningOver);
    assert_eq!(buffered[0].appointment_id, running_over.id);

    // Tear down before the debounce fires; the scheduled pass must die with it.
    h.orchestrator.cleanup().await;
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(h.store.prediction_batches().is_empty());

    h.events.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn trigger_during_a_running_pass_schedules_a_follow_up() {
    let store = Arc::new(InMemoryAppointmentStore::gated());
    let h = Harness::with_store(
        Arc::clone(&store),
        OrchestratorConfig {
            debounce: Duration::from_millis(100),
            sweep_interval: Duration::from_secs(3_600),
            batch_size: 5,
        },
    )
    .await;
    let (clinic_id, _) = h.seed_waiting_clinic(2);

    // First pass fires and parks inside the queue read.
    h.events.publish(reorder_event(clinic_id));
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(h.store.prediction_batches().is_empty());

    // A trigger landing while that pass is in flight must not cancel it;
    // it earns its own pass after the quiet period.
    h.events.publish(reorder_event(clinic_id));
    tokio::time::sleep(Duration::from_millis(150)).await;

    store.open_gate(2);
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(h.store.prediction_batches().len(), 2);

    h.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn events_after_cleanup_are_ignored() {
    let h = Harness::new(OrchestratorConfig {
        debounce: Duration::from_millis(100),
        sweep_interval: Duration::from_secs(3_600),
        batch_size: 5,
    })
    .await;
    let (clinic_id, _) = h.seed_waiting_clinic(2);

    h.orchestrator.cleanup().await;

    h.events.publish(reorder_event(clinic_id));
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert!(h.store.prediction_batches().is_empty());
    assert!(h.orchestrator.buffered_disruptions(clinic_id).await.is_empty());

    h.events.shutdown().await;
}
