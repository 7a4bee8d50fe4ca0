use chrono::{Duration, Utc};
use uuid::Uuid;

use estimation_cell::{DisruptionDetector, DisruptionType};
use queue_cell::testing::entry_fixture;

#[test]
fn clean_entry_has_no_disruption() {
    let now = Utc::now();
    let entry = entry_fixture(Uuid::new_v4(), Uuid::new_v4(), 1, now);

    let check = DisruptionDetector::check(&entry, now);
    assert!(!check.has_disruption);
    assert!(check.reasons.is_empty());
    assert!(!check.should_show_estimation);
}

#[test]
fn late_check_in_past_threshold_is_flagged_with_delta() {
    let now = Utc::now();
    let mut entry = entry_fixture(Uuid::new_v4(), Uuid::new_v4(), 1, now - Duration::minutes(30));
    entry.checked_in_at = Some(entry.scheduled_time + Duration::minutes(12));

    let check = DisruptionDetector::check(&entry, now);
    assert!(check.has_disruption);
    let reason = check
        .reasons
        .iter()
        .find(|r| r.kind == DisruptionType::LateArrival)
        .expect("late arrival expected");
    assert_eq!(reason.delta_minutes, Some(12));
}

#[test]
fn check_in_within_grace_is_not_late() {
    let now = Utc::now();
    let mut entry = entry_fixture(Uuid::new_v4(), Uuid::new_v4(), 1, now - Duration::minutes(30));
    entry.checked_in_at = Some(entry.scheduled_time + Duration::minutes(5));

    let check = DisruptionDetector::check(&entry, now);
    assert!(!check.has_disruption);
}

#[test]
fn completed_overrun_reports_signed_rounded_delta() {
    let now = Utc::now();
    let mut entry = entry_fixture(Uuid::new_v4(), Uuid::new_v4(), 1, now - Duration::minutes(20));
    entry.checked_in_at = Some(now - Duration::minutes(20));
    entry.actual_end_time = Some(now);
    entry.estimated_duration_minutes = 15;

    let check = DisruptionDetector::check(&entry, now);
    let reason = check
        .reasons
        .iter()
        .find(|r| r.kind == DisruptionType::LongerThanExpected)
        .expect("overrun expected");
    assert_eq!(reason.delta_minutes, Some(5));
}

#[test]
fn finishing_slightly_early_is_normal_variation() {
    let now = Utc::now();
    let mut entry = entry_fixture(Uuid::new_v4(), Uuid::new_v4(), 1, now - Duration::minutes(15));
    entry.checked_in_at = Some(now - Duration::minutes(12));
    entry.actual_end_time = Some(now);
    entry.estimated_duration_minutes = 15;

    let check = DisruptionDetector::check(&entry, now);
    assert!(check
        .reasons
        .iter()
        .all(|r| r.kind != DisruptionType::ShorterThanExpected));
}

#[test]
fn finishing_far_early_is_an_anomaly() {
    let now = Utc::now();
    let mut entry = entry_fixture(Uuid::new_v4(), Uuid::new_v4(), 1, now - Duration::minutes(30));
    entry.checked_in_at = Some(now - Duration::minutes(4));
    entry.actual_end_time = Some(now);
    entry.estimated_duration_minutes = 20;

    let check = DisruptionDetector::check(&entry, now);
    let reason = check
        .reasons
        .iter()
        .find(|r| r.kind == DisruptionType::ShorterThanExpected)
        .expect("early finish expected");
    assert_eq!(reason.delta_minutes, Some(-16));
}

#[test]
fn open_absence_and_later_return_are_both_reported() {
    let now = Utc::now();
    let mut absent = entry_fixture(Uuid::new_v4(), Uuid::new_v4(), 1, now - Duration::minutes(10));
    absent.is_present = false;
    absent.marked_absent_at = Some(now - Duration::minutes(8));

    let check = DisruptionDetector::check(&absent, now);
    assert!(check
        .reasons
        .iter()
        .any(|r| r.kind == DisruptionType::NoShow));

    let mut returned = absent.clone();
    returned.is_present = true;
    returned.returned_at = Some(now - Duration::minutes(2));

    let check = DisruptionDetector::check(&returned, now);
    assert!(check
        .reasons
        .iter()
        .all(|r| r.kind != DisruptionType::NoShow));
    assert!(check
        .reasons
        .iter()
        .any(|r| r.kind == DisruptionType::PatientReturned));
}

#[test]
fn skips_and_manual_moves_count_as_overrides() {
    let now = Utc::now();
    let mut entry = entry_fixture(Uuid::new_v4(), Uuid::new_v4(), 4, now);
    entry.skip_count = 2;
    entry.queue_position = 7;

    let check = DisruptionDetector::check(&entry, now);
    let overrides: Vec<_> = check
        .reasons
        .iter()
        .filter(|r| r.kind == DisruptionType::QueueOverride)
        .collect();
    assert_eq!(overrides.len(), 2);
}

#[test]
fn estimation_is_only_shown_when_a_prediction_exists() {
    let now = Utc::now();
    let mut entry = entry_fixture(Uuid::new_v4(), Uuid::new_v4(), 1, now - Duration::minutes(30));
    entry.checked_in_at = Some(entry.scheduled_time + Duration::minutes(15));

    let without_prediction = DisruptionDetector::check(&entry, now);
    assert!(without_prediction.has_disruption);
    assert!(!without_prediction.should_show_estimation);

    entry.predicted_wait_time = Some(25);
    let with_prediction = DisruptionDetector::check(&entry, now);
    assert!(with_prediction.should_show_estimation);
}
