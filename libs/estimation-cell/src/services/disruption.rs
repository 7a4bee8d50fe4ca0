use chrono::{DateTime, Utc};
use tracing::debug;

use queue_cell::QueueEntry;

use crate::models::{DisruptionCheck, DisruptionReason, DisruptionType};

/// Minutes past the scheduled time before a check-in counts as late.
pub const LATE_ARRIVAL_THRESHOLD_MINUTES: i64 = 5;

/// Minutes of deviation from the estimated duration before an early finish
/// or a silently running-over consultation counts as an anomaly. Overruns
/// of any size are reported once the consultation has ended, since every
/// minute over pushes the rest of the queue back.
pub const DURATION_ANOMALY_THRESHOLD_MINUTES: i64 = 10;

/// Stateless inspection of a single queue entry. Never fails: entries with
/// missing data simply produce fewer reasons.
pub struct DisruptionDetector;

impl DisruptionDetector {
    pub fn check(entry: &QueueEntry, now: DateTime<Utc>) -> DisruptionCheck {
        let mut reasons = Vec::new();

        if let Some(checked_in) = entry.checked_in_at {
            let late_by = (checked_in - entry.scheduled_time).num_minutes();
            if late_by > LATE_ARRIVAL_THRESHOLD_MINUTES {
                reasons.push(DisruptionReason {
                    kind: DisruptionType::LateArrival,
                    delta_minutes: Some(late_by),
                    detail: format!("checked in {} minutes late", late_by),
                });
            }
        }

        if entry.has_open_absence() {
            reasons.push(DisruptionReason {
                kind: DisruptionType::NoShow,
                delta_minutes: entry
                    .marked_absent_at
                    .map(|at| (now - at).num_minutes()),
                detail: "marked absent without return".to_string(),
            });
        }

        if entry.returned_at.is_some() {
            reasons.push(DisruptionReason {
                kind: DisruptionType::PatientReturned,
                delta_minutes: None,
                detail: "returned after an absence".to_string(),
            });
        }

        if let (Some(checked_in), Some(ended)) = (entry.checked_in_at, entry.actual_end_time) {
            let actual = (ended - checked_in).num_minutes();
            let delta = actual - i64::from(entry.estimated_duration_minutes);
            if delta > 0 {
                reasons.push(DisruptionReason {
                    kind: DisruptionType::LongerThanExpected,
                    delta_minutes: Some(delta),
                    detail: format!("ran {} minutes over the estimate", delta),
                });
            } else if delta < -DURATION_ANOMALY_THRESHOLD_MINUTES {
                reasons.push(DisruptionReason {
                    kind: DisruptionType::ShorterThanExpected,
                    delta_minutes: Some(delta),
                    detail: format!("finished {} minutes early", -delta),
                });
            }
        }

        if entry.skip_count > 0 {
            reasons.push(DisruptionReason {
                kind: DisruptionType::QueueOverride,
                delta_minutes: None,
                detail: format!("skipped {} time(s)", entry.skip_count),
            });
        }

        if entry.was_repositioned() {
            reasons.push(DisruptionReason {
                kind: DisruptionType::QueueOverride,
                delta_minutes: None,
                detail: format!(
                    "moved from position {} to {}",
                    entry.original_queue_position, entry.queue_position
                ),
            });
        }

        let has_disruption = !reasons.is_empty();
        if has_disruption {
            debug!(
                appointment_id = %entry.id,
                reasons = reasons.len(),
                "Disruption detected"
            );
        }

        DisruptionCheck {
            has_disruption,
            should_show_estimation: has_disruption && entry.predicted_wait_time.is_some(),
            reasons,
        }
    }
}
