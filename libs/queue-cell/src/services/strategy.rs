use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use tracing::debug;

use crate::models::{
    AppointmentStatus, ClinicQueueConfig, QueueEntry, QueueMode, WaitlistEntry, WaitlistStatus,
};

#[derive(Debug, Clone)]
pub struct StrategyContext {
    pub now: DateTime<Utc>,
    pub config: ClinicQueueConfig,
}

#[derive(Debug, Clone)]
pub enum NextPatient {
    Scheduled {
        entry: QueueEntry,
        /// The patient is present ahead of their scheduled time; calling them
        /// now frees their slot.
        can_call_early: bool,
    },
    FromWaitlist {
        entry: WaitlistEntry,
        notify_immediately: bool,
    },
}

/// Decision returned by `handle_late_arrival`; the caller applies it.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueAction {
    KeepOriginalSlot,
    ReassignPosition(i32),
    RouteToWaitlist,
    PriorityPenalty { new_position: i32 },
}

/// Next-patient selection. Implementations never mutate state; QueueService
/// applies the returned decision.
pub trait QueueStrategy: Send + Sync {
    fn next_patient(
        &self,
        schedule: &[QueueEntry],
        ctx: &StrategyContext,
        waitlist: Option<&[WaitlistEntry]>,
    ) -> Option<NextPatient>;

    fn handle_late_arrival(
        &self,
        entry: &QueueEntry,
        schedule: &[QueueEntry],
        ctx: &StrategyContext,
    ) -> QueueAction;
}

pub fn strategy_for_mode(mode: QueueMode) -> Box<dyn QueueStrategy> {
    match mode {
        QueueMode::Slotted => Box::new(SlottedQueueStrategy),
        QueueMode::Fluid => Box::new(FluidQueueStrategy),
    }
}

/// Time is king: fixed appointment times are preserved, only slot-filling
/// happens. Never re-shifts other patients' times.
pub struct SlottedQueueStrategy;

impl QueueStrategy for SlottedQueueStrategy {
    fn next_patient(
        &self,
        schedule: &[QueueEntry],
        ctx: &StrategyContext,
        waitlist: Option<&[WaitlistEntry]>,
    ) -> Option<NextPatient> {
        // A slot is free when its scheduled patient has not shown up by now.
        if ctx.config.waitlist_enabled {
            if let Some(waitlist) = waitlist {
                let slot_free = schedule.iter().any(|e| {
                    e.status == AppointmentStatus::Scheduled
                        && !e.is_present
                        && e.scheduled_time <= ctx.now
                });

                if slot_free {
                    // Highest priority wins; the earlier window breaks ties.
                    let top = waitlist
                        .iter()
                        .filter(|w| w.status == WaitlistStatus::Waiting)
                        .min_by(|a, b| {
                            b.priority_score
                                .partial_cmp(&a.priority_score)
                                .unwrap_or(Ordering::Equal)
                                .then(a.window_start.cmp(&b.window_start))
                        });

                    if let Some(top) = top {
                        debug!("Free slot detected, promoting waitlist entry {}", top.id);
                        return Some(NextPatient::FromWaitlist {
                            entry: top.clone(),
                            notify_immediately: true,
                        });
                    }
                }
            }
        }

        let mut candidates: Vec<&QueueEntry> = schedule
            .iter()
            .filter(|e| e.status == AppointmentStatus::Waiting && e.skip_reason.is_none())
            .collect();
        candidates.sort_by_key(|e| e.start_time);

        // First present patient in time order; may be before their slot
        // ("call early"). If nobody is present we do not guess.
        let next = candidates.into_iter().find(|e| e.is_present)?;
        let can_call_early = next.scheduled_time > ctx.now;

        Some(NextPatient::Scheduled {
            entry: next.clone(),
            can_call_early,
        })
    }

    fn handle_late_arrival(
        &self,
        entry: &QueueEntry,
        schedule: &[QueueEntry],
        ctx: &StrategyContext,
    ) -> QueueAction {
        // Still inside the original window: the slot is theirs.
        if ctx.now <= entry.end_time {
            return QueueAction::KeepOriginalSlot;
        }

        // A cancellation or no-show later in the day frees that slot.
        let freed_slot = schedule
            .iter()
            .filter(|e| e.id != entry.id && e.status.is_terminal() && e.start_time >= ctx.now)
            .min_by_key(|e| e.start_time);

        if let Some(freed) = freed_slot {
            return QueueAction::ReassignPosition(freed.queue_position);
        }

        if ctx.config.waitlist_enabled {
            return QueueAction::RouteToWaitlist;
        }

        let last_position = schedule
            .iter()
            .filter(|e| !e.status.is_terminal())
            .map(|e| e.queue_position)
            .max()
            .unwrap_or(0);

        QueueAction::ReassignPosition(last_position + 1)
    }
}

/// Flow is king: queue order continuously adapts to the priority score.
pub struct FluidQueueStrategy;

impl QueueStrategy for FluidQueueStrategy {
    fn next_patient(
        &self,
        schedule: &[QueueEntry],
        _ctx: &StrategyContext,
        _waitlist: Option<&[WaitlistEntry]>,
    ) -> Option<NextPatient> {
        let mut candidates: Vec<&QueueEntry> = schedule
            .iter()
            .filter(|e| {
                e.status == AppointmentStatus::Waiting && e.is_present && e.skip_reason.is_none()
            })
            .collect();

        // Highest priority first, FIFO within equal priority.
        candidates.sort_by(|a, b| {
            let pa = a.priority_score.unwrap_or(0.0);
            let pb = b.priority_score.unwrap_or(0.0);
            pb.partial_cmp(&pa)
                .unwrap_or(Ordering::Equal)
                .then(a.queue_position.cmp(&b.queue_position))
        });

        candidates.first().map(|e| NextPatient::Scheduled {
            entry: (*e).clone(),
            can_call_early: false,
        })
    }

    fn handle_late_arrival(
        &self,
        entry: &QueueEntry,
        schedule: &[QueueEntry],
        _ctx: &StrategyContext,
    ) -> QueueAction {
        // Appended to the end of their priority tier, not a fixed position.
        let score = entry.priority_score.unwrap_or(0.0);
        let tier_end = schedule
            .iter()
            .filter(|e| e.id != entry.id && !e.status.is_terminal())
            .filter(|e| e.priority_score.unwrap_or(0.0) >= score)
            .map(|e| e.queue_position)
            .max()
            .unwrap_or(0);

        QueueAction::PriorityPenalty {
            new_position: tier_end + 1,
        }
    }
}
