pub mod error;
pub mod models;
pub mod services;
pub mod testing;

pub use error::QueueError;
pub use models::*;
pub use services::queue::{CallNextOutcome, QueueService};
pub use services::store::{AppointmentStore, SupabaseAppointmentStore};
pub use services::strategy::{
    strategy_for_mode, FluidQueueStrategy, NextPatient, QueueAction, QueueStrategy,
    SlottedQueueStrategy, StrategyContext,
};
