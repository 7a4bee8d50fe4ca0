pub mod queue;
pub mod store;
pub mod strategy;
