pub mod disruption;
pub mod estimators;
pub mod orchestrator;
