pub mod error;
pub mod models;
pub mod services;

pub use error::EstimationError;
pub use models::*;
pub use services::disruption::DisruptionDetector;
pub use services::estimators::{
    EstimationChain, HistoricalAverageEstimator, MlWaitTimeEstimator, RuleBasedEstimator,
    WaitTimeEstimator,
};
pub use services::orchestrator::{OrchestratorConfig, WaitTimeEstimationOrchestrator};
