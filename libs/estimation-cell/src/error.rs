use thiserror::Error;

/// Internal estimator failures. These never reach estimation callers: the
/// chain catches every stage and falls through to the next one.
#[derive(Error, Debug)]
pub enum EstimationError {
    #[error("Estimator unavailable: {0}")]
    Unavailable(String),

    #[error("Prediction service error: {0}")]
    Service(String),

    #[error("Missing estimation data: {0}")]
    MissingData(String),

    #[error("Store error: {0}")]
    Store(String),
}
