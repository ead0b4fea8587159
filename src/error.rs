//! Error types for the voice pipeline

use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur anywhere in the pipeline.
///
/// Workers never hand these to the dispatcher as panics: they are caught at
/// the worker boundary and folded into a normal [`crate::dispatcher::PipelineEvent`].
#[derive(Debug, Error)]
pub enum Error {
    /// A model, voice or detector could not be constructed
    #[error("initialization failed: {0}")]
    InitializationFailed(String),

    /// The audio hardware is busy or inaccessible
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// The NLU service could not be reached
    #[error("network failure: {0}")]
    NetworkFailure(String),

    /// A bounded wait ran out
    #[error("timed out: {0}")]
    Timeout(String),

    /// A platform side effect was rejected
    #[error("action failed: {0}")]
    ActionExecutionFailure(String),

    /// The pipeline is not in a state that allows the request
    #[error("pipeline busy: {0}")]
    Busy(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else {
            Self::NetworkFailure(err.to_string())
        }
    }
}
