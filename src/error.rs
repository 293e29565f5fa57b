//! Common error types for the admission control layer

use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AdmissionError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("Request not found: {0}")]
    RequestNotFound(String),

    #[error("Request {0} is not in a state that allows this operation")]
    InvalidRequestState(String),

    #[error("All backend instances unavailable for: {0}")]
    AllBackendsUnavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AdmissionError {
    /// Machine-readable reason code for callers that surface errors to users.
    pub fn code(&self) -> &'static str {
        match self {
            AdmissionError::Config(_) => "config_error",
            AdmissionError::Io(_) => "io_error",
            AdmissionError::Json(_) => "invalid_json",
            AdmissionError::HttpClient(_) => "backend_error",
            AdmissionError::RequestNotFound(_) => "request_not_found",
            AdmissionError::InvalidRequestState(_) => "invalid_request_state",
            AdmissionError::AllBackendsUnavailable(_) => "all_backends_unavailable",
            AdmissionError::Internal(_) => "server_error",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, AdmissionError>;
