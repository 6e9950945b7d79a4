//! Error types for TiltR

use thiserror::Error;

/// Result type alias using TiltR Error
pub type Result<T> = std::result::Result<T, Error>;

/// TiltR error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Plan parse error: {0}")]
    PlanParse(#[from] serde_yaml::Error),

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Resource not found: {kind} with id {id}")]
    NotFound { kind: String, id: String },

    #[error("Worker unavailable: {0}")]
    WorkerUnavailable(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Operation timeout after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Coordinator unreachable: {0}")]
    Transport(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn not_found(kind: &str, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind: kind.to_string(),
            id: id.into(),
        }
    }

    pub fn invalid_plan(msg: impl Into<String>) -> Self {
        Error::InvalidPlan(msg.into())
    }
}
