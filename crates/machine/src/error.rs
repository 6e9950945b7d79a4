//! Error types for the machine

use thiserror::Error;
use tiltr_common::{Failure, FailureKind};

/// Typed failure of a single browser-session command
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{kind}: {message}")]
pub struct SessionError {
    pub kind: FailureKind,
    pub message: String,
}

impl SessionError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Transport, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Protocol, message)
    }

    pub fn element_not_found(selector: &str) -> Self {
        Self::new(FailureKind::ElementNotFound, format!("no element matches '{}'", selector))
    }

    pub fn assertion(message: impl Into<String>) -> Self {
        Self::new(FailureKind::AssertionMismatch, message)
    }
}

impl From<reqwest::Error> for SessionError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::timeout(e.to_string())
        } else if e.is_decode() {
            Self::protocol(e.to_string())
        } else {
            Self::transport(e.to_string())
        }
    }
}

impl From<SessionError> for Failure {
    fn from(e: SessionError) -> Self {
        Failure::new(e.kind, e.message)
    }
}

pub type SessionResult<T> = Result<T, SessionError>;

#[derive(Error, Debug)]
pub enum MachineError {
    #[error("Coordinator error: {0}")]
    Coordinator(#[from] tiltr_common::Error),

    #[error("Registration with the master failed after {0} attempts")]
    Registration(usize),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type MachineResult<T> = Result<T, MachineError>;
