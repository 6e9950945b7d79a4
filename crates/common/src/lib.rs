//! TiltR Common Library
//!
//! Shared data model, plan format, result store and wire protocol for the
//! TiltR master and machines.

pub mod db;
pub mod error;
pub mod plan;
pub mod protocol;
pub mod types;

// Re-export commonly used types
pub use db::Database;
pub use error::{Error, Result};
pub use plan::{Check, LoginForm, Persona, Step, TestCase, TestPlan};
pub use protocol::CoordinatorApi;
pub use types::*;

/// TiltR version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default state directory
pub fn default_store_path() -> std::path::PathBuf {
    std::env::var_os("HOME")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".tiltr")
}

/// Default result store path
pub fn default_db_path() -> std::path::PathBuf {
    default_store_path().join("results.db")
}

/// Default directory for screenshots and other attempt artifacts
pub fn default_artifacts_path() -> std::path::PathBuf {
    default_store_path().join("artifacts")
}
