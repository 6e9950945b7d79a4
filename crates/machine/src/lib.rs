//! TiltR machine
//!
//! Worker side of a distributed run. A machine registers with the master,
//! claims assignments up to its capacity and drives each case through a
//! WebDriver session on the grid:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ Agent                                                        │
//! │   register ──► heartbeat loop (cancels reclaimed work)       │
//! │   claim ──► Executor::execute(ticket) ──► report outcome     │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Executor                                                     │
//! │   SessionFactory::open(persona) ──► steps ──► expect checks  │
//! │   diagnostics on failure: url, title, screenshot, timings    │
//! ├──────────────────────────────────────────────────────────────┤
//! │ WebDriverSession (W3C over HTTP)                             │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod agent;
pub mod client;
pub mod config;
pub mod error;
pub mod executor;
pub mod session;
pub mod webdriver;

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use agent::{Agent, AgentConfig};
pub use client::HttpCoordinator;
pub use config::MachineConfig;
pub use error::{MachineError, MachineResult, SessionError, SessionResult};
pub use executor::{Executor, ExecutorConfig};
pub use session::{Session, SessionFactory};
pub use webdriver::WebDriverFactory;

/// Serve the master at `config.master_url` until `shutdown` is cancelled
pub async fn run_machine(config: &MachineConfig, shutdown: CancellationToken) -> MachineResult<()> {
    let api = HttpCoordinator::with_timeout(
        &config.master_url,
        Duration::from_secs(config.timeouts.coordinator_secs),
    )?;
    let factory = WebDriverFactory::new(config.webdriver())?;
    let executor = Executor::new(Arc::new(factory), config.executor());

    info!(
        master = %config.master_url,
        grid = %config.grid_url,
        capacity = config.capacity,
        "Machine starting"
    );

    Agent::new(Arc::new(api), Arc::new(executor), config.agent())
        .run(shutdown)
        .await
}
