//! TiltR master
//!
//! Coordinates a test run across the machine pool: queues one assignment per
//! case, serves the machine API, reclaims work from silent machines and
//! aggregates the final verdict.

pub mod config;
pub mod coordinator;
pub mod reaper;
pub mod report;
pub mod server;

use std::sync::Arc;
use std::time::Duration;
use tiltr_common::{Database, RunReport, RunVerdict, TestPlan};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub use config::MasterConfig;
pub use coordinator::{Coordinator, LivenessPolicy, RunOptions};

/// Verdict and report of a finished run
pub struct RunSummary {
    pub verdict: RunVerdict,
    pub report: RunReport,
}

/// Run one plan to completion: serve machines until every case is terminal
/// or the run deadline passes.
pub async fn run_plan(
    config: &MasterConfig,
    plan: &TestPlan,
    shutdown: CancellationToken,
) -> anyhow::Result<RunSummary> {
    let listener = TcpListener::bind(&config.listen).await?;
    serve_plan(config, plan, listener, shutdown).await
}

/// [`run_plan`] on an already bound listener
pub async fn serve_plan(
    config: &MasterConfig,
    plan: &TestPlan,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> anyhow::Result<RunSummary> {
    let db = Database::open(config.db_path())?;
    let coordinator = Arc::new(Coordinator::new(db, LivenessPolicy::from(config)));

    let options = RunOptions {
        retry_limit: config.scheduling.retry_limit,
        timeout: Duration::from_secs(config.scheduling.run_timeout_secs),
    };
    let run_id = coordinator.start_run(plan, &options)?;

    let services = shutdown.child_token();

    let server_handle = tokio::spawn(server::serve(listener, coordinator.clone(), services.clone()));
    let reaper = reaper::Reaper::new(coordinator.clone(), config.liveness.reaper_interval());
    let reaper_handle = {
        let token = services.clone();
        tokio::spawn(async move { reaper.run(token).await })
    };

    let poll = Duration::from_millis(config.scheduling.finalize_poll_ms);
    let verdict = tokio::select! {
        verdict = coordinator.finalize(&run_id, poll) => verdict?,
        _ = shutdown.cancelled() => {
            info!("Shutdown requested, aborting run {}", run_id);
            coordinator.abort(&run_id, tiltr_common::now_ms())?
        }
    };

    // Machines only learn about cancelled work from their next heartbeat
    let interrupted = coordinator.interrupted(&run_id)?;
    if interrupted > 0 {
        let grace = config.liveness.drain_grace();
        info!(interrupted, "Waiting {:?} for machines to release cancelled assignments", grace);
        tokio::time::sleep(grace).await;
    }
    services.cancel();
    match server_handle.await {
        Ok(Err(e)) => error!("Server error: {}", e),
        Err(e) => error!("Server task failed: {}", e),
        Ok(Ok(())) => {}
    }
    if let Err(e) = reaper_handle.await {
        error!("Reaper task failed: {}", e);
    }

    let report = coordinator.run_report(&run_id)?;
    info!(run_id = %run_id, verdict = %verdict, "{}", report::summary(&report));
    report::log_failures(&report);

    Ok(RunSummary { verdict, report })
}
