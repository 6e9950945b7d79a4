//! Liveness and deadline sweep
//!
//! Periodically reclaims assignments from machines that stopped
//! heartbeating and aborts runs that outlived their deadline.

use std::sync::Arc;
use std::time::Duration;
use tiltr_common::now_ms;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::coordinator::Coordinator;

/// Background sweeper driving `expire_workers` and `enforce_deadlines`
pub struct Reaper {
    coordinator: Arc<Coordinator>,
    interval: Duration,
}

impl Reaper {
    pub fn new(coordinator: Arc<Coordinator>, interval: Duration) -> Self {
        Self {
            coordinator,
            interval,
        }
    }

    /// Run the sweep loop until `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) {
        info!("Reaper started (every {:?})", self.interval);

        loop {
            self.sweep();

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        info!("Reaper stopped");
    }

    /// One pass over workers and runs
    pub fn sweep(&self) {
        let now = now_ms();

        match self.coordinator.expire_workers(now) {
            Ok(expired) if !expired.is_empty() => {
                warn!("Expired {} silent worker(s)", expired.len());
            }
            Ok(_) => {}
            Err(e) => error!("Worker expiry error: {}", e),
        }

        match self.coordinator.enforce_deadlines(now) {
            Ok(aborted) => {
                for run_id in aborted {
                    warn!(run_id = %run_id, "Run aborted by deadline");
                }
            }
            Err(e) => error!("Deadline enforcement error: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::{LivenessPolicy, RunOptions};
    use tiltr_common::{Database, RunState, TestPlan};

    #[tokio::test]
    async fn test_reaper_aborts_expired_run_and_stops() {
        let coordinator = Arc::new(Coordinator::new(
            Database::open_memory().unwrap(),
            LivenessPolicy {
                heartbeat_interval: Duration::from_millis(10),
                liveness_timeout: Duration::from_millis(20),
            },
        ));
        let plan = TestPlan::from_yaml(
            r#"
name: reaper
base_url: http://web
personas:
  alice: { username: alice, password: pw }
cases:
  - id: only
    persona: alice
    steps: [{ action: sleep, ms: 10 }]
"#,
        )
        .unwrap();
        let run_id = coordinator
            .start_run(
                &plan,
                &RunOptions {
                    retry_limit: 0,
                    timeout: Duration::from_millis(30),
                },
            )
            .unwrap();
        let worker = coordinator.register_worker("m1", 1).unwrap().worker_id;

        let shutdown = CancellationToken::new();
        let reaper = Reaper::new(coordinator.clone(), Duration::from_millis(10));
        let handle = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { reaper.run(shutdown).await })
        };

        tokio::time::sleep(Duration::from_millis(150)).await;
        shutdown.cancel();
        handle.await.unwrap();

        assert_eq!(coordinator.run(&run_id).unwrap().state, RunState::Aborted);
        let workers = coordinator.list_workers().unwrap();
        assert!(workers.iter().all(|w| w.id != worker || !w.alive));
    }
}
