//! Worker agent
//!
//! Registers with the coordinator, keeps its identity alive with heartbeats
//! and pulls assignments up to its capacity. Each claimed assignment runs on
//! its own task under a cancellation token the heartbeat can trip when the
//! coordinator reclaims the work. When the identity itself is declared dead
//! the agent drops everything it holds and joins again under a new one.

use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tiltr_common::protocol::WorkerRegistration;
use tiltr_common::{
    AssignmentTicket, CoordinatorApi, Diagnostics, Error, Failure, FailureKind, Outcome,
};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{MachineError, MachineResult};
use crate::executor::Executor;

/// Agent identity, capacity and polling behaviour
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub name: String,
    /// Concurrent executions
    pub capacity: u32,
    /// Claim interval while work is flowing; doubles while the queue is empty
    pub poll_interval: Duration,
    pub max_backoff: Duration,
    pub register_attempts: usize,
    pub register_delay: Duration,
    pub report_attempts: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "machine".to_string(),
            capacity: 1,
            poll_interval: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
            register_attempts: 5,
            register_delay: Duration::from_secs(1),
            report_attempts: 3,
        }
    }
}

type InFlight = Arc<Mutex<HashMap<String, CancellationToken>>>;

pub struct Agent {
    api: Arc<dyn CoordinatorApi>,
    executor: Arc<Executor>,
    config: AgentConfig,
}

impl Agent {
    pub fn new(api: Arc<dyn CoordinatorApi>, executor: Arc<Executor>, config: AgentConfig) -> Self {
        Self { api, executor, config }
    }

    /// Serve the coordinator until `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) -> MachineResult<()> {
        loop {
            let Some(registration) = self.register(&shutdown).await? else {
                return Ok(());
            };
            self.serve(registration, &shutdown).await;

            if shutdown.is_cancelled() {
                info!("Agent stopped");
                return Ok(());
            }
            warn!("Identity lost, re-registering with the coordinator");
        }
    }

    /// Returns `None` when shutdown arrives first
    async fn register(&self, shutdown: &CancellationToken) -> MachineResult<Option<WorkerRegistration>> {
        let attempts = self.config.register_attempts.max(1);
        for attempt in 1..=attempts {
            match self.api.register(&self.config.name, self.config.capacity).await {
                Ok(registration) => {
                    info!(
                        worker_id = %registration.worker_id,
                        capacity = self.config.capacity,
                        "Registered with coordinator"
                    );
                    return Ok(Some(registration));
                }
                Err(e @ Error::InvalidRequest(_)) => return Err(e.into()),
                Err(e) => warn!("Registration attempt {}/{} failed: {}", attempt, attempts, e),
            }

            if attempt < attempts {
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(None),
                    _ = tokio::time::sleep(self.config.register_delay) => {}
                }
            }
        }
        Err(MachineError::Registration(attempts))
    }

    /// Work under one identity until it is lost or shutdown is requested
    async fn serve(&self, registration: WorkerRegistration, shutdown: &CancellationToken) {
        let worker_id = registration.worker_id;
        let identity = shutdown.child_token();
        let in_flight: InFlight = Arc::new(Mutex::new(HashMap::new()));

        let heartbeat = tokio::spawn(heartbeat_loop(
            self.api.clone(),
            worker_id.clone(),
            Duration::from_millis(registration.heartbeat_interval_ms.max(1)),
            in_flight.clone(),
            identity.clone(),
        ));

        let permits = Arc::new(Semaphore::new(self.config.capacity as usize));
        let mut tasks = JoinSet::new();
        let mut backoff = self.config.poll_interval;

        loop {
            let available = permits.available_permits() as u32;
            if available > 0 && !identity.is_cancelled() {
                match self.api.claim(&worker_id, available).await {
                    Ok(tickets) if !tickets.is_empty() => {
                        backoff = self.config.poll_interval;
                        for ticket in tickets {
                            let Ok(permit) = permits.clone().acquire_owned().await else {
                                break;
                            };
                            let token = identity.child_token();
                            in_flight.lock().insert(ticket.assignment_id.clone(), token.clone());

                            let execution = Execution {
                                api: self.api.clone(),
                                executor: self.executor.clone(),
                                worker_id: worker_id.clone(),
                                in_flight: in_flight.clone(),
                                report_attempts: self.config.report_attempts.max(1),
                                retry_delay: self.config.poll_interval,
                            };
                            tasks.spawn(async move {
                                execution.run(ticket, token).await;
                                drop(permit);
                            });
                        }
                        continue;
                    }
                    Ok(_) => backoff = (backoff * 2).min(self.config.max_backoff),
                    Err(Error::WorkerUnavailable(reason)) => {
                        warn!(worker_id = %worker_id, "Coordinator dropped this worker: {}", reason);
                        identity.cancel();
                    }
                    Err(e) => {
                        warn!("Claim failed: {}", e);
                        backoff = (backoff * 2).min(self.config.max_backoff);
                    }
                }
            }

            tokio::select! {
                _ = identity.cancelled() => break,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!("Execution task failed: {}", e);
                    }
                }
                _ = tokio::time::sleep(jitter(backoff)) => {}
            }
        }

        // Cancelling the identity cancels every execution token derived from it
        identity.cancel();
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("Execution task failed: {}", e);
            }
        }
        if let Err(e) = heartbeat.await {
            error!("Heartbeat task failed: {}", e);
        }
        debug!(worker_id = %worker_id, "Identity retired");
    }
}

async fn heartbeat_loop(
    api: Arc<dyn CoordinatorApi>,
    worker_id: String,
    interval: Duration,
    in_flight: InFlight,
    identity: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = identity.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }

        let held: Vec<String> = in_flight.lock().keys().cloned().collect();
        match api.heartbeat(&worker_id, &held).await {
            Ok(response) => {
                let in_flight = in_flight.lock();
                for assignment_id in response.cancelled {
                    if let Some(token) = in_flight.get(&assignment_id) {
                        info!(assignment_id = %assignment_id, "Coordinator reclaimed assignment, cancelling");
                        token.cancel();
                    }
                }
            }
            Err(Error::WorkerUnavailable(reason)) => {
                warn!(worker_id = %worker_id, "Heartbeat rejected: {}", reason);
                identity.cancel();
                return;
            }
            Err(e) => warn!("Heartbeat failed: {}", e),
        }
    }
}

/// Everything one execution task needs
struct Execution {
    api: Arc<dyn CoordinatorApi>,
    executor: Arc<Executor>,
    worker_id: String,
    in_flight: InFlight,
    report_attempts: usize,
    retry_delay: Duration,
}

impl Execution {
    async fn run(self, ticket: AssignmentTicket, token: CancellationToken) {
        let assignment_id = ticket.assignment_id.clone();

        let outcome = match self.start(&assignment_id).await {
            Ok(true) => self.executor.execute(&ticket, token.clone()).await,
            Ok(false) => {
                self.in_flight.lock().remove(&assignment_id);
                info!(assignment_id = %assignment_id, "Assignment no longer held, skipping");
                return;
            }
            Err(e @ (Error::WorkerUnavailable(_) | Error::NotFound { .. })) => {
                self.in_flight.lock().remove(&assignment_id);
                warn!(assignment_id = %assignment_id, "Coordinator refused start: {}", e);
                return;
            }
            // An unconfirmed start goes back as a retryable failure
            Err(e) => {
                warn!(assignment_id = %assignment_id, "Failed to mark assignment started: {}", e);
                Outcome::failed(
                    Failure::new(FailureKind::Transport, format!("could not start assignment: {}", e)),
                    0,
                    Diagnostics::default(),
                )
            }
        };
        self.in_flight.lock().remove(&assignment_id);

        if token.is_cancelled() {
            debug!(assignment_id = %assignment_id, "Execution cancelled, outcome discarded");
            return;
        }

        self.report(&assignment_id, outcome).await;
    }

    async fn start(&self, assignment_id: &str) -> tiltr_common::Result<bool> {
        let mut attempt = 1;
        loop {
            match self.api.start(assignment_id, &self.worker_id).await {
                Err(Error::Transport(e)) if attempt < self.report_attempts => {
                    warn!(assignment_id, "Start attempt {} failed: {}", attempt, e);
                    tokio::time::sleep(self.retry_delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn report(&self, assignment_id: &str, outcome: Outcome) {
        for attempt in 1..=self.report_attempts {
            match self.api.report(assignment_id, &self.worker_id, outcome.clone()).await {
                Ok(ack) => {
                    if !ack.accepted {
                        debug!(assignment_id, "Coordinator ignored outcome");
                    }
                    return;
                }
                Err(Error::Transport(e)) if attempt < self.report_attempts => {
                    warn!(assignment_id, "Report attempt {} failed: {}", attempt, e);
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => {
                    error!(assignment_id, "Failed to report outcome: {}", e);
                    return;
                }
            }
        }
    }
}

/// Spread polls by up to a quarter of the interval
fn jitter(base: Duration) -> Duration {
    let spread = (base.as_millis() as u64) / 4;
    if spread == 0 {
        return base;
    }
    base + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}
