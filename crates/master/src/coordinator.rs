//! Run coordination
//!
//! The coordinator owns the assignment state machine:
//!
//! ```text
//! Queued -> Dispatched -> Executing -> Succeeded
//!                                   -> Failed (retryable, budget left) -> Queued (attempt + 1)
//!                                   -> Failed (exhausted or semantic)  -> case Failed
//!        any non-terminal state     -> TimedOut                        -> case Aborted
//! ```
//!
//! Every operation is a single result-store transaction, so concurrent
//! claims and reports observe each other atomically.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tiltr_common::db::{self, CaseRecord, Connection};
use tiltr_common::protocol::{HeartbeatResponse, ReportAck, WorkerRegistration};
use tiltr_common::{
    new_id, now_ms, Assignment, AssignmentState, AssignmentTicket, CaseReport, CaseState,
    CoordinatorApi, Database, Diagnostics, Error, Failure, FailureKind, Outcome, Result, Run,
    RunReport, RunState, RunVerdict, TestPlan, Verdict, WorkerInfo,
};
use tracing::{debug, info, warn};

use crate::config::MasterConfig;

/// Per-run scheduling options
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Extra attempts after a retryable failure; a case runs at most
    /// `retry_limit + 1` times
    pub retry_limit: u32,
    /// Global run timeout
    pub timeout: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            retry_limit: 2,
            timeout: Duration::from_secs(3600),
        }
    }
}

/// Liveness contract handed to workers
#[derive(Debug, Clone)]
pub struct LivenessPolicy {
    pub heartbeat_interval: Duration,
    pub liveness_timeout: Duration,
}

impl Default for LivenessPolicy {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            liveness_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&MasterConfig> for LivenessPolicy {
    fn from(config: &MasterConfig) -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(config.liveness.heartbeat_interval_ms),
            liveness_timeout: Duration::from_millis(config.liveness.liveness_timeout_ms),
        }
    }
}

/// Result of applying one outcome to its assignment and case
struct Transition {
    requeued: bool,
    case_state: Option<CaseState>,
}

/// Test-run coordinator backed by the result store
#[derive(Clone)]
pub struct Coordinator {
    db: Database,
    liveness: LivenessPolicy,
}

impl Coordinator {
    pub fn new(db: Database, liveness: LivenessPolicy) -> Self {
        Self { db, liveness }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Validate a plan and queue the first attempt of every case
    pub fn start_run(&self, plan: &TestPlan, options: &RunOptions) -> Result<String> {
        plan.validate()?;

        let now = now_ms();
        let timeout_ms = i64::try_from(options.timeout.as_millis()).unwrap_or(i64::MAX);
        let run = Run {
            id: new_id(),
            plan_name: plan.name.clone(),
            state: RunState::Pending,
            retry_limit: options.retry_limit,
            started_at: now,
            deadline_at: now.saturating_add(timeout_ms),
            finished_at: None,
            verdict: None,
        };

        self.db.transaction(|tx| {
            db::insert_run(tx, &run, plan)?;
            for (position, case) in plan.cases.iter().enumerate() {
                db::insert_case(tx, &run.id, position, case)?;
                db::insert_assignment(tx, &queued(&run.id, &case.id, 1, now))?;
            }
            Ok(())
        })?;

        info!(
            run_id = %run.id,
            plan = %plan.name,
            cases = plan.cases.len(),
            retry_limit = options.retry_limit,
            "Run started"
        );
        Ok(run.id)
    }

    /// Give a machine a fresh identity
    pub fn register_worker(&self, name: &str, capacity: u32) -> Result<WorkerRegistration> {
        if capacity == 0 {
            return Err(Error::InvalidRequest("capacity must be at least 1".to_string()));
        }
        if name.trim().is_empty() {
            return Err(Error::InvalidRequest("worker name must not be empty".to_string()));
        }

        let now = now_ms();
        let worker = WorkerInfo {
            id: new_id(),
            name: name.to_string(),
            capacity,
            registered_at: now,
            last_seen_at: now,
            alive: true,
        };
        self.db.transaction(|tx| db::insert_worker(tx, &worker))?;

        info!(worker_id = %worker.id, name, capacity, "Worker registered");
        Ok(WorkerRegistration {
            worker_id: worker.id,
            heartbeat_interval_ms: self.liveness.heartbeat_interval.as_millis() as u64,
            liveness_timeout_ms: self.liveness.liveness_timeout.as_millis() as u64,
        })
    }

    /// Renew liveness and tell the worker which of its executions to drop
    pub fn heartbeat(&self, worker_id: &str, in_flight: &[String]) -> Result<HeartbeatResponse> {
        let now = now_ms();
        self.db.transaction(|tx| {
            require_alive(tx, worker_id)?;
            db::touch_worker(tx, worker_id, now)?;

            let mut cancelled = Vec::new();
            for assignment_id in in_flight {
                let still_held = db::get_assignment(tx, assignment_id)?
                    .map(|a| a.state.is_held() && a.worker_id.as_deref() == Some(worker_id))
                    .unwrap_or(false);
                if !still_held {
                    cancelled.push(assignment_id.clone());
                }
            }

            if !cancelled.is_empty() {
                debug!(worker_id, cancelled = cancelled.len(), "Cancelling in-flight assignments");
            }
            Ok(HeartbeatResponse { cancelled })
        })
    }

    /// Claim up to `capacity` queued assignments for a worker, oldest first
    pub fn next_assignment(&self, worker_id: &str, capacity: u32) -> Result<Vec<AssignmentTicket>> {
        let now = now_ms();
        self.db.transaction(|tx| {
            require_alive(tx, worker_id)?;
            db::touch_worker(tx, worker_id, now)?;
            if capacity == 0 {
                return Ok(Vec::new());
            }

            let mut plans: HashMap<String, TestPlan> = HashMap::new();
            let mut tickets = Vec::new();

            for assignment in db::claimable_assignments(tx, now, capacity)? {
                db::dispatch_assignment(tx, &assignment.id, worker_id, now)?;

                let run = db::require_run(tx, &assignment.run_id)?;
                if run.state == RunState::Pending {
                    db::set_run_state(tx, &run.id, RunState::Running)?;
                }

                let case = db::get_case(tx, &assignment.run_id, &assignment.case_id)?;
                db::update_case(
                    tx,
                    &case.run_id,
                    &case.case.id,
                    CaseState::Pending,
                    assignment.attempt,
                    case.last_failure.as_ref(),
                )?;

                if !plans.contains_key(&run.id) {
                    plans.insert(run.id.clone(), db::run_plan(tx, &run.id)?);
                }
                let plan = plans
                    .get(&run.id)
                    .ok_or_else(|| Error::Internal(format!("plan of run {} not loaded", run.id)))?;
                let persona = plan
                    .persona(&case.case.persona)
                    .cloned()
                    .ok_or_else(|| Error::not_found("persona", case.case.persona.clone()))?;

                debug!(
                    worker_id,
                    assignment_id = %assignment.id,
                    case_id = %assignment.case_id,
                    attempt = assignment.attempt,
                    "Dispatched assignment"
                );

                tickets.push(AssignmentTicket {
                    assignment_id: assignment.id,
                    run_id: run.id,
                    attempt: assignment.attempt,
                    case: case.case,
                    persona,
                    base_url: plan.base_url.clone(),
                    login: plan.login.clone(),
                });
            }

            Ok(tickets)
        })
    }

    /// Dispatched -> Executing. Returns false when the worker no longer
    /// holds the assignment.
    pub fn mark_executing(&self, assignment_id: &str, worker_id: &str) -> Result<bool> {
        self.db.transaction(|tx| {
            let assignment = db::get_assignment(tx, assignment_id)?
                .ok_or_else(|| Error::not_found("assignment", assignment_id))?;

            if assignment.state != AssignmentState::Dispatched
                || assignment.worker_id.as_deref() != Some(worker_id)
            {
                debug!(assignment_id, worker_id, state = %assignment.state, "Ignoring start");
                return Ok(false);
            }

            db::set_assignment_state(tx, assignment_id, AssignmentState::Executing, None)?;
            Ok(true)
        })
    }

    /// Record the outcome of an attempt held by `worker_id`
    pub fn report_outcome(&self, assignment_id: &str, worker_id: &str, outcome: &Outcome) -> Result<ReportAck> {
        let now = now_ms();
        self.db.transaction(|tx| {
            let assignment = db::get_assignment(tx, assignment_id)?
                .ok_or_else(|| Error::not_found("assignment", assignment_id))?;

            if assignment.state.is_terminal() || assignment.worker_id.as_deref() != Some(worker_id) {
                debug!(
                    assignment_id,
                    worker_id,
                    state = %assignment.state,
                    "Ignoring report for assignment not held by reporter"
                );
                return Ok(ReportAck::rejected());
            }

            let transition = apply_outcome(tx, &assignment, outcome, now)?;
            info!(
                assignment_id,
                case_id = %assignment.case_id,
                attempt = assignment.attempt,
                verdict = %outcome.verdict,
                requeued = transition.requeued,
                "Outcome recorded"
            );
            Ok(ReportAck {
                accepted: true,
                requeued: transition.requeued,
                case_state: transition.case_state,
            })
        })
    }

    /// Declare silent workers dead and reclaim what they held.
    ///
    /// Returns the ids of the workers that expired.
    pub fn expire_workers(&self, now: i64) -> Result<Vec<String>> {
        let timeout_ms = i64::try_from(self.liveness.liveness_timeout.as_millis()).unwrap_or(i64::MAX);
        let cutoff = now.saturating_sub(timeout_ms);
        self.db.transaction(|tx| {
            let mut expired = Vec::new();
            for worker in db::stale_workers(tx, cutoff)? {
                db::mark_worker_dead(tx, &worker.id)?;

                let held = db::held_assignments(tx, &worker.id)?;
                warn!(
                    worker_id = %worker.id,
                    name = %worker.name,
                    reclaimed = held.len(),
                    "Worker stopped renewing liveness"
                );

                for assignment in held {
                    let outcome = Outcome::failed(
                        Failure::new(
                            FailureKind::WorkerUnavailable,
                            format!("worker {} stopped renewing liveness", worker.name),
                        ),
                        0,
                        Diagnostics::default(),
                    );
                    apply_outcome(tx, &assignment, &outcome, now)?;
                }
                expired.push(worker.id);
            }
            Ok(expired)
        })
    }

    /// Abort every unfinalized run whose deadline has passed.
    ///
    /// Returns the ids of the runs that were aborted.
    pub fn enforce_deadlines(&self, now: i64) -> Result<Vec<String>> {
        self.db.transaction(|tx| {
            let mut aborted = Vec::new();
            for run in db::unfinalized_runs(tx)? {
                if run.deadline_at <= now {
                    abort_run(tx, &run, now)?;
                    aborted.push(run.id);
                }
            }
            Ok(aborted)
        })
    }

    /// Finalize the run if every case is terminal or its deadline passed.
    ///
    /// Returns `None` while the run still has work.
    pub fn try_finalize(&self, run_id: &str, now: i64) -> Result<Option<RunVerdict>> {
        self.db.transaction(|tx| {
            let run = db::require_run(tx, run_id)?;
            if run.state.is_finalized() {
                return Ok(run.verdict);
            }

            let cases = db::list_cases(tx, run_id)?;
            if cases.iter().all(|c| c.state.is_terminal()) {
                let verdict = RunVerdict::aggregate(cases.iter().map(|c| &c.state));
                db::finish_run(tx, run_id, RunState::Completed, verdict, now)?;
                info!(run_id, verdict = %verdict, "Run completed");
                return Ok(Some(verdict));
            }

            if run.deadline_at <= now {
                return abort_run(tx, &run, now).map(Some);
            }

            Ok(None)
        })
    }

    /// Abort a run before its deadline, e.g. on operator shutdown
    pub fn abort(&self, run_id: &str, now: i64) -> Result<RunVerdict> {
        self.db.transaction(|tx| {
            let run = db::require_run(tx, run_id)?;
            match run.verdict {
                Some(verdict) if run.state.is_finalized() => Ok(verdict),
                _ => abort_run(tx, &run, now),
            }
        })
    }

    /// Wait until the run is finalized and return its verdict.
    ///
    /// Polling never outlives the run deadline: once it passes the run is
    /// aborted and `Aborted` is returned.
    pub async fn finalize(&self, run_id: &str, poll: Duration) -> Result<RunVerdict> {
        loop {
            if let Some(verdict) = self.try_finalize(run_id, now_ms())? {
                return Ok(verdict);
            }

            let run = self.run(run_id)?;
            let remaining = Duration::from_millis((run.deadline_at - now_ms()).max(0) as u64);
            tokio::time::sleep(poll.min(remaining).max(Duration::from_millis(1))).await;
        }
    }

    pub fn run(&self, run_id: &str) -> Result<Run> {
        self.db.read(|conn| db::require_run(conn, run_id))
    }

    pub fn list_runs(&self) -> Result<Vec<Run>> {
        self.db.read(db::list_runs)
    }

    pub fn list_workers(&self) -> Result<Vec<WorkerInfo>> {
        self.db.read(db::list_workers)
    }

    /// Number of assignments machines were still holding when the run was
    /// aborted. Their executions stop once the machine next heartbeats.
    pub fn interrupted(&self, run_id: &str) -> Result<usize> {
        self.db
            .read(|conn| db::interrupted_assignments(conn, run_id))
            .map(|assignments| assignments.len())
    }

    /// Every attempt of one case, in attempt order
    pub fn attempts(&self, run_id: &str, case_id: &str) -> Result<Vec<Assignment>> {
        self.db.read(|conn| db::case_assignments(conn, run_id, case_id))
    }

    /// Per-case state, attempts and latest failure evidence of a run
    pub fn run_report(&self, run_id: &str) -> Result<RunReport> {
        self.db.read(|conn| {
            let run = db::require_run(conn, run_id)?;
            let mut cases = Vec::new();
            for record in db::list_cases(conn, run_id)? {
                let latest = db::case_outcomes(conn, run_id, &record.case.id)?.pop();
                let diagnostics = latest.map(|r| r.outcome.diagnostics).unwrap_or_default();
                cases.push(case_report(record, diagnostics));
            }
            Ok(RunReport { run, cases })
        })
    }
}

fn case_report(record: CaseRecord, diagnostics: Diagnostics) -> CaseReport {
    CaseReport {
        case_id: record.case.id,
        state: record.state,
        attempts: record.attempts,
        failure: record.last_failure,
        failed_step: diagnostics.failed_step,
        screenshot: diagnostics.screenshot,
    }
}

fn queued(run_id: &str, case_id: &str, attempt: u32, now: i64) -> Assignment {
    Assignment {
        id: new_id(),
        run_id: run_id.to_string(),
        case_id: case_id.to_string(),
        worker_id: None,
        attempt,
        state: AssignmentState::Queued,
        created_at: now,
        dispatched_at: None,
        finished_at: None,
    }
}

fn require_alive(conn: &Connection, worker_id: &str) -> Result<WorkerInfo> {
    match db::get_worker(conn, worker_id)? {
        Some(worker) if worker.alive => Ok(worker),
        Some(_) => Err(Error::WorkerUnavailable(format!("worker {} was declared dead", worker_id))),
        None => Err(Error::WorkerUnavailable(format!("unknown worker {}", worker_id))),
    }
}

/// Append an outcome for a held assignment and move the assignment and its
/// case forward.
fn apply_outcome(
    conn: &Connection,
    assignment: &Assignment,
    outcome: &Outcome,
    now: i64,
) -> Result<Transition> {
    db::append_outcome(conn, assignment, outcome, now)?;

    let run = db::require_run(conn, &assignment.run_id)?;
    let case = db::get_case(conn, &assignment.run_id, &assignment.case_id)?;

    if outcome.failure.is_none() && outcome.verdict == Verdict::Pass {
        db::set_assignment_state(conn, &assignment.id, AssignmentState::Succeeded, Some(now))?;
        db::update_case(conn, &run.id, &case.case.id, CaseState::Passed, assignment.attempt, None)?;
        return Ok(Transition {
            requeued: false,
            case_state: Some(CaseState::Passed),
        });
    }

    db::set_assignment_state(conn, &assignment.id, AssignmentState::Failed, Some(now))?;

    let max_attempts = run.retry_limit.saturating_add(1);
    if outcome.is_retryable() && assignment.attempt < max_attempts && !run.state.is_finalized() {
        let next = queued(&run.id, &case.case.id, assignment.attempt + 1, now);
        db::insert_assignment(conn, &next)?;
        db::update_case(
            conn,
            &run.id,
            &case.case.id,
            CaseState::Pending,
            assignment.attempt,
            outcome.failure.as_ref(),
        )?;
        return Ok(Transition {
            requeued: true,
            case_state: None,
        });
    }

    db::update_case(
        conn,
        &run.id,
        &case.case.id,
        CaseState::Failed,
        assignment.attempt,
        outcome.failure.as_ref(),
    )?;
    Ok(Transition {
        requeued: false,
        case_state: Some(CaseState::Failed),
    })
}

/// Time out whatever is left of a run and mark it aborted
fn abort_run(conn: &Connection, run: &Run, now: i64) -> Result<RunVerdict> {
    let timeout = Failure::new(
        FailureKind::RunTimeout,
        format!("run {} passed its deadline", run.id),
    );

    for assignment in db::active_assignments(conn, &run.id)? {
        if assignment.state.is_held() {
            let outcome = Outcome::failed(timeout.clone(), 0, Diagnostics::default());
            db::append_outcome(conn, &assignment, &outcome, now)?;
        }
        db::set_assignment_state(conn, &assignment.id, AssignmentState::TimedOut, Some(now))?;
    }

    let mut states = Vec::new();
    for case in db::list_cases(conn, &run.id)? {
        if case.state.is_terminal() {
            states.push(case.state);
            continue;
        }
        db::update_case(conn, &run.id, &case.case.id, CaseState::Aborted, case.attempts, Some(&timeout))?;
        states.push(CaseState::Aborted);
    }

    let verdict = RunVerdict::aggregate(&states);
    db::finish_run(conn, &run.id, RunState::Aborted, verdict, now)?;
    warn!(run_id = %run.id, verdict = %verdict, "Run aborted at deadline");
    Ok(verdict)
}

#[async_trait]
impl CoordinatorApi for Coordinator {
    async fn register(&self, name: &str, capacity: u32) -> Result<WorkerRegistration> {
        self.register_worker(name, capacity)
    }

    async fn heartbeat(&self, worker_id: &str, in_flight: &[String]) -> Result<HeartbeatResponse> {
        Coordinator::heartbeat(self, worker_id, in_flight)
    }

    async fn claim(&self, worker_id: &str, capacity: u32) -> Result<Vec<AssignmentTicket>> {
        self.next_assignment(worker_id, capacity)
    }

    async fn start(&self, assignment_id: &str, worker_id: &str) -> Result<bool> {
        self.mark_executing(assignment_id, worker_id)
    }

    async fn report(&self, assignment_id: &str, worker_id: &str, outcome: Outcome) -> Result<ReportAck> {
        self.report_outcome(assignment_id, worker_id, &outcome)
    }
}
