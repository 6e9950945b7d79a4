//! SQLite result store for TiltR runs
//!
//! Every record the coordinator keeps lives here: runs, per-case state,
//! assignments, the append-only outcome log and the worker registry.
//! Mutating callers go through [`Database::transaction`], which takes the
//! SQLite write lock up front (`BEGIN IMMEDIATE`) so read-check-write
//! sequences are atomic across threads and across processes sharing the file.

use crate::plan::{TestCase, TestPlan};
use crate::types::*;
use crate::{Error, Result};
use parking_lot::Mutex;
use rusqlite::{params, OptionalExtension, Row, Transaction, TransactionBehavior};

pub use rusqlite::Connection;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const SCHEMA: &str = r#"
    -- Runs
    CREATE TABLE IF NOT EXISTS runs (
        id TEXT PRIMARY KEY,
        plan_name TEXT NOT NULL,
        plan TEXT NOT NULL,
        state TEXT NOT NULL,
        retry_limit INTEGER NOT NULL,
        started_at INTEGER NOT NULL,
        deadline_at INTEGER NOT NULL,
        finished_at INTEGER,
        verdict TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_runs_state ON runs(state);

    -- Per-case aggregate state
    CREATE TABLE IF NOT EXISTS test_cases (
        run_id TEXT NOT NULL REFERENCES runs(id),
        case_id TEXT NOT NULL,
        position INTEGER NOT NULL,
        definition TEXT NOT NULL,
        state TEXT NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        last_failure TEXT,
        PRIMARY KEY (run_id, case_id)
    );

    -- Attempts
    CREATE TABLE IF NOT EXISTS assignments (
        id TEXT PRIMARY KEY,
        run_id TEXT NOT NULL REFERENCES runs(id),
        case_id TEXT NOT NULL,
        worker_id TEXT,
        attempt INTEGER NOT NULL,
        state TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        dispatched_at INTEGER,
        finished_at INTEGER
    );
    CREATE INDEX IF NOT EXISTS idx_assignments_state ON assignments(state, created_at);
    CREATE INDEX IF NOT EXISTS idx_assignments_worker ON assignments(worker_id);
    CREATE UNIQUE INDEX IF NOT EXISTS idx_assignments_active
        ON assignments(run_id, case_id)
        WHERE state IN ('queued', 'dispatched', 'executing');

    -- Outcome log
    CREATE TABLE IF NOT EXISTS outcomes (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        assignment_id TEXT NOT NULL REFERENCES assignments(id),
        run_id TEXT NOT NULL,
        case_id TEXT NOT NULL,
        attempt INTEGER NOT NULL,
        verdict TEXT NOT NULL,
        failure TEXT,
        diagnostics TEXT NOT NULL DEFAULT '{}',
        duration_ms INTEGER NOT NULL,
        recorded_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_outcomes_case ON outcomes(run_id, case_id, seq);

    CREATE TRIGGER IF NOT EXISTS outcomes_no_update
        BEFORE UPDATE ON outcomes
        BEGIN SELECT RAISE(ABORT, 'outcomes are append-only'); END;
    CREATE TRIGGER IF NOT EXISTS outcomes_no_delete
        BEFORE DELETE ON outcomes
        BEGIN SELECT RAISE(ABORT, 'outcomes are append-only'); END;

    -- Worker registry
    CREATE TABLE IF NOT EXISTS workers (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        capacity INTEGER NOT NULL,
        registered_at INTEGER NOT NULL,
        last_seen_at INTEGER NOT NULL,
        alive INTEGER NOT NULL DEFAULT 1
    );
"#;

/// Database wrapper for the result store
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path.as_ref())?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.busy_timeout(Duration::from_secs(5))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init_schema()?;

        info!("Opened database at {:?}", path.as_ref());
        Ok(db)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(SCHEMA)?;
        debug!("Database schema initialized");
        Ok(())
    }

    /// Run `f` inside one `BEGIN IMMEDIATE` transaction.
    ///
    /// The transaction commits when `f` returns `Ok` and rolls back otherwise.
    pub fn transaction<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Run a read-only query against the connection
    pub fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn)
    }
}

fn parse<T: FromStr<Err = Error>>(text: &str) -> Result<T> {
    text.parse()
}

fn parse_json<T: serde::de::DeserializeOwned>(text: Option<String>) -> Result<Option<T>> {
    match text {
        Some(text) => Ok(Some(serde_json::from_str(&text)?)),
        None => Ok(None),
    }
}

// ============================================================================
// Runs
// ============================================================================

pub fn insert_run(conn: &Connection, run: &Run, plan: &TestPlan) -> Result<()> {
    conn.execute(
        "INSERT INTO runs (id, plan_name, plan, state, retry_limit, started_at, deadline_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            run.id,
            run.plan_name,
            serde_json::to_string(plan)?,
            run.state.as_str(),
            run.retry_limit,
            run.started_at,
            run.deadline_at,
        ],
    )?;
    debug!(run_id = %run.id, "Inserted run");
    Ok(())
}

struct RawRun {
    id: String,
    plan_name: String,
    state: String,
    retry_limit: u32,
    started_at: i64,
    deadline_at: i64,
    finished_at: Option<i64>,
    verdict: Option<String>,
}

const RUN_COLUMNS: &str =
    "id, plan_name, state, retry_limit, started_at, deadline_at, finished_at, verdict";

fn raw_run(row: &Row<'_>) -> rusqlite::Result<RawRun> {
    Ok(RawRun {
        id: row.get(0)?,
        plan_name: row.get(1)?,
        state: row.get(2)?,
        retry_limit: row.get(3)?,
        started_at: row.get(4)?,
        deadline_at: row.get(5)?,
        finished_at: row.get(6)?,
        verdict: row.get(7)?,
    })
}

impl RawRun {
    fn parse(self) -> Result<Run> {
        Ok(Run {
            id: self.id,
            plan_name: self.plan_name,
            state: parse(&self.state)?,
            retry_limit: self.retry_limit,
            started_at: self.started_at,
            deadline_at: self.deadline_at,
            finished_at: self.finished_at,
            verdict: self.verdict.as_deref().map(parse).transpose()?,
        })
    }
}

pub fn get_run(conn: &Connection, run_id: &str) -> Result<Option<Run>> {
    conn.query_row(
        &format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS),
        params![run_id],
        raw_run,
    )
    .optional()?
    .map(RawRun::parse)
    .transpose()
}

pub fn require_run(conn: &Connection, run_id: &str) -> Result<Run> {
    get_run(conn, run_id)?.ok_or_else(|| Error::not_found("run", run_id))
}

/// The plan a run was started from
pub fn run_plan(conn: &Connection, run_id: &str) -> Result<TestPlan> {
    let plan: Option<String> = conn
        .query_row("SELECT plan FROM runs WHERE id = ?1", params![run_id], |row| row.get(0))
        .optional()?;
    let plan = plan.ok_or_else(|| Error::not_found("run", run_id))?;
    Ok(serde_json::from_str(&plan)?)
}

pub fn list_runs(conn: &Connection) -> Result<Vec<Run>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM runs ORDER BY started_at DESC",
        RUN_COLUMNS
    ))?;
    let rows = stmt.query_map([], raw_run)?;
    rows.map(|row| row?.parse()).collect()
}

/// Runs that are neither completed nor aborted
pub fn unfinalized_runs(conn: &Connection) -> Result<Vec<Run>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM runs WHERE state IN ('pending', 'running') ORDER BY started_at",
        RUN_COLUMNS
    ))?;
    let rows = stmt.query_map([], raw_run)?;
    rows.map(|row| row?.parse()).collect()
}

pub fn set_run_state(conn: &Connection, run_id: &str, state: RunState) -> Result<()> {
    conn.execute(
        "UPDATE runs SET state = ?1 WHERE id = ?2",
        params![state.as_str(), run_id],
    )?;
    Ok(())
}

pub fn finish_run(
    conn: &Connection,
    run_id: &str,
    state: RunState,
    verdict: RunVerdict,
    now: i64,
) -> Result<()> {
    conn.execute(
        "UPDATE runs SET state = ?1, verdict = ?2, finished_at = ?3 WHERE id = ?4",
        params![state.as_str(), verdict.as_str(), now, run_id],
    )?;
    debug!(run_id, state = %state, verdict = %verdict, "Run finished");
    Ok(())
}

// ============================================================================
// Test cases
// ============================================================================

/// Stored per-case state of a run
#[derive(Debug, Clone)]
pub struct CaseRecord {
    pub run_id: String,
    pub case: TestCase,
    pub state: CaseState,
    pub attempts: u32,
    pub last_failure: Option<Failure>,
}

pub fn insert_case(conn: &Connection, run_id: &str, position: usize, case: &TestCase) -> Result<()> {
    conn.execute(
        "INSERT INTO test_cases (run_id, case_id, position, definition, state, attempts)
         VALUES (?1, ?2, ?3, ?4, ?5, 0)",
        params![
            run_id,
            case.id,
            position as i64,
            serde_json::to_string(case)?,
            CaseState::Pending.as_str(),
        ],
    )?;
    Ok(())
}

struct RawCase {
    run_id: String,
    definition: String,
    state: String,
    attempts: u32,
    last_failure: Option<String>,
}

const CASE_COLUMNS: &str = "run_id, definition, state, attempts, last_failure";

fn raw_case(row: &Row<'_>) -> rusqlite::Result<RawCase> {
    Ok(RawCase {
        run_id: row.get(0)?,
        definition: row.get(1)?,
        state: row.get(2)?,
        attempts: row.get(3)?,
        last_failure: row.get(4)?,
    })
}

impl RawCase {
    fn parse(self) -> Result<CaseRecord> {
        Ok(CaseRecord {
            run_id: self.run_id,
            case: serde_json::from_str(&self.definition)?,
            state: parse(&self.state)?,
            attempts: self.attempts,
            last_failure: parse_json(self.last_failure)?,
        })
    }
}

pub fn get_case(conn: &Connection, run_id: &str, case_id: &str) -> Result<CaseRecord> {
    conn.query_row(
        &format!(
            "SELECT {} FROM test_cases WHERE run_id = ?1 AND case_id = ?2",
            CASE_COLUMNS
        ),
        params![run_id, case_id],
        raw_case,
    )
    .optional()?
    .ok_or_else(|| Error::not_found("test case", format!("{}/{}", run_id, case_id)))?
    .parse()
}

/// Cases of a run in plan order
pub fn list_cases(conn: &Connection, run_id: &str) -> Result<Vec<CaseRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM test_cases WHERE run_id = ?1 ORDER BY position",
        CASE_COLUMNS
    ))?;
    let rows = stmt.query_map(params![run_id], raw_case)?;
    rows.map(|row| row?.parse()).collect()
}

pub fn update_case(
    conn: &Connection,
    run_id: &str,
    case_id: &str,
    state: CaseState,
    attempts: u32,
    last_failure: Option<&Failure>,
) -> Result<()> {
    let last_failure = last_failure.map(serde_json::to_string).transpose()?;
    conn.execute(
        "UPDATE test_cases SET state = ?1, attempts = ?2, last_failure = ?3
         WHERE run_id = ?4 AND case_id = ?5",
        params![state.as_str(), attempts, last_failure, run_id, case_id],
    )?;
    Ok(())
}

// ============================================================================
// Assignments
// ============================================================================

pub fn insert_assignment(conn: &Connection, assignment: &Assignment) -> Result<()> {
    conn.execute(
        "INSERT INTO assignments (id, run_id, case_id, worker_id, attempt, state, created_at, dispatched_at, finished_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            assignment.id,
            assignment.run_id,
            assignment.case_id,
            assignment.worker_id,
            assignment.attempt,
            assignment.state.as_str(),
            assignment.created_at,
            assignment.dispatched_at,
            assignment.finished_at,
        ],
    )?;
    debug!(
        assignment_id = %assignment.id,
        case_id = %assignment.case_id,
        attempt = assignment.attempt,
        "Queued assignment"
    );
    Ok(())
}

struct RawAssignment {
    id: String,
    run_id: String,
    case_id: String,
    worker_id: Option<String>,
    attempt: u32,
    state: String,
    created_at: i64,
    dispatched_at: Option<i64>,
    finished_at: Option<i64>,
}

const ASSIGNMENT_COLUMNS: &str =
    "id, run_id, case_id, worker_id, attempt, state, created_at, dispatched_at, finished_at";

fn raw_assignment(row: &Row<'_>) -> rusqlite::Result<RawAssignment> {
    Ok(RawAssignment {
        id: row.get(0)?,
        run_id: row.get(1)?,
        case_id: row.get(2)?,
        worker_id: row.get(3)?,
        attempt: row.get(4)?,
        state: row.get(5)?,
        created_at: row.get(6)?,
        dispatched_at: row.get(7)?,
        finished_at: row.get(8)?,
    })
}

impl RawAssignment {
    fn parse(self) -> Result<Assignment> {
        Ok(Assignment {
            id: self.id,
            run_id: self.run_id,
            case_id: self.case_id,
            worker_id: self.worker_id,
            attempt: self.attempt,
            state: parse(&self.state)?,
            created_at: self.created_at,
            dispatched_at: self.dispatched_at,
            finished_at: self.finished_at,
        })
    }
}

fn query_assignments(
    conn: &Connection,
    filter: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<Assignment>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM assignments {}",
        ASSIGNMENT_COLUMNS, filter
    ))?;
    let rows = stmt.query_map(params, raw_assignment)?;
    rows.map(|row| row?.parse()).collect()
}

pub fn get_assignment(conn: &Connection, assignment_id: &str) -> Result<Option<Assignment>> {
    conn.query_row(
        &format!("SELECT {} FROM assignments WHERE id = ?1", ASSIGNMENT_COLUMNS),
        params![assignment_id],
        raw_assignment,
    )
    .optional()?
    .map(RawAssignment::parse)
    .transpose()
}

/// Queued assignments of live runs, oldest first
pub fn claimable_assignments(conn: &Connection, now: i64, limit: u32) -> Result<Vec<Assignment>> {
    let filter = "WHERE state = 'queued' AND run_id IN (
                      SELECT id FROM runs
                      WHERE state IN ('pending', 'running') AND deadline_at > ?1
                  )
                  ORDER BY created_at, rowid
                  LIMIT ?2";
    query_assignments(conn, filter, params![now, limit])
}

/// Dispatched or executing assignments bound to a worker
pub fn held_assignments(conn: &Connection, worker_id: &str) -> Result<Vec<Assignment>> {
    query_assignments(
        conn,
        "WHERE worker_id = ?1 AND state IN ('dispatched', 'executing') ORDER BY created_at",
        params![worker_id],
    )
}

/// Assignments of a run that are not yet terminal
pub fn active_assignments(conn: &Connection, run_id: &str) -> Result<Vec<Assignment>> {
    query_assignments(
        conn,
        "WHERE run_id = ?1 AND state IN ('queued', 'dispatched', 'executing') ORDER BY created_at",
        params![run_id],
    )
}

/// Assignments a machine was holding when their run was aborted
pub fn interrupted_assignments(conn: &Connection, run_id: &str) -> Result<Vec<Assignment>> {
    query_assignments(
        conn,
        "WHERE run_id = ?1 AND state = 'timed_out' AND worker_id IS NOT NULL ORDER BY created_at",
        params![run_id],
    )
}

/// Every attempt of one case, in attempt order
pub fn case_assignments(conn: &Connection, run_id: &str, case_id: &str) -> Result<Vec<Assignment>> {
    query_assignments(
        conn,
        "WHERE run_id = ?1 AND case_id = ?2 ORDER BY attempt",
        params![run_id, case_id],
    )
}

pub fn dispatch_assignment(conn: &Connection, assignment_id: &str, worker_id: &str, now: i64) -> Result<()> {
    let changed = conn.execute(
        "UPDATE assignments SET state = 'dispatched', worker_id = ?1, dispatched_at = ?2
         WHERE id = ?3 AND state = 'queued'",
        params![worker_id, now, assignment_id],
    )?;
    if changed != 1 {
        return Err(Error::InvalidStateTransition {
            from: "non-queued".to_string(),
            to: AssignmentState::Dispatched.to_string(),
        });
    }
    Ok(())
}

pub fn set_assignment_state(
    conn: &Connection,
    assignment_id: &str,
    state: AssignmentState,
    finished_at: Option<i64>,
) -> Result<()> {
    conn.execute(
        "UPDATE assignments SET state = ?1, finished_at = COALESCE(?2, finished_at) WHERE id = ?3",
        params![state.as_str(), finished_at, assignment_id],
    )?;
    Ok(())
}

// ============================================================================
// Outcomes
// ============================================================================

/// Append an outcome for an attempt, returning its sequence number
pub fn append_outcome(conn: &Connection, assignment: &Assignment, outcome: &Outcome, now: i64) -> Result<i64> {
    let failure = outcome.failure.as_ref().map(serde_json::to_string).transpose()?;
    conn.execute(
        "INSERT INTO outcomes (assignment_id, run_id, case_id, attempt, verdict, failure, diagnostics, duration_ms, recorded_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            assignment.id,
            assignment.run_id,
            assignment.case_id,
            assignment.attempt,
            outcome.verdict.as_str(),
            failure,
            serde_json::to_string(&outcome.diagnostics)?,
            outcome.duration_ms as i64,
            now,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

struct RawOutcome {
    seq: i64,
    assignment_id: String,
    run_id: String,
    case_id: String,
    attempt: u32,
    verdict: String,
    failure: Option<String>,
    diagnostics: String,
    duration_ms: i64,
    recorded_at: i64,
}

fn raw_outcome(row: &Row<'_>) -> rusqlite::Result<RawOutcome> {
    Ok(RawOutcome {
        seq: row.get(0)?,
        assignment_id: row.get(1)?,
        run_id: row.get(2)?,
        case_id: row.get(3)?,
        attempt: row.get(4)?,
        verdict: row.get(5)?,
        failure: row.get(6)?,
        diagnostics: row.get(7)?,
        duration_ms: row.get(8)?,
        recorded_at: row.get(9)?,
    })
}

impl RawOutcome {
    fn parse(self) -> Result<OutcomeRecord> {
        Ok(OutcomeRecord {
            seq: self.seq,
            assignment_id: self.assignment_id,
            run_id: self.run_id,
            case_id: self.case_id,
            attempt: self.attempt,
            outcome: Outcome {
                verdict: parse(&self.verdict)?,
                failure: parse_json(self.failure)?,
                diagnostics: serde_json::from_str(&self.diagnostics)?,
                duration_ms: self.duration_ms.max(0) as u64,
            },
            recorded_at: self.recorded_at,
        })
    }
}

/// Outcome history of one case, oldest first
pub fn case_outcomes(conn: &Connection, run_id: &str, case_id: &str) -> Result<Vec<OutcomeRecord>> {
    let mut stmt = conn.prepare(
        "SELECT seq, assignment_id, run_id, case_id, attempt, verdict, failure, diagnostics, duration_ms, recorded_at
         FROM outcomes WHERE run_id = ?1 AND case_id = ?2 ORDER BY seq",
    )?;
    let rows = stmt.query_map(params![run_id, case_id], raw_outcome)?;
    rows.map(|row| row?.parse()).collect()
}

// ============================================================================
// Workers
// ============================================================================

pub fn insert_worker(conn: &Connection, worker: &WorkerInfo) -> Result<()> {
    conn.execute(
        "INSERT INTO workers (id, name, capacity, registered_at, last_seen_at, alive)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            worker.id,
            worker.name,
            worker.capacity,
            worker.registered_at,
            worker.last_seen_at,
            worker.alive,
        ],
    )?;
    Ok(())
}

fn worker_row(row: &Row<'_>) -> rusqlite::Result<WorkerInfo> {
    Ok(WorkerInfo {
        id: row.get(0)?,
        name: row.get(1)?,
        capacity: row.get(2)?,
        registered_at: row.get(3)?,
        last_seen_at: row.get(4)?,
        alive: row.get(5)?,
    })
}

const WORKER_COLUMNS: &str = "id, name, capacity, registered_at, last_seen_at, alive";

pub fn get_worker(conn: &Connection, worker_id: &str) -> Result<Option<WorkerInfo>> {
    Ok(conn
        .query_row(
            &format!("SELECT {} FROM workers WHERE id = ?1", WORKER_COLUMNS),
            params![worker_id],
            worker_row,
        )
        .optional()?)
}

pub fn list_workers(conn: &Connection) -> Result<Vec<WorkerInfo>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM workers ORDER BY registered_at",
        WORKER_COLUMNS
    ))?;
    let rows = stmt.query_map([], worker_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn touch_worker(conn: &Connection, worker_id: &str, now: i64) -> Result<()> {
    conn.execute(
        "UPDATE workers SET last_seen_at = ?1 WHERE id = ?2",
        params![now, worker_id],
    )?;
    Ok(())
}

/// Alive workers not seen since `cutoff`
pub fn stale_workers(conn: &Connection, cutoff: i64) -> Result<Vec<WorkerInfo>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM workers WHERE alive = 1 AND last_seen_at < ?1",
        WORKER_COLUMNS
    ))?;
    let rows = stmt.query_map(params![cutoff], worker_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn mark_worker_dead(conn: &Connection, worker_id: &str) -> Result<()> {
    conn.execute("UPDATE workers SET alive = 0 WHERE id = ?1", params![worker_id])?;
    Ok(())
}
