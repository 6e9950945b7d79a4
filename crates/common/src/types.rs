//! Core types for TiltR

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::plan::TestCase;
use crate::Error;

/// Milliseconds since the Unix epoch, the timestamp unit of every stored record.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Generate a fresh record identifier
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(Error::Internal(format!(
                        "unknown {} '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

/// Run lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Running,
    Completed,
    Aborted,
}

text_enum!(RunState {
    Pending => "pending",
    Running => "running",
    Completed => "completed",
    Aborted => "aborted",
});

impl RunState {
    pub fn is_finalized(&self) -> bool {
        matches!(self, RunState::Completed | RunState::Aborted)
    }
}

/// State of one attempt of one test case
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentState {
    Queued,
    Dispatched,
    Executing,
    Succeeded,
    Failed,
    TimedOut,
}

text_enum!(AssignmentState {
    Queued => "queued",
    Dispatched => "dispatched",
    Executing => "executing",
    Succeeded => "succeeded",
    Failed => "failed",
    TimedOut => "timed_out",
});

impl AssignmentState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AssignmentState::Succeeded | AssignmentState::Failed | AssignmentState::TimedOut
        )
    }

    /// Held by a worker: claimed but not yet reported.
    pub fn is_held(&self) -> bool {
        matches!(self, AssignmentState::Dispatched | AssignmentState::Executing)
    }
}

/// Aggregate state of a test case within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseState {
    Pending,
    Passed,
    Failed,
    Aborted,
}

text_enum!(CaseState {
    Pending => "pending",
    Passed => "passed",
    Failed => "failed",
    Aborted => "aborted",
});

impl CaseState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CaseState::Pending)
    }
}

/// Verdict of a single attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail,
    Error,
}

text_enum!(Verdict {
    Pass => "pass",
    Fail => "fail",
    Error => "error",
});

/// Aggregate verdict of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunVerdict {
    Pass,
    Fail,
    Aborted,
}

text_enum!(RunVerdict {
    Pass => "pass",
    Fail => "fail",
    Aborted => "aborted",
});

impl RunVerdict {
    /// Aggregate per-case terminal states. Any abort dominates any failure.
    pub fn aggregate<'a>(states: impl IntoIterator<Item = &'a CaseState>) -> Self {
        let mut verdict = RunVerdict::Pass;
        for state in states {
            match state {
                CaseState::Passed => {}
                CaseState::Aborted | CaseState::Pending => return RunVerdict::Aborted,
                CaseState::Failed => verdict = RunVerdict::Fail,
            }
        }
        verdict
    }

    /// Process exit status: test failures and infrastructure aborts are kept apart.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunVerdict::Pass => 0,
            RunVerdict::Fail => 1,
            RunVerdict::Aborted => 2,
        }
    }
}

/// Classified reason an attempt did not pass.
///
/// Variants are declared in ascending severity; `most_severe` relies on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Grid or coordinator connection failed
    Transport,
    /// A command or step exceeded its timeout
    Timeout,
    /// The WebDriver endpoint answered with an unexpected error
    Protocol,
    /// A page load failed
    Navigation,
    /// A selector matched nothing
    ElementNotFound,
    /// The worker holding the attempt stopped renewing liveness
    WorkerUnavailable,
    /// The run deadline passed before the attempt finished
    RunTimeout,
    /// Rendered state disagreed with the expected outcome
    AssertionMismatch,
}

text_enum!(FailureKind {
    Transport => "transport",
    Timeout => "timeout",
    Protocol => "protocol",
    Navigation => "navigation",
    ElementNotFound => "element_not_found",
    WorkerUnavailable => "worker_unavailable",
    RunTimeout => "run_timeout",
    AssertionMismatch => "assertion_mismatch",
});

impl FailureKind {
    /// Environmental failures are worth another attempt; semantic ones are not.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FailureKind::AssertionMismatch | FailureKind::RunTimeout)
    }

    /// The attempt verdict this failure produces.
    pub fn verdict(&self) -> Verdict {
        match self {
            FailureKind::AssertionMismatch => Verdict::Fail,
            _ => Verdict::Error,
        }
    }

    pub fn most_severe(kinds: impl IntoIterator<Item = FailureKind>) -> Option<FailureKind> {
        kinds.into_iter().max()
    }
}

/// A classified failure with its message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Wall time of one executed step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepTiming {
    pub step: String,
    pub duration_ms: u64,
}

/// Evidence captured for an attempt
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    /// Index of the step that failed; `steps.len()` means the expectations failed
    #[serde(default)]
    pub failed_step: Option<usize>,
    #[serde(default)]
    pub last_url: Option<String>,
    #[serde(default)]
    pub page_title: Option<String>,
    /// Path of the captured screenshot, named by content digest
    #[serde(default)]
    pub screenshot: Option<String>,
    #[serde(default)]
    pub protocol: Vec<String>,
    #[serde(default)]
    pub timings: Vec<StepTiming>,
}

/// Result of one attempt, as reported by the worker that ran it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub verdict: Verdict,
    #[serde(default)]
    pub failure: Option<Failure>,
    #[serde(default)]
    pub diagnostics: Diagnostics,
    pub duration_ms: u64,
}

impl Outcome {
    pub fn pass(duration_ms: u64, diagnostics: Diagnostics) -> Self {
        Self {
            verdict: Verdict::Pass,
            failure: None,
            diagnostics,
            duration_ms,
        }
    }

    pub fn failed(failure: Failure, duration_ms: u64, diagnostics: Diagnostics) -> Self {
        Self {
            verdict: failure.kind.verdict(),
            failure: Some(failure),
            diagnostics,
            duration_ms,
        }
    }

    /// Whether the coordinator may schedule another attempt after this outcome.
    pub fn is_retryable(&self) -> bool {
        match (&self.verdict, &self.failure) {
            (Verdict::Pass, _) => false,
            (Verdict::Fail, _) => false,
            (Verdict::Error, Some(failure)) => failure.kind.is_retryable(),
            (Verdict::Error, None) => true,
        }
    }
}

/// Stored outcome row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub seq: i64,
    pub assignment_id: String,
    pub run_id: String,
    pub case_id: String,
    pub attempt: u32,
    pub outcome: Outcome,
    pub recorded_at: i64,
}

/// One attempt binding a case to a worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub id: String,
    pub run_id: String,
    pub case_id: String,
    pub worker_id: Option<String>,
    pub attempt: u32,
    pub state: AssignmentState,
    pub created_at: i64,
    pub dispatched_at: Option<i64>,
    pub finished_at: Option<i64>,
}

/// A claimed assignment, as handed to a worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentTicket {
    pub assignment_id: String,
    pub run_id: String,
    pub attempt: u32,
    pub case: TestCase,
    pub persona: crate::plan::Persona,
    pub base_url: String,
    #[serde(default)]
    pub login: Option<crate::plan::LoginForm>,
}

/// A registered worker agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub id: String,
    pub name: String,
    pub capacity: u32,
    pub registered_at: i64,
    pub last_seen_at: i64,
    pub alive: bool,
}

/// Run metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub plan_name: String,
    pub state: RunState,
    pub retry_limit: u32,
    pub started_at: i64,
    pub deadline_at: i64,
    pub finished_at: Option<i64>,
    pub verdict: Option<RunVerdict>,
}

/// Per-case line of the final report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseReport {
    pub case_id: String,
    pub state: CaseState,
    pub attempts: u32,
    #[serde(default)]
    pub failure: Option<Failure>,
    #[serde(default)]
    pub failed_step: Option<usize>,
    #[serde(default)]
    pub screenshot: Option<String>,
}

/// Final (or in-progress) report of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run: Run,
    pub cases: Vec<CaseReport>,
}

impl RunReport {
    pub fn count(&self, state: CaseState) -> usize {
        self.cases.iter().filter(|c| c.state == state).count()
    }
}
