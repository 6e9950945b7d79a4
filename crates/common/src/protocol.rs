//! Coordinator wire protocol
//!
//! Request and response bodies exchanged between machines and the master,
//! plus the [`CoordinatorApi`] seam the worker agent is written against. The
//! master implements it in-process; the machine crate implements it over HTTP.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{AssignmentTicket, CaseState, Outcome};
use crate::Result;

/// Handshake sent by a machine when it (re-)joins the pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    pub capacity: u32,
}

/// Identity and liveness contract handed back on registration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRegistration {
    pub worker_id: String,
    pub heartbeat_interval_ms: u64,
    pub liveness_timeout_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    /// Assignment ids the machine is currently executing
    #[serde(default)]
    pub in_flight: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    /// In-flight assignments the machine must abandon
    #[serde(default)]
    pub cancelled: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimRequest {
    pub capacity: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClaimResponse {
    pub assignments: Vec<AssignmentTicket>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRequest {
    pub worker_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartResponse {
    /// False when the worker no longer holds the assignment
    pub started: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportRequest {
    pub worker_id: String,
    pub outcome: Outcome,
}

/// Acknowledgement of a reported outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportAck {
    /// False when the report was a duplicate or came from a worker that no
    /// longer holds the assignment; nothing was recorded in that case.
    pub accepted: bool,
    /// A follow-up attempt was queued
    #[serde(default)]
    pub requeued: bool,
    /// Case state after the report, when it became terminal
    #[serde(default)]
    pub case_state: Option<CaseState>,
}

impl ReportAck {
    pub fn rejected() -> Self {
        Self {
            accepted: false,
            requeued: false,
            case_state: None,
        }
    }
}

/// Operations a worker agent performs against the coordinator
#[async_trait]
pub trait CoordinatorApi: Send + Sync {
    /// Join the pool under a fresh identity
    async fn register(&self, name: &str, capacity: u32) -> Result<WorkerRegistration>;

    /// Renew liveness. Fails with `Error::WorkerUnavailable` once the
    /// coordinator has declared this identity dead.
    async fn heartbeat(&self, worker_id: &str, in_flight: &[String]) -> Result<HeartbeatResponse>;

    /// Claim up to `capacity` queued assignments
    async fn claim(&self, worker_id: &str, capacity: u32) -> Result<Vec<AssignmentTicket>>;

    /// Move a claimed assignment to executing. `false` means the worker no
    /// longer holds it and must not run it.
    async fn start(&self, assignment_id: &str, worker_id: &str) -> Result<bool>;

    async fn report(&self, assignment_id: &str, worker_id: &str, outcome: Outcome) -> Result<ReportAck>;
}
