//! HTTP client for the master's coordinator API

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tiltr_common::protocol::{
    ClaimRequest, ClaimResponse, CoordinatorApi, HeartbeatRequest, HeartbeatResponse,
    RegisterRequest, ReportAck, ReportRequest, StartRequest, StartResponse, WorkerRegistration,
};
use tiltr_common::{AssignmentTicket, Error, Outcome, Result};

/// Coordinator reached over the network
pub struct HttpCoordinator {
    client: Client,
    base_url: String,
}

impl HttpCoordinator {
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_timeout(base_url, Duration::from_secs(10))
    }

    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Internal(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| Error::Transport(format!("malformed response from {}: {}", url, e)));
        }

        let message = response
            .json::<serde_json::Value>()
            .await
            .ok()
            .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
            .unwrap_or_else(|| status.to_string());

        Err(match status {
            StatusCode::GONE => Error::WorkerUnavailable(message),
            StatusCode::NOT_FOUND => Error::NotFound {
                kind: "resource".to_string(),
                id: message,
            },
            StatusCode::BAD_REQUEST => Error::InvalidRequest(message),
            _ => Error::Transport(format!("{} returned {}: {}", url, status, message)),
        })
    }
}

#[async_trait]
impl CoordinatorApi for HttpCoordinator {
    async fn register(&self, name: &str, capacity: u32) -> Result<WorkerRegistration> {
        self.post(
            "/api/workers",
            &RegisterRequest {
                name: name.to_string(),
                capacity,
            },
        )
        .await
    }

    async fn heartbeat(&self, worker_id: &str, in_flight: &[String]) -> Result<HeartbeatResponse> {
        self.post(
            &format!("/api/workers/{}/heartbeat", worker_id),
            &HeartbeatRequest {
                in_flight: in_flight.to_vec(),
            },
        )
        .await
    }

    async fn claim(&self, worker_id: &str, capacity: u32) -> Result<Vec<AssignmentTicket>> {
        let response: ClaimResponse = self
            .post(&format!("/api/workers/{}/claim", worker_id), &ClaimRequest { capacity })
            .await?;
        Ok(response.assignments)
    }

    async fn start(&self, assignment_id: &str, worker_id: &str) -> Result<bool> {
        let response: StartResponse = self
            .post(
                &format!("/api/assignments/{}/start", assignment_id),
                &StartRequest {
                    worker_id: worker_id.to_string(),
                },
            )
            .await?;
        Ok(response.started)
    }

    async fn report(&self, assignment_id: &str, worker_id: &str, outcome: Outcome) -> Result<ReportAck> {
        self.post(
            &format!("/api/assignments/{}/outcome", assignment_id),
            &ReportRequest {
                worker_id: worker_id.to_string(),
                outcome,
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tiltr_common::{Database, Diagnostics, TestPlan};
    use tiltr_master::{Coordinator, LivenessPolicy, RunOptions};
    use tokio_util::sync::CancellationToken;

    async fn spawn_master() -> (Arc<Coordinator>, String, CancellationToken) {
        let coordinator = Arc::new(Coordinator::new(
            Database::open_memory().unwrap(),
            LivenessPolicy::default(),
        ));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let shutdown = CancellationToken::new();
        tokio::spawn(tiltr_master::server::serve(listener, coordinator.clone(), shutdown.clone()));
        (coordinator, url, shutdown)
    }

    #[tokio::test]
    async fn test_full_cycle_over_http() {
        let (coordinator, url, shutdown) = spawn_master().await;
        let plan = TestPlan::from_yaml(
            r#"
name: client
base_url: http://web
personas:
  alice: { username: alice, password: pw }
cases:
  - id: only
    persona: alice
    steps: [{ action: navigate, url: / }]
"#,
        )
        .unwrap();
        coordinator.start_run(&plan, &RunOptions::default()).unwrap();

        let api = HttpCoordinator::new(&url).unwrap();
        let registration = api.register("m1", 2).await.unwrap();
        let worker = registration.worker_id;

        let tickets = api.claim(&worker, 2).await.unwrap();
        assert_eq!(tickets.len(), 1);
        let ticket = &tickets[0];
        assert_eq!(ticket.persona.username, "alice");

        assert!(api.start(&ticket.assignment_id, &worker).await.unwrap());
        assert!(!api.start(&ticket.assignment_id, &worker).await.unwrap());
        let beat = api.heartbeat(&worker, &[ticket.assignment_id.clone()]).await.unwrap();
        assert!(beat.cancelled.is_empty());

        let ack = api
            .report(&ticket.assignment_id, &worker, Outcome::pass(5, Diagnostics::default()))
            .await
            .unwrap();
        assert!(ack.accepted);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_status_codes_map_to_errors() {
        let (_, url, shutdown) = spawn_master().await;
        let api = HttpCoordinator::new(&url).unwrap();

        let err = api.heartbeat("ghost", &[]).await.unwrap_err();
        assert!(matches!(err, Error::WorkerUnavailable(_)));

        let err = api.register("m1", 0).await.unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_unreachable_master_is_transport_error() {
        let api = HttpCoordinator::with_timeout("http://127.0.0.1:9", Duration::from_millis(500)).unwrap();
        let err = api.register("m1", 1).await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }
}
