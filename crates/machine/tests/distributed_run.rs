//! End-to-end runs: in-process master coordinator, real agents, fake browsers.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tiltr_common::{
    now_ms, CaseState, CoordinatorApi, Database, FailureKind, Persona, RunState, RunVerdict,
    TestPlan,
};
use tiltr_machine::session::{Action, ElementRef};
use tiltr_machine::{
    Agent, AgentConfig, Executor, ExecutorConfig, HttpCoordinator, MachineResult, Session,
    SessionError, SessionFactory, SessionResult,
};
use tiltr_master::reaper::Reaper;
use tiltr_master::{Coordinator, LivenessPolicy, MasterConfig, RunOptions};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Browser behaviour shared by every session the factory opens.
///
/// `#ok` is always there, `#flaky` times out while `flaky_left` > 0,
/// `#hang` never answers and `#result` renders "Wrong".
#[derive(Default)]
struct Browser {
    flaky_left: AtomicUsize,
    opened: AtomicUsize,
    closed: AtomicUsize,
}

struct FakeSession {
    browser: Arc<Browser>,
}

#[async_trait]
impl Session for FakeSession {
    fn id(&self) -> &str {
        "fake"
    }

    async fn navigate(&mut self, _url: &str) -> SessionResult<()> {
        Ok(())
    }

    async fn locate(&mut self, selector: &str) -> SessionResult<ElementRef> {
        match selector {
            "#ok" | "#result" => Ok(ElementRef(selector.to_string())),
            "#flaky" => {
                let left = self.browser.flaky_left.load(Ordering::SeqCst);
                if left > 0 {
                    self.browser.flaky_left.store(left - 1, Ordering::SeqCst);
                    Err(SessionError::timeout("grid node stalled"))
                } else {
                    Ok(ElementRef(selector.to_string()))
                }
            }
            "#hang" => std::future::pending().await,
            other => Err(SessionError::element_not_found(other)),
        }
    }

    async fn act(&mut self, _element: &ElementRef, _action: Action) -> SessionResult<()> {
        Ok(())
    }

    async fn inspect_text(&mut self, _element: &ElementRef) -> SessionResult<String> {
        Ok("Wrong".to_string())
    }

    async fn inspect_visible(&mut self, _element: &ElementRef) -> SessionResult<bool> {
        Ok(true)
    }

    async fn current_url(&mut self) -> SessionResult<String> {
        Ok("http://web/".to_string())
    }

    async fn title(&mut self) -> SessionResult<String> {
        Ok("Fake".to_string())
    }

    async fn screenshot(&mut self) -> SessionResult<Vec<u8>> {
        Ok(vec![0x89, b'P', b'N', b'G'])
    }

    async fn close(self: Box<Self>) -> SessionResult<()> {
        self.browser.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FakeFactory(Arc<Browser>);

#[async_trait]
impl SessionFactory for FakeFactory {
    async fn open(&self, _persona: &Persona) -> SessionResult<Box<dyn Session>> {
        self.0.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSession {
            browser: self.0.clone(),
        }))
    }
}

struct Cluster {
    coordinator: Arc<Coordinator>,
    browser: Arc<Browser>,
    shutdown: CancellationToken,
    artifacts: tempfile::TempDir,
}

impl Cluster {
    fn new(liveness_timeout: Duration) -> Self {
        let coordinator = Arc::new(Coordinator::new(
            Database::open_memory().unwrap(),
            LivenessPolicy {
                heartbeat_interval: Duration::from_millis(30),
                liveness_timeout,
            },
        ));
        Self {
            coordinator,
            browser: Arc::new(Browser::default()),
            shutdown: CancellationToken::new(),
            artifacts: tempfile::tempdir().unwrap(),
        }
    }

    fn spawn_agent(&self, name: &str, capacity: u32) -> JoinHandle<MachineResult<()>> {
        spawn_agent(
            self.coordinator.clone(),
            self.browser.clone(),
            self.artifacts.path(),
            name,
            capacity,
            self.shutdown.clone(),
        )
    }

    fn spawn_reaper(&self) -> JoinHandle<()> {
        let reaper = Reaper::new(self.coordinator.clone(), Duration::from_millis(20));
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move { reaper.run(shutdown).await })
    }

    async fn finalize(&self, run_id: &str) -> RunVerdict {
        tokio::time::timeout(
            Duration::from_secs(20),
            self.coordinator.finalize(run_id, Duration::from_millis(10)),
        )
        .await
        .expect("run did not finish")
        .unwrap()
    }
}

fn spawn_agent(
    api: Arc<dyn CoordinatorApi>,
    browser: Arc<Browser>,
    artifacts: &Path,
    name: &str,
    capacity: u32,
    shutdown: CancellationToken,
) -> JoinHandle<MachineResult<()>> {
    let executor = Executor::new(
        Arc::new(FakeFactory(browser)),
        ExecutorConfig {
            open_timeout: Duration::from_secs(5),
            step_timeout: Duration::from_secs(30),
            artifacts_dir: artifacts.to_path_buf(),
        },
    );
    let agent = Agent::new(
        api,
        Arc::new(executor),
        AgentConfig {
            name: name.to_string(),
            capacity,
            poll_interval: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            register_delay: Duration::from_millis(10),
            ..AgentConfig::default()
        },
    );
    tokio::spawn(async move { agent.run(shutdown).await })
}

fn plan(cases: &str) -> TestPlan {
    TestPlan::from_yaml(&format!(
        r#"
name: distributed
base_url: http://web
personas:
  alice: {{ username: alice, password: pw }}
  bob: {{ username: bob, password: pw }}
cases:
{}
"#,
        cases
    ))
    .unwrap()
}

fn options(retry_limit: u32, timeout: Duration) -> RunOptions {
    RunOptions { retry_limit, timeout }
}

#[tokio::test]
async fn test_mixed_run_retries_only_infrastructure_failures() {
    let cluster = Cluster::new(Duration::from_secs(5));
    cluster.browser.flaky_left.store(1, Ordering::SeqCst);

    let plan = plan(
        r##"
  - id: A
    persona: alice
    steps: [{ action: click, selector: "#ok" }]
  - id: B
    persona: bob
    steps: [{ action: click, selector: "#flaky" }]
  - id: C
    persona: alice
    steps: [{ action: navigate, url: /exam }]
    expect:
      - { selector: "#result", text: "Right" }
"##,
    );
    let run_id = cluster
        .coordinator
        .start_run(&plan, &options(2, Duration::from_secs(30)))
        .unwrap();

    let m1 = cluster.spawn_agent("m1", 2);
    let m2 = cluster.spawn_agent("m2", 1);

    let verdict = cluster.finalize(&run_id).await;
    assert_eq!(verdict, RunVerdict::Fail);

    let report = cluster.coordinator.run_report(&run_id).unwrap();
    let case = |id: &str| report.cases.iter().find(|c| c.case_id == id).unwrap().clone();

    assert_eq!(case("A").state, CaseState::Passed);
    assert_eq!(case("A").attempts, 1);

    assert_eq!(case("B").state, CaseState::Passed);
    assert_eq!(case("B").attempts, 2);

    let c = case("C");
    assert_eq!(c.state, CaseState::Failed);
    assert_eq!(c.attempts, 1);
    assert_eq!(c.failure.unwrap().kind, FailureKind::AssertionMismatch);
    assert_eq!(c.failed_step, Some(1));
    assert!(c.screenshot.is_some());

    cluster.shutdown.cancel();
    m1.await.unwrap().unwrap();
    m2.await.unwrap().unwrap();

    let opened = cluster.browser.opened.load(Ordering::SeqCst);
    assert_eq!(opened, 4);
    assert_eq!(cluster.browser.closed.load(Ordering::SeqCst), opened);
}

#[tokio::test]
async fn test_run_timeout_aborts_and_cancels_in_flight_work() {
    let cluster = Cluster::new(Duration::from_secs(5));
    let plan = plan(
        r##"
  - id: quick
    persona: alice
    steps: [{ action: click, selector: "#ok" }]
  - id: D
    persona: bob
    steps: [{ action: click, selector: "#hang" }]
"##,
    );
    let run_id = cluster
        .coordinator
        .start_run(&plan, &options(2, Duration::from_millis(400)))
        .unwrap();
    let machine = cluster.spawn_agent("m1", 2);

    let verdict = cluster.finalize(&run_id).await;
    assert_eq!(verdict, RunVerdict::Aborted);

    let run = cluster.coordinator.run(&run_id).unwrap();
    assert_eq!(run.state, RunState::Aborted);

    let report = cluster.coordinator.run_report(&run_id).unwrap();
    let d = report.cases.iter().find(|c| c.case_id == "D").unwrap();
    assert_eq!(d.state, CaseState::Aborted);
    assert_eq!(d.failure.as_ref().unwrap().kind, FailureKind::RunTimeout);
    let quick = report.cases.iter().find(|c| c.case_id == "quick").unwrap();
    assert_eq!(quick.state, CaseState::Passed);

    // The next heartbeat cancels the hanging execution and releases its session
    let deadline = now_ms() + 5_000;
    while cluster.browser.closed.load(Ordering::SeqCst) < 2 && now_ms() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(cluster.browser.closed.load(Ordering::SeqCst), 2);

    cluster.shutdown.cancel();
    machine.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_crashed_worker_assignment_is_recovered() {
    let cluster = Cluster::new(Duration::from_millis(200));
    let plan = plan(
        r##"
  - id: A
    persona: alice
    steps: [{ action: click, selector: "#ok" }]
"##,
    );
    let run_id = cluster
        .coordinator
        .start_run(&plan, &options(2, Duration::from_secs(30)))
        .unwrap();

    // A machine claims the case and then goes silent
    let crashed = cluster.coordinator.register_worker("crashed", 1).unwrap().worker_id;
    let claimed = cluster.coordinator.next_assignment(&crashed, 1).unwrap();
    assert_eq!(claimed.len(), 1);

    let reaper = cluster.spawn_reaper();
    let machine = cluster.spawn_agent("m1", 1);

    let verdict = cluster.finalize(&run_id).await;
    assert_eq!(verdict, RunVerdict::Pass);

    let attempts = cluster.coordinator.attempts(&run_id, "A").unwrap();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0].worker_id.as_deref(), Some(crashed.as_str()));
    assert_ne!(attempts[1].worker_id.as_deref(), Some(crashed.as_str()));

    let workers = cluster.coordinator.list_workers().unwrap();
    assert!(workers.iter().any(|w| w.id == crashed && !w.alive));

    cluster.shutdown.cancel();
    machine.await.unwrap().unwrap();
    reaper.await.unwrap();
}

#[tokio::test]
async fn test_agent_rejoins_after_being_declared_dead() {
    let cluster = Cluster::new(Duration::from_secs(5));
    let machine = cluster.spawn_agent("m1", 1);

    let deadline = now_ms() + 5_000;
    while cluster.coordinator.list_workers().unwrap().is_empty() && now_ms() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Pretend the machine went silent for far longer than the liveness timeout
    let expired = cluster.coordinator.expire_workers(now_ms() + 60_000).unwrap();
    assert_eq!(expired.len(), 1);

    let deadline = now_ms() + 5_000;
    while cluster.coordinator.list_workers().unwrap().len() < 2 && now_ms() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let workers = cluster.coordinator.list_workers().unwrap();
    assert_eq!(workers.len(), 2);
    assert_eq!(workers.iter().filter(|w| w.alive).count(), 1);

    // The new identity picks up work
    let plan = plan(
        r##"
  - id: A
    persona: alice
    steps: [{ action: click, selector: "#ok" }]
"##,
    );
    let run_id = cluster
        .coordinator
        .start_run(&plan, &options(0, Duration::from_secs(30)))
        .unwrap();
    assert_eq!(cluster.finalize(&run_id).await, RunVerdict::Pass);

    cluster.shutdown.cancel();
    machine.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_aborted_master_outlives_a_heartbeat_so_sessions_close() {
    let store = tempfile::tempdir().unwrap();
    let artifacts = tempfile::tempdir().unwrap();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());

    // Heartbeats are rarer than the run is long, so the cancellation can only
    // reach the machine after the run has already been aborted
    let mut config = MasterConfig::default();
    config.store_path = store.path().to_path_buf();
    config.scheduling.run_timeout_secs = 1;
    config.scheduling.finalize_poll_ms = 50;
    config.liveness.heartbeat_interval_ms = 4_000;

    let plan = plan(
        r##"
  - id: D
    persona: bob
    steps: [{ action: click, selector: "#hang" }]
"##,
    );
    let master = tokio::spawn(async move {
        tiltr_master::serve_plan(&config, &plan, listener, CancellationToken::new()).await
    });

    let browser = Arc::new(Browser::default());
    let machine_shutdown = CancellationToken::new();
    let machine = spawn_agent(
        Arc::new(HttpCoordinator::new(&url).unwrap()),
        browser.clone(),
        artifacts.path(),
        "m1",
        1,
        machine_shutdown.clone(),
    );

    let summary = tokio::time::timeout(Duration::from_secs(20), master)
        .await
        .expect("master did not exit")
        .unwrap()
        .unwrap();
    assert_eq!(summary.verdict, RunVerdict::Aborted);

    // Only the spawned close may still be in flight
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(browser.opened.load(Ordering::SeqCst), 1);
    assert_eq!(browser.closed.load(Ordering::SeqCst), 1);

    machine_shutdown.cancel();
    machine.await.unwrap().unwrap();
}
