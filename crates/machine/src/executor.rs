//! Test case executor
//!
//! Runs one claimed attempt: opens a session for the case persona, plays the
//! step script, evaluates the expected outcome and classifies whatever went
//! wrong. The session is released on every exit path.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tiltr_common::{
    AssignmentTicket, Check, Diagnostics, Failure, FailureKind, Outcome, Persona, Step, StepTiming,
};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{SessionError, SessionResult};
use crate::session::{Action, Session, SessionFactory, SessionGuard};

/// Executor timeouts and artifact location
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub open_timeout: Duration,
    pub step_timeout: Duration,
    /// Screenshots land here, named by content digest
    pub artifacts_dir: PathBuf,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            open_timeout: Duration::from_secs(60),
            step_timeout: Duration::from_secs(30),
            artifacts_dir: tiltr_common::default_artifacts_path(),
        }
    }
}

/// Index and cause of the first thing that went wrong
struct StepFailure {
    step: usize,
    failure: Failure,
}

/// Protocol lines and timings collected while an attempt runs
#[derive(Default)]
struct Trace {
    protocol: Vec<String>,
    timings: Vec<StepTiming>,
}

impl Trace {
    fn line(&mut self, line: impl Into<String>) {
        self.protocol.push(line.into());
    }
}

pub struct Executor {
    factory: Arc<dyn SessionFactory>,
    config: ExecutorConfig,
}

impl Executor {
    pub fn new(factory: Arc<dyn SessionFactory>, config: ExecutorConfig) -> Self {
        Self { factory, config }
    }

    /// Execute one attempt. Cancellation yields a `RunTimeout` outcome the
    /// caller is expected to discard.
    pub async fn execute(&self, ticket: &AssignmentTicket, cancel: CancellationToken) -> Outcome {
        let started = Instant::now();
        let mut trace = Trace::default();
        let case_id = &ticket.case.id;

        info!(
            case_id = %case_id,
            attempt = ticket.attempt,
            persona = %ticket.persona.username,
            "Executing test case"
        );

        // The open runs on its own task so a session created after we stop
        // waiting is still closed
        let mut opening = {
            let factory = self.factory.clone();
            let persona = ticket.persona.clone();
            tokio::spawn(async move { factory.open(&persona).await })
        };
        let opened = tokio::select! {
            _ = cancel.cancelled() => None,
            opened = timeout(self.config.open_timeout, &mut opening) => Some(opened),
        };
        let session = match opened {
            Some(Ok(Ok(Ok(session)))) => session,
            Some(Ok(Ok(Err(e)))) => {
                trace.line(format!("open session failed: {}", e));
                return finish(started, trace, Some(StepFailure { step: 0, failure: e.into() }), Diagnostics::default());
            }
            Some(Ok(Err(e))) => {
                let failure = Failure::new(FailureKind::Protocol, format!("session open task failed: {}", e));
                return finish(started, trace, Some(StepFailure { step: 0, failure }), Diagnostics::default());
            }
            None => {
                close_when_opened(opening);
                return cancelled(started);
            }
            Some(Err(_)) => {
                close_when_opened(opening);
                let failure = Failure::new(
                    FailureKind::Timeout,
                    format!("opening a session took longer than {:?}", self.config.open_timeout),
                );
                return finish(started, trace, Some(StepFailure { step: 0, failure }), Diagnostics::default());
            }
        };
        trace.line(format!("session {} opened", session.id()));

        let mut guard = SessionGuard::new(session);
        let result = tokio::select! {
            _ = cancel.cancelled() => None,
            result = self.run_script(&mut guard, ticket, &mut trace) => Some(result),
        };

        let Some(result) = result else {
            // Dropping the guard spawns the close; nothing gets reported for
            // a cancelled attempt so don't spend time on evidence.
            debug!(case_id = %case_id, "Execution cancelled");
            drop(guard);
            return cancelled(started);
        };

        let mut diagnostics = Diagnostics::default();
        if let Err(failed) = &result {
            diagnostics = self.capture(&mut guard, failed.step).await;
        }

        if let Err(e) = guard.close().await {
            warn!(case_id = %case_id, "Failed to close session: {}", e);
        }

        finish(started, trace, result.err(), diagnostics)
    }

    async fn run_script(
        &self,
        guard: &mut SessionGuard,
        ticket: &AssignmentTicket,
        trace: &mut Trace,
    ) -> Result<(), StepFailure> {
        let session = guard
            .session()
            .map_err(|e| StepFailure { step: 0, failure: e.into() })?;

        for (index, step) in ticket.case.steps.iter().enumerate() {
            let label = step.label();
            let limit = self.step_limit(step);
            let begin = Instant::now();

            let result = match timeout(limit, self.run_step(session, ticket, step, trace)).await {
                Ok(result) => result,
                Err(_) => Err(SessionError::timeout(format!("step exceeded {:?}", limit))),
            };

            let elapsed = begin.elapsed().as_millis() as u64;
            trace.timings.push(StepTiming {
                step: label.clone(),
                duration_ms: elapsed,
            });

            if let Err(e) = result {
                trace.line(format!("[{}] {} failed after {}ms: {}", index, label, elapsed, e));
                return Err(StepFailure {
                    step: index,
                    failure: Failure::new(e.kind, format!("step {} ({}): {}", index, label, e.message)),
                });
            }
            trace.line(format!("[{}] {} ok in {}ms", index, label, elapsed));
        }

        let expect_index = ticket.case.steps.len();
        for check in &ticket.case.expect {
            let result = match timeout(self.config.step_timeout, evaluate(session, check, &ticket.persona)).await {
                Ok(result) => result,
                Err(_) => Err(SessionError::timeout("expectation check timed out")),
            };
            if let Err(e) = result {
                trace.line(format!("expect {} failed: {}", check.describe(), e));
                return Err(StepFailure {
                    step: expect_index,
                    failure: Failure::new(e.kind, format!("expectation {}: {}", check.describe(), e.message)),
                });
            }
            trace.line(format!("expect {} ok", check.describe()));
        }

        Ok(())
    }

    fn step_limit(&self, step: &Step) -> Duration {
        match step {
            Step::Wait { timeout_ms, .. } => self.config.step_timeout.max(Duration::from_millis(*timeout_ms)),
            Step::Sleep { ms } => self.config.step_timeout + Duration::from_millis(*ms),
            _ => self.config.step_timeout,
        }
    }

    async fn run_step(
        &self,
        session: &mut dyn Session,
        ticket: &AssignmentTicket,
        step: &Step,
        trace: &mut Trace,
    ) -> SessionResult<()> {
        let persona = &ticket.persona;
        match step {
            Step::Login => {
                let form = ticket
                    .login
                    .as_ref()
                    .ok_or_else(|| SessionError::protocol("plan has no login form"))?;
                session.navigate(&join_url(&ticket.base_url, &form.url)).await?;
                fill(session, &form.username_selector, &persona.username, true).await?;
                fill(session, &form.password_selector, &persona.password, true).await?;
                let submit = session.locate(&form.submit_selector).await?;
                session.act(&submit, Action::Click).await?;
                if let Some(selector) = &form.success_selector {
                    wait_for(session, selector, self.config.step_timeout).await?;
                }
                Ok(())
            }
            Step::Navigate { url } => {
                let url = join_url(&ticket.base_url, &persona.substitute(url));
                session.navigate(&url).await
            }
            Step::Click { selector } => {
                let element = session.locate(selector).await?;
                session.act(&element, Action::Click).await
            }
            Step::Fill {
                selector,
                value,
                clear_first,
            } => fill(session, selector, &persona.substitute(value), *clear_first).await,
            Step::Submit { selector } => {
                let element = session.locate(selector).await?;
                session.act(&element, Action::Submit).await
            }
            Step::Wait { selector, timeout_ms } => {
                wait_for(session, selector, Duration::from_millis(*timeout_ms)).await
            }
            Step::Assert(check) => evaluate(session, check, persona).await,
            Step::Screenshot { name } => {
                let png = session.screenshot().await?;
                match save_artifact(&self.config.artifacts_dir, &png).await {
                    Ok(path) => trace.line(format!("screenshot {} -> {}", name, path.display())),
                    Err(e) => warn!("Failed to store screenshot {}: {}", name, e),
                }
                Ok(())
            }
            Step::Sleep { ms } => {
                tokio::time::sleep(Duration::from_millis(*ms)).await;
                Ok(())
            }
            Step::Log { message } => {
                trace.line(persona.substitute(message));
                Ok(())
            }
        }
    }

    /// Best-effort evidence from the page the attempt ended on
    async fn capture(&self, guard: &mut SessionGuard, failed_step: usize) -> Diagnostics {
        let mut diagnostics = Diagnostics {
            failed_step: Some(failed_step),
            ..Default::default()
        };
        let Ok(session) = guard.session() else {
            return diagnostics;
        };
        let limit = self.config.step_timeout;

        if let Ok(Ok(url)) = timeout(limit, session.current_url()).await {
            diagnostics.last_url = Some(url);
        }
        if let Ok(Ok(title)) = timeout(limit, session.title()).await {
            diagnostics.page_title = Some(title);
        }
        match timeout(limit, session.screenshot()).await {
            Ok(Ok(png)) => match save_artifact(&self.config.artifacts_dir, &png).await {
                Ok(path) => diagnostics.screenshot = Some(path.display().to_string()),
                Err(e) => warn!("Failed to store failure screenshot: {}", e),
            },
            Ok(Err(e)) => debug!("No failure screenshot: {}", e),
            Err(_) => debug!("Failure screenshot timed out"),
        }

        diagnostics
    }
}

/// Release the session an abandoned open eventually produces
fn close_when_opened(opening: JoinHandle<SessionResult<Box<dyn Session>>>) {
    tokio::spawn(async move {
        if let Ok(Ok(session)) = opening.await {
            let id = session.id().to_string();
            debug!(session_id = %id, "Closing session opened after the attempt gave up on it");
            if let Err(e) = session.close().await {
                warn!(session_id = %id, "Failed to close late session: {}", e);
            }
        }
    });
}

fn cancelled(started: Instant) -> Outcome {
    Outcome::failed(
        Failure::new(FailureKind::RunTimeout, "execution cancelled"),
        started.elapsed().as_millis() as u64,
        Diagnostics::default(),
    )
}

fn finish(started: Instant, trace: Trace, failed: Option<StepFailure>, mut diagnostics: Diagnostics) -> Outcome {
    let duration_ms = started.elapsed().as_millis() as u64;
    diagnostics.protocol = trace.protocol;
    diagnostics.timings = trace.timings;

    match failed {
        None => Outcome::pass(duration_ms, diagnostics),
        Some(StepFailure { step, failure }) => {
            diagnostics.failed_step = Some(step);
            Outcome::failed(failure, duration_ms, diagnostics)
        }
    }
}

async fn fill(session: &mut dyn Session, selector: &str, value: &str, clear_first: bool) -> SessionResult<()> {
    let element = session.locate(selector).await?;
    if clear_first {
        session.act(&element, Action::Clear).await?;
    }
    session.act(&element, Action::SendKeys(value.to_string())).await
}

async fn wait_for(session: &mut dyn Session, selector: &str, limit: Duration) -> SessionResult<()> {
    let start = Instant::now();
    loop {
        match session.locate(selector).await {
            Ok(_) => return Ok(()),
            Err(e) if e.kind == FailureKind::ElementNotFound => {}
            Err(e) => return Err(e),
        }
        if start.elapsed() >= limit {
            return Err(SessionError::timeout(format!(
                "'{}' did not appear within {:?}",
                selector, limit
            )));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Evaluate a check against the rendered page
async fn evaluate(session: &mut dyn Session, check: &Check, persona: &Persona) -> SessionResult<()> {
    if let Some(selector) = &check.selector {
        let element = match session.locate(selector).await {
            Ok(element) => Some(element),
            Err(e) if e.kind == FailureKind::ElementNotFound && check.visible == Some(false) => None,
            Err(e) => return Err(e),
        };

        if let Some(element) = element {
            if let Some(expected) = check.visible {
                let visible = session.inspect_visible(&element).await?;
                if visible != expected {
                    return Err(SessionError::assertion(format!(
                        "'{}' visible = {}, expected {}",
                        selector, visible, expected
                    )));
                }
            }

            if check.text.is_some() || check.text_contains.is_some() {
                let text = session.inspect_text(&element).await?;
                let text = text.trim();
                if let Some(expected) = &check.text {
                    let expected = persona.substitute(expected);
                    if text != expected {
                        return Err(SessionError::assertion(format!(
                            "'{}' text is '{}', expected '{}'",
                            selector, text, expected
                        )));
                    }
                }
                if let Some(fragment) = &check.text_contains {
                    let fragment = persona.substitute(fragment);
                    if !text.contains(&fragment) {
                        return Err(SessionError::assertion(format!(
                            "'{}' text '{}' does not contain '{}'",
                            selector, text, fragment
                        )));
                    }
                }
            }
        }
    }

    if let Some(fragment) = &check.url_contains {
        let url = session.current_url().await?;
        if !url.contains(fragment.as_str()) {
            return Err(SessionError::assertion(format!(
                "url '{}' does not contain '{}'",
                url, fragment
            )));
        }
    }

    if let Some(expected) = &check.title {
        let title = session.title().await?;
        if &title != expected {
            return Err(SessionError::assertion(format!(
                "title is '{}', expected '{}'",
                title, expected
            )));
        }
    }

    Ok(())
}

/// Resolve a step URL against the plan base URL
pub fn join_url(base: &str, url: &str) -> String {
    if url.starts_with("http://") || url.starts_with("https://") {
        return url.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), url.trim_start_matches('/'))
}

/// Store bytes under their SHA-256 digest
pub async fn save_artifact(dir: &Path, bytes: &[u8]) -> std::io::Result<PathBuf> {
    let digest = hex::encode(Sha256::digest(bytes));
    let path = dir.join(format!("{}.png", digest));
    if tokio::fs::metadata(&path).await.is_err() {
        tokio::fs::create_dir_all(dir).await?;
        tokio::fs::write(&path, bytes).await?;
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tiltr_common::{TestCase, Verdict};

    use crate::session::ElementRef;

    /// Scripted page: selectors present on it, with text and visibility
    #[derive(Clone, Default)]
    struct Page {
        elements: HashMap<String, (String, bool)>,
        title: String,
        fail_navigation: bool,
        hang_on: Option<String>,
    }

    struct FakeSession {
        page: Page,
        url: Arc<Mutex<String>>,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Session for FakeSession {
        fn id(&self) -> &str {
            "fake"
        }

        async fn navigate(&mut self, url: &str) -> SessionResult<()> {
            if self.page.fail_navigation {
                return Err(SessionError::new(FailureKind::Navigation, "net::ERR_NAME_NOT_RESOLVED"));
            }
            *self.url.lock() = url.to_string();
            Ok(())
        }

        async fn locate(&mut self, selector: &str) -> SessionResult<ElementRef> {
            if self.page.hang_on.as_deref() == Some(selector) {
                std::future::pending::<()>().await;
            }
            if self.page.elements.contains_key(selector) {
                Ok(ElementRef(selector.to_string()))
            } else {
                Err(SessionError::element_not_found(selector))
            }
        }

        async fn act(&mut self, _element: &ElementRef, _action: Action) -> SessionResult<()> {
            Ok(())
        }

        async fn inspect_text(&mut self, element: &ElementRef) -> SessionResult<String> {
            Ok(self.page.elements[&element.0].0.clone())
        }

        async fn inspect_visible(&mut self, element: &ElementRef) -> SessionResult<bool> {
            Ok(self.page.elements[&element.0].1)
        }

        async fn current_url(&mut self) -> SessionResult<String> {
            Ok(self.url.lock().clone())
        }

        async fn title(&mut self) -> SessionResult<String> {
            Ok(self.page.title.clone())
        }

        async fn screenshot(&mut self) -> SessionResult<Vec<u8>> {
            Ok(b"fake png".to_vec())
        }

        async fn close(self: Box<Self>) -> SessionResult<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FakeFactory {
        page: Page,
        url: Arc<Mutex<String>>,
        closed: Arc<AtomicUsize>,
        open_delay: Duration,
    }

    impl FakeFactory {
        fn new(page: Page) -> Arc<Self> {
            Self::slow(page, Duration::ZERO)
        }

        fn slow(page: Page, open_delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                page,
                url: Arc::new(Mutex::new(String::new())),
                closed: Arc::new(AtomicUsize::new(0)),
                open_delay,
            })
        }
    }

    #[async_trait]
    impl SessionFactory for FakeFactory {
        async fn open(&self, _persona: &Persona) -> SessionResult<Box<dyn Session>> {
            tokio::time::sleep(self.open_delay).await;
            Ok(Box::new(FakeSession {
                page: self.page.clone(),
                url: self.url.clone(),
                closed: self.closed.clone(),
            }))
        }
    }

    fn exam_page() -> Page {
        let mut elements = HashMap::new();
        elements.insert("#answer".to_string(), (String::new(), true));
        elements.insert("#result".to_string(), ("Result: Passed".to_string(), true));
        elements.insert("#hidden".to_string(), ("secret".to_string(), false));
        Page {
            elements,
            title: "Exam".to_string(),
            ..Default::default()
        }
    }

    fn ticket(steps: Vec<Step>, expect: Vec<Check>) -> AssignmentTicket {
        AssignmentTicket {
            assignment_id: "as-1".to_string(),
            run_id: "run-1".to_string(),
            attempt: 1,
            case: TestCase {
                id: "case".to_string(),
                description: String::new(),
                persona: "alice".to_string(),
                tags: Vec::new(),
                steps,
                expect,
            },
            persona: Persona {
                username: "alice".to_string(),
                password: "pw".to_string(),
                browser: "firefox".to_string(),
            },
            base_url: "http://web/".to_string(),
            login: None,
        }
    }

    fn executor(factory: Arc<FakeFactory>, dir: &Path) -> Executor {
        Executor::new(
            factory,
            ExecutorConfig {
                open_timeout: Duration::from_secs(1),
                step_timeout: Duration::from_millis(200),
                artifacts_dir: dir.to_path_buf(),
            },
        )
    }

    fn result_check(contains: &str) -> Check {
        Check {
            selector: Some("#result".to_string()),
            text_contains: Some(contains.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_passing_case() {
        let dir = tempfile::tempdir().unwrap();
        let factory = FakeFactory::new(exam_page());
        let exec = executor(factory.clone(), dir.path());

        let t = ticket(
            vec![
                Step::Navigate { url: "/exam".to_string() },
                Step::Fill {
                    selector: "#answer".to_string(),
                    value: "${username}".to_string(),
                    clear_first: true,
                },
                Step::Submit { selector: "#answer".to_string() },
            ],
            vec![
                result_check("Passed"),
                Check {
                    selector: Some("#hidden".to_string()),
                    visible: Some(false),
                    ..Default::default()
                },
                Check {
                    url_contains: Some("/exam".to_string()),
                    title: Some("Exam".to_string()),
                    ..Default::default()
                },
            ],
        );

        let outcome = exec.execute(&t, CancellationToken::new()).await;
        assert_eq!(outcome.verdict, Verdict::Pass, "{:?}", outcome.failure);
        assert_eq!(outcome.diagnostics.timings.len(), 3);
        assert_eq!(*factory.url.lock(), "http://web/exam");
        assert_eq!(factory.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_expectation_mismatch_fails_with_evidence() {
        let dir = tempfile::tempdir().unwrap();
        let factory = FakeFactory::new(exam_page());
        let exec = executor(factory.clone(), dir.path());

        let t = ticket(
            vec![Step::Navigate { url: "/exam".to_string() }],
            vec![result_check("Failed")],
        );
        let outcome = exec.execute(&t, CancellationToken::new()).await;

        assert_eq!(outcome.verdict, Verdict::Fail);
        assert_eq!(outcome.failure.as_ref().unwrap().kind, FailureKind::AssertionMismatch);
        assert!(!outcome.is_retryable());
        assert_eq!(outcome.diagnostics.failed_step, Some(1));
        assert_eq!(outcome.diagnostics.last_url.as_deref(), Some("http://web/exam"));
        assert_eq!(outcome.diagnostics.page_title.as_deref(), Some("Exam"));

        let screenshot = PathBuf::from(outcome.diagnostics.screenshot.unwrap());
        let expected_name = format!("{}.png", hex::encode(Sha256::digest(b"fake png")));
        assert_eq!(screenshot.file_name().unwrap().to_str().unwrap(), expected_name);
        assert!(screenshot.exists());
        assert_eq!(factory.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_element_is_retryable() {
        let dir = tempfile::tempdir().unwrap();
        let factory = FakeFactory::new(exam_page());
        let exec = executor(factory.clone(), dir.path());

        let t = ticket(
            vec![
                Step::Navigate { url: "/".to_string() },
                Step::Click { selector: "#nope".to_string() },
            ],
            vec![],
        );
        let outcome = exec.execute(&t, CancellationToken::new()).await;

        assert_eq!(outcome.verdict, Verdict::Error);
        assert_eq!(outcome.failure.as_ref().unwrap().kind, FailureKind::ElementNotFound);
        assert!(outcome.is_retryable());
        assert_eq!(outcome.diagnostics.failed_step, Some(1));
    }

    #[tokio::test]
    async fn test_navigation_failure() {
        let dir = tempfile::tempdir().unwrap();
        let factory = FakeFactory::new(Page {
            fail_navigation: true,
            ..exam_page()
        });
        let exec = executor(factory, dir.path());

        let t = ticket(vec![Step::Navigate { url: "/".to_string() }], vec![]);
        let outcome = exec.execute(&t, CancellationToken::new()).await;
        assert_eq!(outcome.failure.unwrap().kind, FailureKind::Navigation);
    }

    #[tokio::test]
    async fn test_hanging_step_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let factory = FakeFactory::new(Page {
            hang_on: Some("#answer".to_string()),
            ..exam_page()
        });
        let exec = executor(factory.clone(), dir.path());

        let t = ticket(vec![Step::Click { selector: "#answer".to_string() }], vec![]);
        let outcome = exec.execute(&t, CancellationToken::new()).await;

        assert_eq!(outcome.failure.as_ref().unwrap().kind, FailureKind::Timeout);
        assert!(outcome.is_retryable());
        assert_eq!(factory.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancellation_releases_session() {
        let dir = tempfile::tempdir().unwrap();
        let factory = FakeFactory::new(exam_page());
        let exec = executor(factory.clone(), dir.path());

        let t = ticket(vec![Step::Sleep { ms: 10_000 }], vec![]);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let outcome = exec.execute(&t, cancel).await;
        assert_eq!(outcome.failure.unwrap().kind, FailureKind::RunTimeout);

        // The close is spawned from the guard's drop
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(factory.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_session_opened_after_cancellation_is_closed() {
        let dir = tempfile::tempdir().unwrap();
        let factory = FakeFactory::slow(exam_page(), Duration::from_millis(200));
        let exec = executor(factory.clone(), dir.path());

        let t = ticket(vec![Step::Navigate { url: "/".to_string() }], vec![]);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let outcome = exec.execute(&t, cancel).await;
        assert_eq!(outcome.failure.unwrap().kind, FailureKind::RunTimeout);
        assert_eq!(factory.closed.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(factory.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_session_opened_after_open_timeout_is_closed() {
        let dir = tempfile::tempdir().unwrap();
        let factory = FakeFactory::slow(exam_page(), Duration::from_millis(200));
        let exec = Executor::new(
            factory.clone(),
            ExecutorConfig {
                open_timeout: Duration::from_millis(20),
                step_timeout: Duration::from_millis(200),
                artifacts_dir: dir.path().to_path_buf(),
            },
        );

        let t = ticket(vec![Step::Navigate { url: "/".to_string() }], vec![]);
        let outcome = exec.execute(&t, CancellationToken::new()).await;
        assert_eq!(outcome.failure.as_ref().unwrap().kind, FailureKind::Timeout);
        assert!(outcome.is_retryable());

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(factory.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_join_url() {
        assert_eq!(join_url("http://web/", "/login.php"), "http://web/login.php");
        assert_eq!(join_url("http://web", "goto.php"), "http://web/goto.php");
        assert_eq!(join_url("http://web", "https://other/x"), "https://other/x");
    }
}
