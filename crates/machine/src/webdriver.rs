//! W3C WebDriver session client
//!
//! Speaks the W3C WebDriver HTTP protocol to a Selenium grid hub. Each
//! command is bounded by the HTTP client timeout; failures are mapped onto
//! failure kinds and never retried here.

use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client, Method};
use serde_json::{json, Value};
use std::time::Duration;
use tiltr_common::{FailureKind, Persona};
use tracing::{debug, info};

use crate::error::{SessionError, SessionResult};
use crate::session::{Action, ElementRef, Session, SessionFactory};

/// W3C element reference key
const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

/// Enter key, used to submit forms
const ENTER_KEY: &str = "\u{E007}";

/// WebDriver connection settings
#[derive(Debug, Clone)]
pub struct WebDriverConfig {
    /// Grid hub URL, e.g. `http://selenium-hub:4444/wd/hub`
    pub grid_url: String,
    /// Upper bound on every HTTP command
    pub command_timeout: Duration,
    /// Implicit element wait set on new sessions
    pub implicit_wait: Duration,
    pub page_load_timeout: Duration,
}

impl Default for WebDriverConfig {
    fn default() -> Self {
        Self {
            grid_url: "http://localhost:4444/wd/hub".to_string(),
            command_timeout: Duration::from_secs(30),
            implicit_wait: Duration::from_millis(0),
            page_load_timeout: Duration::from_secs(30),
        }
    }
}

/// Opens WebDriver sessions on the grid
pub struct WebDriverFactory {
    client: Client,
    config: WebDriverConfig,
}

impl WebDriverFactory {
    pub fn new(config: WebDriverConfig) -> SessionResult<Self> {
        let client = Client::builder().timeout(config.command_timeout).build()?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl SessionFactory for WebDriverFactory {
    async fn open(&self, persona: &Persona) -> SessionResult<Box<dyn Session>> {
        let grid = self.config.grid_url.trim_end_matches('/');
        let capabilities = json!({
            "capabilities": {
                "alwaysMatch": { "browserName": persona.browser }
            }
        });

        let value = send(&self.client, Method::POST, &format!("{}/session", grid), Some(capabilities))
            .await
            .map_err(|e| match e.kind {
                // The grid refusing a session is a capacity problem, not a protocol one
                FailureKind::Protocol => SessionError::transport(e.message),
                _ => e,
            })?;

        let id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| SessionError::protocol("new session response without sessionId"))?
            .to_string();

        let session = WebDriverSession {
            client: self.client.clone(),
            base: format!("{}/session/{}", grid, id),
            id,
        };

        let timeouts = json!({
            "implicit": self.config.implicit_wait.as_millis() as u64,
            "pageLoad": self.config.page_load_timeout.as_millis() as u64,
        });
        if let Err(e) = session.command(Method::POST, "/timeouts", Some(timeouts)).await {
            // Don't leak the grid slot when setup fails
            if let Err(close_err) = Box::new(session).close().await {
                debug!("Closing half-open session failed: {}", close_err);
            }
            return Err(e);
        }

        info!(session_id = %session.id, browser = %persona.browser, "Opened WebDriver session");
        Ok(Box::new(session))
    }
}

/// One remote browser on the grid
pub struct WebDriverSession {
    client: Client,
    base: String,
    id: String,
}

impl WebDriverSession {
    async fn command(&self, method: Method, path: &str, body: Option<Value>) -> SessionResult<Value> {
        send(&self.client, method, &format!("{}{}", self.base, path), body).await
    }

    fn element_path(element: &ElementRef, suffix: &str) -> String {
        format!("/element/{}/{}", element.0, suffix)
    }
}

async fn send(client: &Client, method: Method, url: &str, body: Option<Value>) -> SessionResult<Value> {
    debug!(%method, url, "WebDriver command");

    let mut request = client.request(method, url);
    if let Some(body) = body {
        request = request.json(&body);
    }

    let response = request.send().await?;
    let status = response.status();
    let payload: Value = response
        .json()
        .await
        .map_err(|e| SessionError::protocol(format!("unreadable WebDriver response ({}): {}", status, e)))?;
    let value = payload.get("value").cloned().unwrap_or(Value::Null);

    if let Some(code) = value.get("error").and_then(Value::as_str) {
        let message = value.get("message").and_then(Value::as_str).unwrap_or_default();
        return Err(classify(code, message));
    }
    if !status.is_success() {
        return Err(SessionError::protocol(format!("WebDriver returned {}", status)));
    }

    Ok(value)
}

/// Map a W3C error code onto a failure kind
pub fn classify(code: &str, message: &str) -> SessionError {
    let kind = match code {
        "no such element" | "stale element reference" => FailureKind::ElementNotFound,
        "timeout" | "script timeout" => FailureKind::Timeout,
        "invalid session id" | "session not created" => FailureKind::Transport,
        _ => FailureKind::Protocol,
    };
    SessionError::new(kind, format!("{}: {}", code, message))
}

#[async_trait]
impl Session for WebDriverSession {
    fn id(&self) -> &str {
        &self.id
    }

    async fn navigate(&mut self, url: &str) -> SessionResult<()> {
        self.command(Method::POST, "/url", Some(json!({ "url": url })))
            .await
            .map_err(|e| match e.kind {
                FailureKind::Protocol => SessionError::new(FailureKind::Navigation, e.message),
                _ => e,
            })?;
        Ok(())
    }

    async fn locate(&mut self, selector: &str) -> SessionResult<ElementRef> {
        let value = self
            .command(
                Method::POST,
                "/element",
                Some(json!({ "using": "css selector", "value": selector })),
            )
            .await
            .map_err(|e| match e.kind {
                FailureKind::ElementNotFound => SessionError::element_not_found(selector),
                _ => e,
            })?;

        value
            .get(ELEMENT_KEY)
            .and_then(Value::as_str)
            .map(|id| ElementRef(id.to_string()))
            .ok_or_else(|| SessionError::protocol("element response without reference"))
    }

    async fn act(&mut self, element: &ElementRef, action: Action) -> SessionResult<()> {
        let (suffix, body) = match action {
            Action::Click => ("click", json!({})),
            Action::Clear => ("clear", json!({})),
            Action::SendKeys(text) => ("value", json!({ "text": text })),
            Action::Submit => ("value", json!({ "text": ENTER_KEY })),
        };
        self.command(Method::POST, &Self::element_path(element, suffix), Some(body))
            .await?;
        Ok(())
    }

    async fn inspect_text(&mut self, element: &ElementRef) -> SessionResult<String> {
        let value = self
            .command(Method::GET, &Self::element_path(element, "text"), None)
            .await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn inspect_visible(&mut self, element: &ElementRef) -> SessionResult<bool> {
        let value = self
            .command(Method::GET, &Self::element_path(element, "displayed"), None)
            .await?;
        value
            .as_bool()
            .ok_or_else(|| SessionError::protocol("displayed response is not a boolean"))
    }

    async fn current_url(&mut self) -> SessionResult<String> {
        let value = self.command(Method::GET, "/url", None).await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn title(&mut self) -> SessionResult<String> {
        let value = self.command(Method::GET, "/title", None).await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn screenshot(&mut self) -> SessionResult<Vec<u8>> {
        let value = self.command(Method::GET, "/screenshot", None).await?;
        let encoded = value
            .as_str()
            .ok_or_else(|| SessionError::protocol("screenshot response is not a string"))?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| SessionError::protocol(format!("invalid screenshot encoding: {}", e)))
    }

    async fn close(self: Box<Self>) -> SessionResult<()> {
        self.command(Method::DELETE, "", None).await?;
        debug!(session_id = %self.id, "Closed WebDriver session");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::Path,
        http::StatusCode,
        routing::{delete, get, post},
        Json, Router,
    };
    use test_case::test_case;

    #[test_case("no such element", FailureKind::ElementNotFound)]
    #[test_case("stale element reference", FailureKind::ElementNotFound)]
    #[test_case("timeout", FailureKind::Timeout)]
    #[test_case("session not created", FailureKind::Transport)]
    #[test_case("javascript error", FailureKind::Protocol)]
    fn test_classify(code: &str, kind: FailureKind) {
        assert_eq!(classify(code, "details").kind, kind);
    }

    /// Minimal grid hub: one page with a `#greeting` element
    fn fake_grid() -> Router {
        Router::new()
            .route(
                "/wd/hub/session",
                post(|| async { Json(json!({ "value": { "sessionId": "s1", "capabilities": {} } })) }),
            )
            .route("/wd/hub/session/:id", delete(|| async { Json(json!({ "value": null })) }))
            .route("/wd/hub/session/:id/timeouts", post(|| async { Json(json!({ "value": null })) }))
            .route("/wd/hub/session/:id/url", post(|| async { Json(json!({ "value": null })) }))
            .route(
                "/wd/hub/session/:id/title",
                get(|| async { Json(json!({ "value": "Welcome" })) }),
            )
            .route(
                "/wd/hub/session/:id/element",
                post(|Json(body): Json<Value>| async move {
                    if body["value"] == "#greeting" {
                        (StatusCode::OK, Json(json!({ "value": { ELEMENT_KEY: "e1" } })))
                    } else {
                        (
                            StatusCode::NOT_FOUND,
                            Json(json!({ "value": { "error": "no such element", "message": "nope" } })),
                        )
                    }
                }),
            )
            .route(
                "/wd/hub/session/:id/element/:eid/text",
                get(|Path((_, eid)): Path<(String, String)>| async move {
                    Json(json!({ "value": format!("hello from {}", eid) }))
                }),
            )
            .route(
                "/wd/hub/session/:id/screenshot",
                get(|| async { Json(json!({ "value": "iVBORw0K" })) }),
            )
    }

    #[tokio::test]
    async fn test_session_against_fake_grid() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, fake_grid()).await });

        let factory = WebDriverFactory::new(WebDriverConfig {
            grid_url: format!("http://{}/wd/hub", addr),
            command_timeout: Duration::from_secs(5),
            ..Default::default()
        })
        .unwrap();
        let persona = Persona {
            username: "alice".to_string(),
            password: "pw".to_string(),
            browser: "firefox".to_string(),
        };

        let mut session = factory.open(&persona).await.unwrap();
        assert_eq!(session.id(), "s1");

        session.navigate("http://web/").await.unwrap();
        assert_eq!(session.title().await.unwrap(), "Welcome");

        let element = session.locate("#greeting").await.unwrap();
        assert_eq!(element, ElementRef("e1".to_string()));
        assert_eq!(session.inspect_text(&element).await.unwrap(), "hello from e1");

        let missing = session.locate("#missing").await.unwrap_err();
        assert_eq!(missing.kind, FailureKind::ElementNotFound);

        assert_eq!(session.screenshot().await.unwrap(), vec![0x89, b'P', b'N', b'G', 0x0d, 0x0a]);
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_grid_is_transport() {
        let factory = WebDriverFactory::new(WebDriverConfig {
            grid_url: "http://127.0.0.1:1/wd/hub".to_string(),
            command_timeout: Duration::from_secs(2),
            ..Default::default()
        })
        .unwrap();
        let persona = Persona {
            username: "alice".to_string(),
            password: "pw".to_string(),
            browser: "firefox".to_string(),
        };
        let err = match factory.open(&persona).await {
            Err(e) => e,
            Ok(_) => panic!("expected connection failure"),
        };
        assert!(matches!(err.kind, FailureKind::Transport | FailureKind::Timeout));
    }
}
