//! Browser session abstraction
//!
//! The executor only sees [`Session`]: a remote browser that can navigate,
//! locate elements, act on them and report what is rendered. Every call
//! either succeeds or fails with a typed [`SessionError`]; there is no retry
//! logic at this layer.

use async_trait::async_trait;
use tiltr_common::Persona;
use tracing::{debug, warn};

use crate::error::{SessionError, SessionResult};

/// Opaque handle to a located element
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementRef(pub String);

/// Interaction with a located element
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Click,
    Clear,
    SendKeys(String),
    /// Submit the enclosing form
    Submit,
}

/// A live remote browser session
#[async_trait]
pub trait Session: Send {
    fn id(&self) -> &str;

    async fn navigate(&mut self, url: &str) -> SessionResult<()>;

    async fn locate(&mut self, selector: &str) -> SessionResult<ElementRef>;

    async fn act(&mut self, element: &ElementRef, action: Action) -> SessionResult<()>;

    /// Rendered text of an element
    async fn inspect_text(&mut self, element: &ElementRef) -> SessionResult<String>;

    /// Whether an element is displayed
    async fn inspect_visible(&mut self, element: &ElementRef) -> SessionResult<bool>;

    async fn current_url(&mut self) -> SessionResult<String>;

    async fn title(&mut self) -> SessionResult<String>;

    /// PNG bytes of the current viewport
    async fn screenshot(&mut self) -> SessionResult<Vec<u8>>;

    /// Release the remote session
    async fn close(self: Box<Self>) -> SessionResult<()>;
}

/// Opens sessions for personas
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self, persona: &Persona) -> SessionResult<Box<dyn Session>>;
}

/// Owns a session and guarantees it is released.
///
/// Call [`SessionGuard::close`] on the normal path. If the guard is dropped
/// while still holding a session (cancellation, panic unwinding) the close is
/// spawned onto the current runtime.
pub struct SessionGuard {
    session: Option<Box<dyn Session>>,
}

impl SessionGuard {
    pub fn new(session: Box<dyn Session>) -> Self {
        Self {
            session: Some(session),
        }
    }

    pub fn session(&mut self) -> SessionResult<&mut dyn Session> {
        match self.session.as_deref_mut() {
            Some(session) => Ok(session),
            None => Err(SessionError::protocol("session already closed")),
        }
    }

    pub async fn close(mut self) -> SessionResult<()> {
        match self.session.take() {
            Some(session) => {
                debug!(session_id = session.id(), "Closing session");
                session.close().await
            }
            None => Ok(()),
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let id = session.id().to_string();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = session.close().await {
                        warn!(session_id = %id, "Failed to close abandoned session: {}", e);
                    }
                });
            }
            Err(_) => warn!(session_id = %id, "Session leaked: no runtime to close it on"),
        }
    }
}
