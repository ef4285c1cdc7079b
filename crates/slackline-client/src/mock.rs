//! Deterministic collaborators for exercising the orchestrator without a
//! network.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use tokio_util::sync::CancellationToken;
use tracing::Level;

use slackline_core::{ConnectError, ConnectionId, LifecycleEvent, Logger, WriteHandle};

use crate::handshake::{Handshake, HandshakeResult};
use crate::observer::LifecycleObserver;
use crate::scheduler::SchedulerHandle;
use crate::session::{Session, SessionFactory};

/// Pre-programmed handshake outcome.
#[derive(Clone, Debug)]
pub enum MockHandshakeResponse {
    /// Succeed with this session endpoint.
    Url(String),
    /// Fail with this error.
    Error(ConnectError),
    /// Wait, then yield the inner response.
    Delay(Duration, Box<MockHandshakeResponse>),
    /// Never complete; only cancellation ends the attempt.
    Pending,
}

impl MockHandshakeResponse {
    pub fn url(url: &str) -> Self {
        Self::Url(url.to_string())
    }

    pub fn refused() -> Self {
        Self::Error(ConnectError::ConnectionAttemptFailed(
            "Connection refused (os error 111)".into(),
        ))
    }

    pub fn delayed(delay: Duration, inner: MockHandshakeResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Handshake that answers per token and remembers every token it saw.
pub struct MockHandshake {
    responses: HashMap<String, MockHandshakeResponse>,
    fallback: MockHandshakeResponse,
    seen: Mutex<Vec<String>>,
}

impl MockHandshake {
    /// Every token gets `response`.
    pub fn new(response: MockHandshakeResponse) -> Self {
        Self {
            responses: HashMap::new(),
            fallback: response,
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Answer `token` with `response` instead of the fallback.
    pub fn with_token(mut self, token: &str, response: MockHandshakeResponse) -> Self {
        let _ = self.responses.insert(token.to_string(), response);
        self
    }

    pub fn tokens_seen(&self) -> Vec<String> {
        self.seen.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.seen.lock().len()
    }
}

#[async_trait]
impl Handshake for MockHandshake {
    async fn request_session_endpoint(
        &self,
        token: &SecretString,
        cancel: &CancellationToken,
    ) -> Result<HandshakeResult, ConnectError> {
        let token = token.expose_secret().to_string();
        let mut response = self
            .responses
            .get(&token)
            .unwrap_or(&self.fallback)
            .clone();
        self.seen.lock().push(token);

        loop {
            match response {
                MockHandshakeResponse::Url(url) => return Ok(HandshakeResult { url }),
                MockHandshakeResponse::Error(error) => return Err(error),
                MockHandshakeResponse::Delay(delay, inner) => {
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(ConnectError::Cancelled),
                        _ = tokio::time::sleep(delay) => response = *inner,
                    }
                }
                MockHandshakeResponse::Pending => {
                    cancel.cancelled().await;
                    return Err(ConnectError::Cancelled);
                }
            }
        }
    }
}

#[derive(Clone, Debug)]
enum SessionMode {
    Closed,
    HeldOpen,
    Fail(ConnectError),
}

/// Session factory that records the endpoints it was asked for.
pub struct MockSessionFactory {
    mode: SessionMode,
    endpoints: Mutex<Vec<String>>,
    writers: Mutex<Vec<WriteHandle>>,
}

impl MockSessionFactory {
    fn with_mode(mode: SessionMode) -> Self {
        Self {
            mode,
            endpoints: Mutex::new(Vec::new()),
            writers: Mutex::new(Vec::new()),
        }
    }

    /// Sessions that are already closed when returned, so `run` does not
    /// wait on them.
    pub fn new() -> Self {
        Self::with_mode(SessionMode::Closed)
    }

    /// Sessions that stay open on the scheduler until closed.
    pub fn held_open() -> Self {
        Self::with_mode(SessionMode::HeldOpen)
    }

    pub fn failing(error: ConnectError) -> Self {
        Self::with_mode(SessionMode::Fail(error))
    }

    pub fn endpoints(&self) -> Vec<String> {
        self.endpoints.lock().clone()
    }

    /// Writers handed out with each returned session, in creation order.
    pub fn writers(&self) -> Vec<WriteHandle> {
        self.writers.lock().clone()
    }
}

impl Default for MockSessionFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionFactory for MockSessionFactory {
    async fn create_session(
        &self,
        endpoint: &str,
        scheduler: &SchedulerHandle,
        _logger: Arc<dyn Logger>,
        cancel: &CancellationToken,
    ) -> Result<Session, ConnectError> {
        self.endpoints.lock().push(endpoint.to_string());
        if cancel.is_cancelled() {
            return Err(ConnectError::Cancelled);
        }

        let session = match &self.mode {
            SessionMode::Fail(error) => return Err(error.clone()),
            SessionMode::Closed => Session::detached(endpoint),
            SessionMode::HeldOpen => {
                let (writer, mut outbound) = WriteHandle::channel();
                let shutdown = CancellationToken::new();
                let closed = CancellationToken::new();
                let stop = shutdown.clone();
                let done = closed.clone().drop_guard();
                scheduler.spawn(async move {
                    let _done = done;
                    loop {
                        tokio::select! {
                            _ = stop.cancelled() => break,
                            frame = outbound.recv() => {
                                if frame.is_none() {
                                    break;
                                }
                            }
                        }
                    }
                });
                Session::new(endpoint, writer, shutdown, closed)
            }
        };
        self.writers.lock().push(session.writer());
        Ok(session)
    }
}

/// Logger that keeps every line in memory.
#[derive(Default)]
pub struct RecordingLogger {
    lines: Mutex<Vec<(Level, String)>>,
}

impl RecordingLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<(Level, String)> {
        self.lines.lock().clone()
    }

    pub fn at(&self, level: Level) -> Vec<String> {
        self.lines
            .lock()
            .iter()
            .filter(|(l, _)| *l == level)
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub fn errors(&self) -> Vec<String> {
        self.at(Level::ERROR)
    }
}

impl Logger for RecordingLogger {
    fn log(&self, level: Level, message: &str) {
        self.lines.lock().push((level, message.to_string()));
    }
}

/// Observer that keeps every event it sees.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<LifecycleEvent>>,
    handles_errors: bool,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// A recorder that also claims `connect.error`, silencing the default
    /// error log.
    pub fn handling_errors() -> Self {
        Self {
            handles_errors: true,
            ..Self::default()
        }
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(LifecycleEvent::name).collect()
    }

    /// Names of the per-connection events seen for `id`, in order.
    pub fn names_for(&self, id: &ConnectionId) -> Vec<&'static str> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.connection().is_some_and(|c| c.id() == id))
            .map(LifecycleEvent::name)
            .collect()
    }
}

impl LifecycleObserver for RecordingObserver {
    fn on_event(&self, event: &LifecycleEvent) {
        self.events.lock().push(event.clone());
    }

    fn handles_errors(&self) -> bool {
        self.handles_errors
    }
}
