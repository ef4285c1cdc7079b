use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::connection::Connection;
use crate::errors::ConnectError;
use crate::logger::Logger;
use crate::write::WriteHandle;

pub const BEFORE_ALL: &str = "connect.before.all";
pub const BEFORE_EACH: &str = "connect.before.each";
pub const ERROR: &str = "connect.error";
pub const AFTER_EACH: &str = "connect.after.each";
pub const AFTER_ALL: &str = "connect.after.all";

/// Lifecycle notifications emitted around connection attempts.
///
/// Names and argument order match the `connect.*` events observers already
/// know; the payloads are typed instead of positional.
#[derive(Clone)]
pub enum LifecycleEvent {
    /// Before any connection of a `run` batch is initiated.
    BeforeAll { connections: Vec<Arc<Connection>> },
    /// Immediately before one connection's handshake begins.
    BeforeEach { connection: Arc<Connection> },
    /// A handshake or session-establishment failure.
    Error {
        error: ConnectError,
        connection: Arc<Connection>,
        logger: Arc<dyn Logger>,
    },
    /// A connection's chain settled; `write` is set only on success.
    AfterEach {
        connection: Arc<Connection>,
        write: Option<WriteHandle>,
    },
    /// After every connection of a batch was initiated (not completed).
    AfterAll {
        connections: Vec<Arc<Connection>>,
        writes: Vec<Option<Value>>,
    },
}

impl LifecycleEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::BeforeAll { .. } => BEFORE_ALL,
            Self::BeforeEach { .. } => BEFORE_EACH,
            Self::Error { .. } => ERROR,
            Self::AfterEach { .. } => AFTER_EACH,
            Self::AfterAll { .. } => AFTER_ALL,
        }
    }

    /// The connection a per-connection event refers to.
    pub fn connection(&self) -> Option<&Arc<Connection>> {
        match self {
            Self::BeforeEach { connection }
            | Self::Error { connection, .. }
            | Self::AfterEach { connection, .. } => Some(connection),
            Self::BeforeAll { .. } | Self::AfterAll { .. } => None,
        }
    }

    /// Failure message carried by `connect.error`.
    pub fn message(&self) -> Option<String> {
        match self {
            Self::Error { error, .. } => Some(error.to_string()),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

impl fmt::Debug for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct(self.name());
        match self {
            Self::BeforeAll { connections } => {
                s.field("connections", &connections.len());
            }
            Self::BeforeEach { connection } => {
                s.field("connection", connection.id());
            }
            Self::Error {
                error, connection, ..
            } => {
                s.field("error", error).field("connection", connection.id());
            }
            Self::AfterEach { connection, write } => {
                s.field("connection", connection.id())
                    .field("write", &write.is_some());
            }
            Self::AfterAll {
                connections,
                writes,
            } => {
                s.field("connections", &connections.len())
                    .field("writes", writes);
            }
        }
        s.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::Level;

    struct Silent;

    impl Logger for Silent {
        fn log(&self, _level: Level, _message: &str) {}
    }

    #[test]
    fn event_names() {
        let conn = Arc::new(Connection::new("t"));
        let events = [
            LifecycleEvent::BeforeAll {
                connections: vec![conn.clone()],
            },
            LifecycleEvent::BeforeEach {
                connection: conn.clone(),
            },
            LifecycleEvent::Error {
                error: ConnectError::Cancelled,
                connection: conn.clone(),
                logger: Arc::new(Silent),
            },
            LifecycleEvent::AfterEach {
                connection: conn.clone(),
                write: None,
            },
            LifecycleEvent::AfterAll {
                connections: vec![conn],
                writes: vec![None],
            },
        ];
        let names: Vec<_> = events.iter().map(LifecycleEvent::name).collect();
        assert_eq!(
            names,
            vec![
                "connect.before.all",
                "connect.before.each",
                "connect.error",
                "connect.after.each",
                "connect.after.all",
            ]
        );
    }

    #[test]
    fn error_event_message_and_connection() {
        let conn = Arc::new(Connection::new("t"));
        let event = LifecycleEvent::Error {
            error: ConnectError::ConnectionAttemptFailed("refused".into()),
            connection: conn.clone(),
            logger: Arc::new(Silent),
        };
        assert!(event.is_error());
        assert_eq!(
            event.message().as_deref(),
            Some("connection attempt failed: refused")
        );
        assert_eq!(event.connection().unwrap().id(), conn.id());
    }

    #[test]
    fn batch_events_have_no_connection() {
        let event = LifecycleEvent::BeforeAll {
            connections: Vec::new(),
        };
        assert!(event.connection().is_none());
        assert!(event.message().is_none());
    }

    #[test]
    fn debug_hides_token() {
        let conn = Arc::new(Connection::new("xoxb-hidden"));
        let event = LifecycleEvent::BeforeEach { connection: conn };
        let debug = format!("{event:?}");
        assert!(debug.starts_with("connect.before.each"));
        assert!(!debug.contains("xoxb-hidden"));
    }
}
