use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::ConnectionId;

/// Option key read by `run` to build the `connect.after.all` writes list.
pub const WRITE_OPTION: &str = "write";

/// Metadata for one connection to establish.
///
/// Immutable once wrapped in an `Arc`; the orchestrator only ever borrows it.
pub struct Connection {
    id: ConnectionId,
    token: SecretString,
    options: HashMap<String, Value>,
}

impl Connection {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            id: ConnectionId::new(),
            token: SecretString::from(token.into()),
            options: HashMap::new(),
        }
    }

    pub fn with_id(mut self, id: ConnectionId) -> Self {
        self.id = id;
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let _ = self.options.insert(key.into(), value.into());
        self
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn token(&self) -> &SecretString {
        &self.token
    }

    pub fn option(&self, key: &str) -> Option<&Value> {
        self.options.get(key)
    }

    /// The configured `write` option, if any. `null` counts as absent.
    pub fn write_option(&self) -> Option<Value> {
        self.option(WRITE_OPTION).filter(|v| !v.is_null()).cloned()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("token", &"[REDACTED]")
            .field("options", &self.options)
            .finish()
    }
}

/// One or many connections handed to `run`.
#[derive(Clone, Debug, Default)]
pub struct Connections(Vec<Arc<Connection>>);

impl Connections {
    pub fn into_vec(self) -> Vec<Arc<Connection>> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Connection> for Connections {
    fn from(connection: Connection) -> Self {
        Self(vec![Arc::new(connection)])
    }
}

impl From<Arc<Connection>> for Connections {
    fn from(connection: Arc<Connection>) -> Self {
        Self(vec![connection])
    }
}

impl From<Vec<Connection>> for Connections {
    fn from(connections: Vec<Connection>) -> Self {
        Self(connections.into_iter().map(Arc::new).collect())
    }
}

impl From<Vec<Arc<Connection>>> for Connections {
    fn from(connections: Vec<Arc<Connection>>) -> Self {
        Self(connections)
    }
}

impl<const N: usize> From<[Connection; N]> for Connections {
    fn from(connections: [Connection; N]) -> Self {
        Self(connections.into_iter().map(Arc::new).collect())
    }
}

/// Where a single connection is in its handshake-and-session chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Initiated,
    HandshakeInFlight,
    HandshakeFailed,
    HandshakeSucceeded,
    SessionEstablished,
    SessionFailed,
    Cancelled,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::HandshakeFailed | Self::SessionEstablished | Self::SessionFailed | Self::Cancelled
        )
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::HandshakeFailed | Self::SessionFailed | Self::Cancelled)
    }

    /// Whether `next` is a legal successor of this state.
    pub fn can_advance_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Initiated, HandshakeInFlight) => true,
            (HandshakeInFlight, HandshakeFailed | HandshakeSucceeded) => true,
            (HandshakeSucceeded, SessionEstablished | SessionFailed) => true,
            (Initiated | HandshakeInFlight | HandshakeSucceeded, Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_else(|| format!("{:?}", self));
        f.write_str(&s)
    }
}
