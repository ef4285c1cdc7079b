use std::error::Error as StdError;
use std::fmt;

/// Failure of one connection's handshake-and-session chain.
///
/// Every variant is reported through a `connect.error` lifecycle event; none of
/// them escape `add_connection` or `run` as a synchronous error.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    /// Transport, DNS or TLS failure before or during the HTTP handshake.
    #[error("connection attempt failed: {0}")]
    ConnectionAttemptFailed(String),
    /// The handshake completed but its body was unusable.
    #[error("malformed handshake response: {0}")]
    MalformedHandshakeResponse(String),
    /// The socket upgrade failed after a valid handshake.
    #[error("session establishment failed: {0}")]
    SessionEstablishmentFailed(String),
    #[error("connection attempt cancelled")]
    Cancelled,
}

/// Machine-checkable tag of a [`ConnectError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectErrorKind {
    ConnectionAttemptFailed,
    MalformedHandshakeResponse,
    SessionEstablishmentFailed,
    Cancelled,
}

impl ConnectError {
    pub fn kind(&self) -> ConnectErrorKind {
        match self {
            Self::ConnectionAttemptFailed(_) => ConnectErrorKind::ConnectionAttemptFailed,
            Self::MalformedHandshakeResponse(_) => ConnectErrorKind::MalformedHandshakeResponse,
            Self::SessionEstablishmentFailed(_) => ConnectErrorKind::SessionEstablishmentFailed,
            Self::Cancelled => ConnectErrorKind::Cancelled,
        }
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self.kind() {
            ConnectErrorKind::ConnectionAttemptFailed => "connection_attempt_failed",
            ConnectErrorKind::MalformedHandshakeResponse => "malformed_handshake_response",
            ConnectErrorKind::SessionEstablishmentFailed => "session_establishment_failed",
            ConnectErrorKind::Cancelled => "cancelled",
        }
    }

    /// Transport failure, keeping every `source()` in the message.
    pub fn transport(err: &(dyn StdError + 'static)) -> Self {
        Self::ConnectionAttemptFailed(error_chain(err))
    }

    /// Session failure, keeping every `source()` in the message.
    pub fn session(err: &(dyn StdError + 'static)) -> Self {
        Self::SessionEstablishmentFailed(error_chain(err))
    }
}

/// Host-to-address lookup failure.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("no addresses found for {host}")]
    NotFound { host: String },
    #[error("nameserver {server} returned {code} for {host}")]
    ServerFailure {
        host: String,
        server: String,
        code: String,
    },
    #[error("lookup of {host} timed out")]
    Timeout { host: String },
    #[error("lookup of {host} failed: {reason}")]
    Io { host: String, reason: String },
    #[error("invalid response from nameserver: {0}")]
    Protocol(String),
}

impl From<ResolveError> for ConnectError {
    fn from(err: ResolveError) -> Self {
        Self::ConnectionAttemptFailed(err.to_string())
    }
}

/// Render an error and its sources as `outer: inner: root`.
pub fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !out.contains(&text) {
            out.push_str(": ");
            out.push_str(&text);
        }
        source = cause.source();
    }
    out
}

impl fmt::Display for ConnectErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ConnectionAttemptFailed => "ConnectionAttemptFailed",
            Self::MalformedHandshakeResponse => "MalformedHandshakeResponse",
            Self::SessionEstablishmentFailed => "SessionEstablishmentFailed",
            Self::Cancelled => "Cancelled",
        };
        f.write_str(s)
    }
}
