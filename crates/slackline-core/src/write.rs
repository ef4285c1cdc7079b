use tokio::sync::mpsc;

/// Returned when writing to a session whose socket pump has stopped.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("session is closed")]
pub struct SessionClosed;

/// Cloneable sender of outbound text frames into an established session.
#[derive(Clone, Debug)]
pub struct WriteHandle {
    tx: mpsc::UnboundedSender<String>,
}

impl WriteHandle {
    /// Create a handle and the receiving end a session pump drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, text: impl Into<String>) -> Result<(), SessionClosed> {
        self.tx.send(text.into()).map_err(|_| SessionClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Whether two handles feed the same session.
    pub fn same_session(&self, other: &WriteHandle) -> bool {
        self.tx.same_channel(&other.tx)
    }
}
