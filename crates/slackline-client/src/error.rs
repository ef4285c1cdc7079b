/// Programmer or configuration errors raised synchronously by the client.
///
/// Per-connection network failures never show up here; they are reported as
/// `connect.error` lifecycle events.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to start scheduler: {0}")]
    SchedulerInit(#[source] std::io::Error),
    #[error("scheduler is already running")]
    SchedulerBusy,
    #[error("scheduler still has {0} pending task(s)")]
    PendingWork(usize),
    #[error("scheduler cannot run from inside another async runtime")]
    InsideRuntime,
    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
    #[error("invalid handshake endpoint `{url}`: {reason}")]
    InvalidEndpoint { url: String, reason: String },
}
