use slackline_core::Logger;
use tracing::Level;

/// Default [`Logger`]: forwards every message into `tracing` at the same level.
///
/// Where the lines end up is decided by the installed subscriber; with
/// [`init_telemetry`](crate::init_telemetry) that is stderr.
#[derive(Clone, Debug, Default)]
pub struct TracingLogger;

impl TracingLogger {
    pub fn new() -> Self {
        Self
    }
}

impl Logger for TracingLogger {
    fn log(&self, level: Level, message: &str) {
        match level {
            Level::ERROR => tracing::error!(target: "slackline", "{message}"),
            Level::WARN => tracing::warn!(target: "slackline", "{message}"),
            Level::INFO => tracing::info!(target: "slackline", "{message}"),
            Level::DEBUG => tracing::debug!(target: "slackline", "{message}"),
            Level::TRACE => tracing::trace!(target: "slackline", "{message}"),
        }
    }
}
