use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::trace;

use slackline_core::LifecycleEvent;

/// Receives lifecycle events.
///
/// Called synchronously by whichever thread emits, so observers should
/// return quickly.
pub trait LifecycleObserver: Send + Sync {
    fn on_event(&self, event: &LifecycleEvent);

    /// Whether this observer takes responsibility for reporting
    /// `connect.error`. While one does, the default error log stays quiet.
    fn handles_errors(&self) -> bool {
        false
    }
}

impl<F> LifecycleObserver for F
where
    F: Fn(&LifecycleEvent) + Send + Sync,
{
    fn on_event(&self, event: &LifecycleEvent) {
        self(event)
    }
}

/// Fan-out of lifecycle events to registered observers, in registration order.
#[derive(Default)]
pub struct EventHub {
    observers: RwLock<Vec<Arc<dyn LifecycleObserver>>>,
    log_errors: AtomicBool,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, observer: Arc<dyn LifecycleObserver>) {
        self.observers.write().push(observer);
    }

    pub fn observer_count(&self) -> usize {
        self.observers.read().len()
    }

    /// Turn on the fallback that logs `connect.error` through the event's
    /// logger when no observer handles errors. Idempotent.
    pub fn install_default_error_handler(&self) {
        self.log_errors.store(true, Ordering::SeqCst);
    }

    pub fn default_error_handler_installed(&self) -> bool {
        self.log_errors.load(Ordering::SeqCst)
    }

    pub fn emit(&self, event: &LifecycleEvent) {
        // Snapshot so observers may subscribe from inside a callback.
        let observers = self.observers.read().clone();
        trace!(event = event.name(), observers = observers.len(), "emit");
        for observer in &observers {
            observer.on_event(event);
        }

        if let LifecycleEvent::Error { error, logger, .. } = event {
            if self.default_error_handler_installed()
                && !observers.iter().any(|o| o.handles_errors())
            {
                logger.error(&error.to_string());
            }
        }
    }
}

impl std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHub")
            .field("observers", &self.observer_count())
            .field("log_errors", &self.default_error_handler_installed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use slackline_core::{ConnectError, Connection, Logger};
    use tracing::Level;

    #[derive(Default)]
    struct Lines(Mutex<Vec<(Level, String)>>);

    impl Logger for Lines {
        fn log(&self, level: Level, message: &str) {
            self.0.lock().push((level, message.to_string()));
        }
    }

    struct Handler;

    impl LifecycleObserver for Handler {
        fn on_event(&self, _event: &LifecycleEvent) {}

        fn handles_errors(&self) -> bool {
            true
        }
    }

    fn error_event(logger: Arc<Lines>) -> LifecycleEvent {
        LifecycleEvent::Error {
            error: ConnectError::ConnectionAttemptFailed("refused".into()),
            connection: Arc::new(Connection::new("t")),
            logger,
        }
    }

    #[test]
    fn observers_see_events_in_registration_order() {
        let hub = EventHub::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second"] {
            let seen = Arc::clone(&seen);
            hub.subscribe(Arc::new(move |e: &LifecycleEvent| {
                seen.lock().push(format!("{tag}:{}", e.name()));
            }));
        }
        hub.emit(&LifecycleEvent::BeforeAll {
            connections: Vec::new(),
        });
        assert_eq!(
            *seen.lock(),
            vec!["first:connect.before.all", "second:connect.before.all"]
        );
    }

    #[test]
    fn errors_are_not_logged_without_default_handler() {
        let hub = EventHub::new();
        let logger = Arc::new(Lines::default());
        hub.emit(&error_event(logger.clone()));
        assert!(logger.0.lock().is_empty());
    }

    #[test]
    fn default_handler_logs_once_at_error_level() {
        let hub = EventHub::new();
        hub.install_default_error_handler();
        hub.install_default_error_handler();
        hub.subscribe(Arc::new(|_: &LifecycleEvent| {}));

        let logger = Arc::new(Lines::default());
        hub.emit(&error_event(logger.clone()));
        assert_eq!(
            *logger.0.lock(),
            vec![(Level::ERROR, "connection attempt failed: refused".to_string())]
        );
    }

    #[test]
    fn error_handling_observer_silences_default_handler() {
        let hub = EventHub::new();
        hub.install_default_error_handler();
        hub.subscribe(Arc::new(Handler));

        let logger = Arc::new(Lines::default());
        hub.emit(&error_event(logger.clone()));
        assert!(logger.0.lock().is_empty());
    }

    #[test]
    fn subscribe_from_inside_callback_does_not_deadlock() {
        let hub = Arc::new(EventHub::new());
        let inner = Arc::clone(&hub);
        hub.subscribe(Arc::new(move |_: &LifecycleEvent| {
            inner.subscribe(Arc::new(|_: &LifecycleEvent| {}));
        }));
        hub.emit(&LifecycleEvent::BeforeAll {
            connections: Vec::new(),
        });
        assert_eq!(hub.observer_count(), 2);
    }
}
