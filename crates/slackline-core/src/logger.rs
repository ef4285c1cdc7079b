use tracing::Level;

/// Leveled message sink.
///
/// Handed to `connect.error` observers and to sessions so that failures and
/// session traffic land wherever the caller chose to record them.
pub trait Logger: Send + Sync {
    fn log(&self, level: Level, message: &str);

    fn error(&self, message: &str) {
        self.log(Level::ERROR, message);
    }

    fn warn(&self, message: &str) {
        self.log(Level::WARN, message);
    }

    fn info(&self, message: &str) {
        self.log(Level::INFO, message);
    }

    fn debug(&self, message: &str) {
        self.log(Level::DEBUG, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collect(Mutex<Vec<(Level, String)>>);

    impl Logger for Collect {
        fn log(&self, level: Level, message: &str) {
            self.0.lock().unwrap().push((level, message.to_string()));
        }
    }

    #[test]
    fn helpers_forward_level() {
        let logger = Collect::default();
        logger.error("e");
        logger.warn("w");
        logger.info("i");
        logger.debug("d");
        let lines = logger.0.lock().unwrap();
        assert_eq!(
            *lines,
            vec![
                (Level::ERROR, "e".to_string()),
                (Level::WARN, "w".to_string()),
                (Level::INFO, "i".to_string()),
                (Level::DEBUG, "d".to_string()),
            ]
        );
    }
}
