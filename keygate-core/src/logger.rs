use std::sync::{Arc, OnceLock};

/// Host-side log sink.
///
/// Hosts implement this to receive the crate's log records in their own
/// logging system. With the `ffi` feature it is exported as a foreign trait.
///
/// # Examples
///
/// ```rust
/// use keygate_core::logger::{LogLevel, Logger};
///
/// struct StderrLogger;
///
/// impl Logger for StderrLogger {
///     fn log(&self, level: LogLevel, message: String) {
///         eprintln!("[{level:?}] {message}");
///     }
/// }
/// ```
///
/// ## Kotlin
///
/// ```kotlin
/// object KeygateLogBridge : Logger {
///     override fun log(level: LogLevel, message: String) {
///         Log.println(level.toPriority(), "keygate", message)
///     }
/// }
///
/// setLogger(KeygateLogBridge) // once, in Application.onCreate
/// ```
#[cfg_attr(feature = "ffi", uniffi::export(with_foreign))]
pub trait Logger: Sync + Send {
    /// Records one message.
    fn log(&self, level: LogLevel, message: String);
}

/// Severity of a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "ffi", derive(uniffi::Enum))]
pub enum LogLevel {
    /// Very detailed tracing.
    Trace,
    /// Debugging detail.
    Debug,
    /// Normal progress (keys generated, sessions finished).
    Info,
    /// Something the host may want to act on (lockouts, rejected tokens).
    Warn,
    /// Failures.
    Error,
}

/// Bridges the `log` facade to the installed [`Logger`].
struct ForeignLogger;

impl log::Log for ForeignLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        let is_record_from_keygate = record
            .module_path()
            .is_some_and(|module_path| module_path.starts_with("keygate"));
        let is_debug_or_trace_level =
            record.level() == log::Level::Debug || record.level() == log::Level::Trace;

        // Dependencies are only interesting from info upwards.
        if is_debug_or_trace_level && !is_record_from_keygate {
            return;
        }

        if let Some(logger) = LOGGER_INSTANCE.get() {
            logger.log(log_level(record.level()), record.args().to_string());
        }
    }

    fn flush(&self) {}
}

const fn log_level(level: log::Level) -> LogLevel {
    match level {
        log::Level::Error => LogLevel::Error,
        log::Level::Warn => LogLevel::Warn,
        log::Level::Info => LogLevel::Info,
        log::Level::Debug => LogLevel::Debug,
        log::Level::Trace => LogLevel::Trace,
    }
}

static LOGGER_INSTANCE: OnceLock<Arc<dyn Logger>> = OnceLock::new();

/// Installs the host logger. Only the first call takes effect.
///
/// Fails quietly (with a message on stderr) if another `log` implementation
/// was installed first.
#[cfg_attr(feature = "ffi", uniffi::export)]
pub fn set_logger(logger: Arc<dyn Logger>) {
    if LOGGER_INSTANCE.set(logger).is_err() {
        eprintln!("keygate logger already set");
        return;
    }
    if let Err(e) = init_logger() {
        eprintln!("failed to install keygate logger: {e}");
    }
}

fn init_logger() -> Result<(), log::SetLoggerError> {
    static LOGGER: ForeignLogger = ForeignLogger;
    log::set_logger(&LOGGER)?;
    log::set_max_level(log::LevelFilter::Trace);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Capture(Mutex<Vec<(LogLevel, String)>>);

    impl Logger for Capture {
        fn log(&self, level: LogLevel, message: String) {
            self.0.lock().unwrap().push((level, message));
        }
    }

    #[test]
    fn test_records_forwarded_and_filtered() {
        let capture = Arc::new(Capture::default());
        set_logger(capture.clone());

        log::info!("keygate ready");
        log::logger().log(
            &log::Record::builder()
                .level(log::Level::Debug)
                .module_path(Some("hyper::client"))
                .args(format_args!("noise"))
                .build(),
        );

        let records = capture.0.lock().unwrap();
        assert!(records
            .iter()
            .any(|(level, message)| *level == LogLevel::Info && message == "keygate ready"));
        assert!(!records.iter().any(|(_, message)| message == "noise"));
    }

    #[test]
    fn test_level_mapping() {
        assert_eq!(log_level(log::Level::Warn), LogLevel::Warn);
        assert_eq!(log_level(log::Level::Trace), LogLevel::Trace);
    }
}
