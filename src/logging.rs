//! Logging setup.
//!
//! Binaries install `env_logger` via [`init_rust_logging`]. With the `python` feature
//! the extension module can instead route `log` records into Python's `logging`
//! package so host applications see them alongside their own records.
//!
//! The level comes from `BIOLINK_LOG`, then `RUST_LOG`, defaulting to `info`.

use std::sync::Once;

use env_logger::Env;
use log::LevelFilter;

static RUST_LOG_ONCE: Once = Once::new();

/// Variable consulted before `RUST_LOG`.
pub const LOG_ENV: &str = "BIOLINK_LOG";

fn env_level() -> LevelFilter {
    std::env::var(LOG_ENV)
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .as_deref()
        .and_then(|v| parse_level(Some(v)))
        .unwrap_or(LevelFilter::Info)
}

fn level_to_str(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::Off => "off",
        LevelFilter::Error => "error",
        LevelFilter::Warn => "warn",
        LevelFilter::Info => "info",
        LevelFilter::Debug => "debug",
        LevelFilter::Trace => "trace",
    }
}

fn parse_level(input: Option<&str>) -> Option<LevelFilter> {
    input.and_then(|s| s.trim().parse::<LevelFilter>().ok())
}

/// Initialize logging for Rust binaries (stderr formatter) based on `BIOLINK_LOG`/`RUST_LOG`.
pub fn init_rust_logging() {
    init_rust_logging_with(None);
}

/// Like [`init_rust_logging`], with an explicit level taking precedence over the
/// environment.
pub fn init_rust_logging_with(level: Option<&str>) {
    let level = parse_level(level).unwrap_or_else(env_level);
    RUST_LOG_ONCE.call_once(|| {
        let env = Env::default().default_filter_or(level_to_str(level));
        // A logger installed elsewhere (tests, host application) wins.
        let _ = env_logger::Builder::from_env(env)
            .format_timestamp_millis()
            .format_module_path(true)
            .format_target(true)
            .try_init();
    });
}

#[cfg(feature = "python")]
pub use self::python_bridge::{
    init_python_logging, reset_python_logging_cache, set_python_log_level_str,
};

#[cfg(feature = "python")]
mod python_bridge {
    use std::collections::HashMap;
    use std::sync::{Mutex, MutexGuard, Once};

    use log::{LevelFilter, Log, Metadata, Record};
    use once_cell::sync::OnceCell;
    use pyo3::prelude::*;
    use pyo3::types::{PyAny, PyModule, PyTuple};

    use super::{env_level, parse_level};

    static PY_LOG_ONCE: Once = Once::new();
    static PY_LOGGER: OnceCell<&'static PyLogger> = OnceCell::new();

    fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
        m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    struct PyLogger {
        top_filter: Mutex<LevelFilter>,
        logging_mod: Py<PyModule>,
        // target -> (effective level, logger)
        cache: Mutex<HashMap<String, (LevelFilter, Py<PyAny>)>>,
    }

    impl PyLogger {
        fn new(py: Python<'_>, top_filter: LevelFilter) -> PyResult<Self> {
            let logging = py.import("logging")?;
            Ok(Self {
                top_filter: Mutex::new(top_filter),
                logging_mod: logging.into(),
                cache: Mutex::new(HashMap::new()),
            })
        }

        fn map_level(level: log::Level) -> usize {
            match level {
                log::Level::Error => 40,
                log::Level::Warn => 30,
                log::Level::Info => 20,
                log::Level::Debug => 10,
                log::Level::Trace => 5,
            }
        }

        fn extract_max_level(logger: &Bound<'_, PyAny>) -> PyResult<LevelFilter> {
            use log::Level::*;
            for l in [Trace, Debug, Info, Warn, Error] {
                let enabled = logger
                    .call_method1("isEnabledFor", (Self::map_level(l),))?
                    .is_truthy()?;
                if enabled {
                    return Ok(l.to_level_filter());
                }
            }
            Ok(LevelFilter::Off)
        }

        /// Resolve (and cache) the Python logger for a dotted target.
        fn logger_for(&self, py: Python<'_>, target: &str) -> Option<(LevelFilter, Py<PyAny>)> {
            let mut cache = lock(&self.cache);
            if let Some((level, logger)) = cache.get(target) {
                return Some((*level, logger.clone_ref(py)));
            }
            let logger = match self
                .logging_mod
                .bind(py)
                .getattr("getLogger")
                .and_then(|f| f.call1((target,)))
            {
                Ok(l) => l,
                Err(e) => {
                    e.restore(py);
                    return None;
                }
            };
            let level = Self::extract_max_level(&logger).unwrap_or(LevelFilter::Off);
            let logger = logger.unbind();
            cache.insert(target.to_string(), (level, logger.clone_ref(py)));
            Some((level, logger))
        }

        fn log_record(&self, record: &Record) {
            let target = record.target().replace("::", ".");
            let level = record.level().to_level_filter();

            Python::attach(|py| {
                let Some((enabled_level, logger)) = self.logger_for(py, &target) else {
                    return;
                };
                if level > enabled_level || level > *lock(&self.top_filter) {
                    return;
                }

                let none = py.None();
                let logger = logger.bind(py);
                let made = logger.call_method1(
                    "makeRecord",
                    (
                        &target,
                        Self::map_level(record.level()),
                        record.file(),
                        record.line().unwrap_or_default(),
                        record.args().to_string(),
                        PyTuple::empty(py),
                        &none, // exc_info
                        &none, // func
                        &none, // extra
                    ),
                );
                match made.and_then(|rec| logger.call_method1("handle", (rec,))) {
                    Ok(_) => {}
                    Err(e) => e.restore(py),
                }
            });
        }
    }

    impl Log for PyLogger {
        fn enabled(&self, metadata: &Metadata) -> bool {
            metadata.level().to_level_filter() <= *lock(&self.top_filter)
        }

        fn log(&self, record: &Record) {
            self.log_record(record);
        }

        fn flush(&self) {}
    }

    /// Route Rust logs into Python's `logging`. Safe to call multiple times; a logger is
    /// installed on first call.
    pub fn init_python_logging(py: Python<'_>) -> PyResult<()> {
        let level = env_level();
        let mut failure = None;
        PY_LOG_ONCE.call_once(|| match PyLogger::new(py, level) {
            Ok(logger) => {
                let leaked: &'static PyLogger = Box::leak(Box::new(logger));
                if log::set_logger(leaked).is_ok() {
                    log::set_max_level(level);
                    let _ = PY_LOGGER.set(leaked);
                }
            }
            Err(e) => failure = Some(e),
        });
        failure.map_or(Ok(()), Err)
    }

    /// Drop cached per-target loggers (call after changing Python logging config).
    pub fn reset_python_logging_cache() {
        if let Some(logger) = PY_LOGGER.get() {
            lock(&logger.cache).clear();
        }
    }

    /// Set the minimum level forwarded to Python; `None` re-reads the environment.
    pub fn set_python_log_level_str(py: Python<'_>, level: Option<&str>) -> PyResult<()> {
        let level = parse_level(level).unwrap_or_else(env_level);
        init_python_logging(py)?;
        if let Some(logger) = PY_LOGGER.get() {
            *lock(&logger.top_filter) = level;
            lock(&logger.cache).clear();
        }
        log::set_max_level(level);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level(Some("debug")), Some(LevelFilter::Debug));
        assert_eq!(parse_level(Some(" WARN ")), Some(LevelFilter::Warn));
        assert_eq!(parse_level(Some("loud")), None);
        assert_eq!(parse_level(None), None);
    }

    #[test]
    fn test_level_names_round_trip() {
        for level in [LevelFilter::Off, LevelFilter::Error, LevelFilter::Trace] {
            assert_eq!(parse_level(Some(level_to_str(level))), Some(level));
        }
    }

    #[test]
    fn test_init_is_idempotent() {
        init_rust_logging_with(Some("debug"));
        init_rust_logging();
    }
}
