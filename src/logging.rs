//! Log setup for the binary and, with the `python` feature, for the extension module.
//!
//! The level comes from `POLAR_PMD_LOG`, then `RUST_LOG`, then defaults to `info`.

use std::sync::Once;

use log::LevelFilter;

const LEVEL_ENV: &str = "POLAR_PMD_LOG";

static RUST_LOG_ONCE: Once = Once::new();

/// Level from the environment, `info` when unset or unparsable.
pub fn env_level() -> LevelFilter {
    std::env::var(LEVEL_ENV)
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .and_then(|v| v.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Info)
}

/// Install the stderr logger. Later calls are no-ops.
///
/// An explicit `level` wins over the environment.
pub fn init_rust_logging(level: Option<LevelFilter>) {
    let level = level.unwrap_or_else(env_level);
    RUST_LOG_ONCE.call_once(|| {
        let mut builder = env_logger::Builder::new();
        builder
            .filter_level(level)
            .format_timestamp_millis()
            .format_module_path(true)
            .format_target(false);
        // A logger installed elsewhere (test harness, embedding app) wins.
        let _ = builder.try_init();
    });
}

#[cfg(feature = "python")]
pub use python_bridge::{init_python_logging, set_python_log_level};

#[cfg(feature = "python")]
mod python_bridge {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use log::{Level, LevelFilter, Log, Metadata, Record};
    use once_cell::sync::OnceCell;
    use pyo3::prelude::*;
    use pyo3::types::PyTuple;

    use super::env_level;

    static BRIDGE: OnceCell<&'static PyBridge> = OnceCell::new();

    /// Forwards `log` records to `logging.getLogger(<target>)`.
    struct PyBridge {
        level: Mutex<LevelFilter>,
        getter: Py<PyAny>,
        /// target -> (most verbose level the Python logger accepts, logger)
        loggers: Mutex<HashMap<String, (LevelFilter, Py<PyAny>)>>,
    }

    fn python_level(level: Level) -> u8 {
        match level {
            Level::Error => 40,
            Level::Warn => 30,
            Level::Info => 20,
            Level::Debug => 10,
            Level::Trace => 5,
        }
    }

    impl PyBridge {
        fn new(py: Python<'_>, level: LevelFilter) -> PyResult<Self> {
            let getter = py.import("logging")?.getattr("getLogger")?.unbind();
            Ok(Self {
                level: Mutex::new(level),
                getter,
                loggers: Mutex::new(HashMap::new()),
            })
        }

        fn current_level(&self) -> LevelFilter {
            self.level.lock().map(|l| *l).unwrap_or(LevelFilter::Off)
        }

        fn logger_for(&self, py: Python<'_>, target: &str) -> PyResult<(LevelFilter, Py<PyAny>)> {
            if let Ok(loggers) = self.loggers.lock() {
                if let Some((level, logger)) = loggers.get(target) {
                    return Ok((*level, logger.clone_ref(py)));
                }
            }
            let logger = self.getter.bind(py).call1((target,))?;
            let mut accepted = LevelFilter::Off;
            for level in [Level::Trace, Level::Debug, Level::Info, Level::Warn, Level::Error] {
                if logger
                    .call_method1("isEnabledFor", (python_level(level),))?
                    .is_truthy()?
                {
                    accepted = level.to_level_filter();
                    break;
                }
            }
            let logger = logger.unbind();
            if let Ok(mut loggers) = self.loggers.lock() {
                loggers.insert(target.to_owned(), (accepted, logger.clone_ref(py)));
            }
            Ok((accepted, logger))
        }

        fn forward(&self, py: Python<'_>, record: &Record) -> PyResult<()> {
            let target = record.target().replace("::", ".");
            let (accepted, logger) = self.logger_for(py, &target)?;
            if record.level().to_level_filter() > accepted {
                return Ok(());
            }
            let logger = logger.bind(py);
            let none = py.None();
            let py_record = logger.call_method1(
                "makeRecord",
                (
                    &target,
                    python_level(record.level()),
                    record.file(),
                    record.line().unwrap_or_default(),
                    record.args().to_string(),
                    PyTuple::empty(py),
                    &none,
                    &none,
                    &none,
                ),
            )?;
            logger.call_method1("handle", (py_record,))?;
            Ok(())
        }
    }

    impl Log for PyBridge {
        fn enabled(&self, metadata: &Metadata) -> bool {
            metadata.level().to_level_filter() <= self.current_level()
        }

        fn log(&self, record: &Record) {
            if !self.enabled(record.metadata()) {
                return;
            }
            Python::attach(|py| {
                if let Err(e) = self.forward(py, record) {
                    e.restore(py);
                }
            });
        }

        fn flush(&self) {}
    }

    /// Route Rust log records into Python's `logging`. Later calls are no-ops.
    pub fn init_python_logging(py: Python<'_>) -> PyResult<()> {
        if BRIDGE.get().is_some() {
            return Ok(());
        }
        let level = env_level();
        let bridge: &'static PyBridge = Box::leak(Box::new(PyBridge::new(py, level)?));
        if BRIDGE.set(bridge).is_ok() && log::set_logger(bridge).is_ok() {
            log::set_max_level(level);
        }
        Ok(())
    }

    /// Change the forwarded level at runtime and forget cached Python loggers.
    pub fn set_python_log_level(py: Python<'_>, level: Option<&str>) -> PyResult<()> {
        init_python_logging(py)?;
        let level = level
            .and_then(|l| l.parse::<LevelFilter>().ok())
            .unwrap_or_else(env_level);
        if let Some(bridge) = BRIDGE.get() {
            if let Ok(mut current) = bridge.level.lock() {
                *current = level;
            }
            if let Ok(mut loggers) = bridge.loggers.lock() {
                loggers.clear();
            }
        }
        log::set_max_level(level);
        Ok(())
    }
}
