//! Logging for the bridge and for the loaded component.
//!
//! The component logs through [`LoggerBridge`], which forwards to whatever
//! single-method sink the host provides. A failing or panicking sink is
//! swallowed there: the node must keep running when logging breaks.

use crate::component::LogCallback;
use std::fs::OpenOptions;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Tracing target for lines coming from the component.
pub const NODE_TARGET: &str = "dhtfox::node";

/// Failure reported by a host log sink.
#[derive(Debug, Error)]
#[error("log sink failed: {0}")]
pub struct SinkError(pub String);

/// The host's logging facility.
pub trait HostLogSink: Send + Sync {
    fn log_string_message(&self, message: &str) -> Result<(), SinkError>;
}

/// Sink writing to `tracing` under [`NODE_TARGET`].
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl HostLogSink for TracingSink {
    fn log_string_message(&self, message: &str) -> Result<(), SinkError> {
        match message.strip_prefix(ERROR_PREFIX) {
            Some(rest) => error!(target: NODE_TARGET, "{}", rest),
            None => info!(target: NODE_TARGET, "{}", message),
        }
        Ok(())
    }
}

const ERROR_PREFIX: &str = "[error] ";

/// Adapts component log calls to a [`HostLogSink`].
#[derive(Clone)]
pub struct LoggerBridge {
    sink: Arc<dyn HostLogSink>,
}

impl LoggerBridge {
    pub fn new(sink: Arc<dyn HostLogSink>) -> Self {
        Self { sink }
    }

    /// Bridge onto the process's `tracing` subscriber.
    pub fn tracing() -> Self {
        Self::new(Arc::new(TracingSink))
    }

    fn forward(&self, message: &str) {
        let sink = &self.sink;
        match panic::catch_unwind(AssertUnwindSafe(|| sink.log_string_message(message))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "dropped node log line"),
            Err(_) => debug!("log sink panicked, dropped node log line"),
        }
    }
}

impl LogCallback for LoggerBridge {
    fn log(&self, message: &str) {
        self.forward(message);
    }

    fn error(&self, message: &str) {
        self.forward(&format!("{ERROR_PREFIX}{message}"));
    }
}

/// Failure installing the process-wide subscriber.
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("failed to open log file '{path}': {source}")]
    File {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid log filter '{0}'")]
    Filter(String),

    #[error("subscriber already installed: {0}")]
    Install(String),
}

/// Install the global subscriber: `RUST_LOG` wins over `level`; writes to
/// `file` when given, stderr otherwise.
pub fn init_tracing(level: &str, file: Option<&Path>) -> Result<(), LoggingError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level).map_err(|_| LoggingError::Filter(level.to_string()))?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    let result = match file {
        Some(path) => {
            let log_file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| LoggingError::File {
                    path: path.display().to_string(),
                    source,
                })?;
            registry
                .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(log_file)))
                .try_init()
        }
        None => registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init(),
    };

    result.map_err(|e| LoggingError::Install(e.to_string()))
}
