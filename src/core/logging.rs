use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

/// Severity attached to every message handed to a [`LogCallback`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogSeverity {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for LogSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// Caller-supplied sink for diagnostic messages
pub type LogCallback = Arc<dyn Fn(LogSeverity, &str) + Send + Sync>;

/// Shared logging handle.
///
/// Every message is emitted as a `tracing` event at the matching level and is
/// also passed to the installed [`LogCallback`], if any. Clones share the same
/// callback slot, so installing a callback on one clone affects all of them.
#[derive(Clone, Default)]
pub struct Logger {
    callback: Arc<RwLock<Option<LogCallback>>>,
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("has_callback", &self.callback.read().is_some())
            .finish()
    }
}

impl Logger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or replace the callback
    pub fn set_callback(&self, callback: LogCallback) {
        *self.callback.write() = Some(callback);
    }

    pub fn clear_callback(&self) {
        *self.callback.write() = None;
    }

    pub fn log(&self, severity: LogSeverity, message: &str) {
        match severity {
            LogSeverity::Trace => tracing::trace!("{}", message),
            LogSeverity::Debug => tracing::debug!("{}", message),
            LogSeverity::Info => tracing::info!("{}", message),
            LogSeverity::Warning => tracing::warn!("{}", message),
            LogSeverity::Error | LogSeverity::Critical => tracing::error!("{}", message),
        }

        // Clone out of the lock so a callback may reconfigure the logger
        let callback = self.callback.read().clone();
        if let Some(callback) = callback {
            callback(severity, message);
        }
    }

    pub fn info(&self, message: &str) {
        self.log(LogSeverity::Info, message);
    }

    pub fn warn(&self, message: &str) {
        self.log(LogSeverity::Warning, message);
    }

    pub fn error(&self, message: &str) {
        self.log(LogSeverity::Error, message);
    }
}
