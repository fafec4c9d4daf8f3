//! # Error reporting
//!
//! Per-request failures inside the bridge are reported through an [`ErrorLogger`] supplied at
//! construction. The default, [`NullLogger`], discards them.
use std::error::Error;

/// Receives every per-request error the bridge turns into an HTTP error response.
pub trait ErrorLogger: Send + Sync + 'static {
    fn log(&self, message: &str, error: &(dyn Error + 'static));
}

/// Discards every report.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullLogger;

impl ErrorLogger for NullLogger {
    fn log(&self, _message: &str, _error: &(dyn Error + 'static)) {}
}

/// Emits every report as a `tracing` error event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl ErrorLogger for TracingLogger {
    fn log(&self, message: &str, error: &(dyn Error + 'static)) {
        tracing::error!(error = %error, "{}", message);
    }
}

impl<F> ErrorLogger for F
where
    F: Fn(&str, &(dyn Error + 'static)) + Send + Sync + 'static,
{
    fn log(&self, message: &str, error: &(dyn Error + 'static)) {
        self(message, error)
    }
}
