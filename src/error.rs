use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

/// Engine error taxonomy, grouped by cause.
///
/// Schema errors carry the full list of human-readable validation messages.
/// Cancellation is deliberately its own variant so callers can tell an
/// aborted run apart from a failed one.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("genome failed validation: {}", .0.join("; "))]
    Schema(Vec<String>),
    #[error("physics instantiation failed: {0}")]
    Instantiation(String),
    #[error("runtime failure: {0}")]
    Runtime(String),
    #[error("run cancelled")]
    Cancelled,
}

impl EngineError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled)
    }

    /// Short stable name for the wire protocol.
    pub fn name(&self) -> &'static str {
        match self {
            EngineError::Schema(_) => "SchemaError",
            EngineError::Instantiation(_) => "InstantiationError",
            EngineError::Runtime(_) => "RuntimeError",
            EngineError::Cancelled => "CancellationError",
        }
    }
}

/// Cooperative cancellation flag shared between the worker boundary and
/// every suspension point inside a run.
///
/// The flag is a plain atomic so an external owner (shared-memory client,
/// abort channel handler) can trip it from another thread; the engine only
/// ever reads it.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an externally owned flag so aborts from either side are seen by
    /// both.
    pub fn from_flag(flag: Arc<AtomicBool>) -> Self {
        Self { flag }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Suspension-point check: errors with `Cancelled` once tripped.
    pub fn check(&self) -> Result<(), EngineError> {
        if self.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn shared_flag(&self) -> Arc<AtomicBool> {
        self.flag.clone()
    }
}
