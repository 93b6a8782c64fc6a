//! Error types for scheduling weak timers

use thiserror::Error;

/// Result type for scheduling operations
pub type Result<T> = std::result::Result<T, WeakTimerError>;

/// Errors reported at schedule time.
///
/// A dead owner is never an error: the firing is skipped instead.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WeakTimerError {
    #[error("no Tokio runtime is running on this thread, cannot start a timer")]
    NoRuntime,

    #[error("weak timer engine '{name}' has been shut down")]
    ShutDown { name: String },
}
