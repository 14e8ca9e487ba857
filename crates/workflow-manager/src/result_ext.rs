//! Logging helpers for results that are handled further up.

use std::fmt::Display;
use tracing::error;

/// Adds [`ResultExt::log`] to `Result`.
pub trait ResultExt<T, E> {
    /// Log the error at the caller's location and return the result as is.
    ///
    /// ```ignore
    /// use workflow_manager::result_ext::ResultExt;
    ///
    /// let outcome = executor.process_task_update(&event).await.log("processing task update");
    /// ```
    fn log<S: Display>(self, context: S) -> Result<T, E>;
}

impl<T, E: Display> ResultExt<T, E> for Result<T, E> {
    #[track_caller]
    fn log<S: Display>(self, context: S) -> Result<T, E> {
        if let Err(ref e) = self {
            let location = std::panic::Location::caller();
            error!(
                target: "workflow_manager",
                error = %e,
                file = %format!("{}:{}", location.file(), location.line()),
                context = %context,
                "Operation failed"
            );
        }
        self
    }
}
