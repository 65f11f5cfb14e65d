//! Logging helpers for results whose errors are reported but not propagated.
//!
//! Archive writes, event publishing and compute teardown all fail "softly":
//! the run keeps its state and the error only goes to the log.

use std::fmt::Display;

/// Log an `Err` with context and the caller's location, returning the
/// result unchanged.
pub trait ResultExt<T, E> {
    /// Log at `error` level.
    ///
    /// ```ignore
    /// use pg_dd_control_plane::result_ext::ResultExt;
    ///
    /// let result: Result<(), &str> = Err("archive unreachable");
    /// let _ = result.log("archiving run");
    /// ```
    fn log<S: Display>(self, context: S) -> Result<T, E>;

    /// Log at `warn` level, for failures that are expected now and then.
    fn log_warn<S: Display>(self, context: S) -> Result<T, E>;
}

impl<T, E: Display> ResultExt<T, E> for Result<T, E> {
    #[track_caller]
    fn log<S: Display>(self, context: S) -> Result<T, E> {
        if let Err(ref e) = self {
            let caller = std::panic::Location::caller();
            tracing::error!(
                target: "pg_dd_control_plane",
                error = %e,
                file = %format!("{}:{}", caller.file(), caller.line()),
                context = %context,
                "Operation failed"
            );
        }
        self
    }

    #[track_caller]
    fn log_warn<S: Display>(self, context: S) -> Result<T, E> {
        if let Err(ref e) = self {
            let caller = std::panic::Location::caller();
            tracing::warn!(
                target: "pg_dd_control_plane",
                error = %e,
                file = %format!("{}:{}", caller.file(), caller.line()),
                context = %context,
                "Operation failed"
            );
        }
        self
    }
}
