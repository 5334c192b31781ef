use std::path::PathBuf;

use thiserror::Error;
use wsrun_bash_runner::RuntimeError;

/// Reasons a script run is rejected or aborted before a result exists.
///
/// Non-zero exits, timeouts, cancellation and output overflow are not errors:
/// they come back as an unsuccessful [`ScriptExecutionResult`](crate::ScriptExecutionResult).
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("invalid script name `{name}`: names cannot be empty or contain `/`, `\\` or `..`")]
    InvalidScriptName { name: String },

    #[error("script `{name}` resolves to {}, outside the scripts directory", resolved.display())]
    PathEscape { name: String, resolved: PathBuf },

    #[error(
        "script `{name}` not found: expected an executable file at `{expected}` in the workspace \
         (create it and run `chmod +x {expected}`)"
    )]
    NotFound { name: String, expected: String },

    #[error("script path {} is a directory, not an executable file", path.display())]
    IsDirectory { path: PathBuf },

    #[error("failed to allocate a temp directory for the run: {0}")]
    TempDirAllocation(#[source] RuntimeError),

    #[error("Script execution failed: {0}")]
    Execution(String),
}

impl ScriptError {
    /// True for rejections caused by the request itself (bad name, missing
    /// script) rather than by the environment.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidScriptName { .. }
                | Self::PathEscape { .. }
                | Self::NotFound { .. }
                | Self::IsDirectory { .. }
        )
    }
}
