//! Workspace script execution.
//!
//! [`ScriptRunner`] resolves a named script from the workspace scripts
//! directory (`.wsrun/scripts`, falling back to `.scripts`), checks that it
//! cannot escape that directory and runs it through the
//! [`wsrun_bash_runner::BashEngine`] on any [`wsrun_bash_runner::Runtime`].
//! [`FsScriptCatalog`] lists the scripts available to run.

pub mod discovery;
pub mod error;
pub mod quoting;
pub mod runner;

pub use discovery::{FsScriptCatalog, ScriptCatalog, WorkspaceScript, parse_description};
pub use error::ScriptError;
pub use quoting::build_invocation;
pub use runner::{
    ScriptExecutionResult, ScriptRunOptions, ScriptRunner, extract_overflow_path, run_script,
    validate_script_name,
};
