//! Process execution for wsrun.
//!
//! The crate is layered bottom-up:
//! - [`CircularBuffer`] keeps the most recent output lines in bounded memory.
//! - [`process_group`] and [`pipe`] spawn detached children and signal their
//!   whole process group.
//! - [`BackgroundHandle`] buffers stdout/stderr/exit events until callbacks
//!   are attached and implements staged termination.
//! - [`Runtime`] abstracts the machine commands run on, with [`LocalRuntime`]
//!   and the ssh-backed [`RemoteRuntime`].
//! - [`BashEngine`] runs one script invocation with timeout, cancellation and
//!   an output overflow policy.

pub mod circular_buffer;
pub mod engine;
pub mod pipe;
pub mod process;
pub mod process_group;
pub mod quote;
pub mod runtime;
pub mod stream;

pub use circular_buffer::CircularBuffer;
pub use engine::{
    BashEngine, EngineOutcome, EngineRequest, ExecutionLimits, OVERFLOW_MARKER, OverflowInfo,
    SPILL_FILE_NAME,
};
pub use process::{BackgroundHandle, ExitRecord, TerminationOutcome};
pub use process_group::KillSignal;
pub use quote::{join_quoted, shell_quote};
pub use runtime::{
    BufferedOutput, ExecOptions, FileStat, LocalRuntime, RemoteRuntime, Runtime, RuntimeError,
    RuntimeKind, SpawnOptions, SpillSink, TIMEOUT_EXIT_CODE,
};
