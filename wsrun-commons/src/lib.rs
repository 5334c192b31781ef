//! Shared helpers reused by the wsrun crates. The goal is to keep the
//! runtime, config, and script-runner crates decoupled from each other while
//! still sharing the small contracts they all need: lexical path handling and
//! a telemetry sink for execution events.

pub mod paths;
pub mod telemetry;

pub use paths::{canonicalize_workspace, contains_traversal, normalize_path, resolve_lenient};
pub use telemetry::{MemoryTelemetry, NoopTelemetry, TelemetrySink};
