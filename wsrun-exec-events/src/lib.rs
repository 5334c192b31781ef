//! Structured execution telemetry events emitted by the script runner.
//!
//! This crate exposes the serialized schema for script run lifecycle updates
//! so downstream applications can drive dashboards, logging, or auditing
//! pipelines without depending on the full `wsrun-core` crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Semantic version of the serialized event schema exported by this crate.
pub const EVENT_SCHEMA_VERSION: &str = "0.1.0";

/// Wraps a [`ScriptEvent`] with schema metadata so downstream consumers can
/// negotiate compatibility before processing an event stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionedScriptEvent {
    /// Semantic version describing the schema of the nested event payload.
    pub schema_version: String,
    /// Wall-clock time the event was produced.
    pub at: DateTime<Utc>,
    /// Concrete event emitted by the runner.
    pub event: ScriptEvent,
}

impl VersionedScriptEvent {
    /// Creates a new [`VersionedScriptEvent`] stamped with the current time.
    pub fn new(event: ScriptEvent) -> Self {
        Self {
            schema_version: EVENT_SCHEMA_VERSION.to_string(),
            at: Utc::now(),
            event,
        }
    }

    /// Returns the nested [`ScriptEvent`], consuming the wrapper.
    pub fn into_event(self) -> ScriptEvent {
        self.event
    }
}

impl From<ScriptEvent> for VersionedScriptEvent {
    fn from(event: ScriptEvent) -> Self {
        Self::new(event)
    }
}


/// JSON helper utilities for serializing and deserializing script events.
#[cfg(feature = "serde-json")]
pub mod json {
    use super::{ScriptEvent, VersionedScriptEvent};

    /// Serializes an event into a JSON string.
    pub fn to_string(event: &ScriptEvent) -> serde_json::Result<String> {
        serde_json::to_string(event)
    }

    /// Deserializes an event from a JSON string.
    pub fn from_str(payload: &str) -> serde_json::Result<ScriptEvent> {
        serde_json::from_str(payload)
    }

    /// Serializes a [`VersionedScriptEvent`] wrapper.
    pub fn versioned_to_string(event: &VersionedScriptEvent) -> serde_json::Result<String> {
        serde_json::to_string(event)
    }

    /// Deserializes a [`VersionedScriptEvent`] wrapper.
    pub fn versioned_from_str(payload: &str) -> serde_json::Result<VersionedScriptEvent> {
        serde_json::from_str(payload)
    }
}

#[cfg(feature = "telemetry-tracing")]
mod tracing_support {
    use wsrun_commons::TelemetrySink;

    use super::VersionedScriptEvent;

    /// Emits script events as `info`-level `tracing` events.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct TracingEmitter;

    impl TelemetrySink<VersionedScriptEvent> for TracingEmitter {
        fn record(&self, event: &VersionedScriptEvent) -> anyhow::Result<()> {
            tracing::info!(
                target: "wsrun_exec_events",
                schema_version = %event.schema_version,
                at = %event.at,
                event = ?event.event,
                "wsrun_exec_event"
            );
            Ok(())
        }
    }
}

#[cfg(feature = "telemetry-tracing")]
pub use tracing_support::TracingEmitter;

/// Runtime backend a script ran on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Local,
    Remote,
}

/// Lifecycle events produced for every script run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum ScriptEvent {
    /// The script passed validation and is about to be spawned.
    #[serde(rename = "script.started")]
    Started(ScriptStartedEvent),
    /// The script ran to completion with a zero exit code.
    #[serde(rename = "script.completed")]
    Completed(ScriptCompletedEvent),
    /// The script failed: non-zero exit, timeout, overflow, or spawn fault.
    #[serde(rename = "script.failed")]
    Failed(ScriptFailedEvent),
}

impl ScriptEvent {
    /// Identifier shared by every event of one run.
    pub fn execution_id(&self) -> &str {
        match self {
            Self::Started(event) => &event.execution_id,
            Self::Completed(event) => &event.execution_id,
            Self::Failed(event) => &event.execution_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScriptStartedEvent {
    pub execution_id: String,
    /// Script name as requested by the caller.
    pub script: String,
    pub arg_count: usize,
    pub backend: BackendKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScriptCompletedEvent {
    pub execution_id: String,
    pub exit_code: i32,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScriptFailedEvent {
    pub execution_id: String,
    /// Exit code when the process got far enough to report one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub reason: FailureReason,
    /// Location of the retained overflow log, if one was kept.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overflow_path: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    NonZeroExit,
    TimedOut,
    Cancelled,
    Overflow,
    SpawnError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_event_omits_empty_optionals() -> serde_json::Result<()> {
        let event = ScriptEvent::Failed(ScriptFailedEvent {
            execution_id: "run-1".to_string(),
            exit_code: None,
            reason: FailureReason::TimedOut,
            overflow_path: None,
        });

        let payload = serde_json::to_string(&event)?;
        assert!(payload.contains("\"type\":\"script.failed\""));
        assert!(payload.contains("\"reason\":\"timed_out\""));
        assert!(!payload.contains("overflow_path"));
        Ok(())
    }

    #[test]
    fn versioned_event_wraps_schema_version() {
        let event = ScriptEvent::Started(ScriptStartedEvent {
            execution_id: "abc".to_string(),
            script: "build.sh".to_string(),
            arg_count: 2,
            backend: BackendKind::Local,
        });

        let versioned = VersionedScriptEvent::new(event.clone());

        assert_eq!(versioned.schema_version, EVENT_SCHEMA_VERSION);
        assert_eq!(versioned.event.execution_id(), "abc");
        assert_eq!(versioned.into_event(), event);
    }

    #[cfg(feature = "serde-json")]
    #[test]
    fn versioned_json_keeps_payload() -> serde_json::Result<()> {
        let event = ScriptEvent::Completed(ScriptCompletedEvent {
            execution_id: "run-7".to_string(),
            exit_code: 0,
            duration_ms: 12,
        });

        let payload = crate::json::versioned_to_string(&VersionedScriptEvent::new(event.clone()))?;
        let restored = crate::json::versioned_from_str(&payload)?;

        assert_eq!(restored.schema_version, EVENT_SCHEMA_VERSION);
        assert_eq!(restored.event, event);
        Ok(())
    }

    #[cfg(feature = "telemetry-tracing")]
    #[test]
    fn tracing_emitter_records_as_telemetry_sink() -> anyhow::Result<()> {
        use wsrun_commons::TelemetrySink;

        let sink: &dyn TelemetrySink<VersionedScriptEvent> = &TracingEmitter;
        sink.record(&VersionedScriptEvent::new(ScriptEvent::Completed(
            ScriptCompletedEvent {
                execution_id: "run-9".to_string(),
                exit_code: 0,
                duration_ms: 3,
            },
        )))?;
        sink.flush()
    }
}
