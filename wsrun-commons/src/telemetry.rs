use anyhow::Result;
use parking_lot::Mutex;

/// A lightweight sink used to record telemetry events emitted by the script
/// runner. The `Event` type is generic so consumers can plug in their own
/// schema without depending on `wsrun-core` internals.
pub trait TelemetrySink<Event>: Send + Sync {
    /// Record an event produced by the component.
    fn record(&self, event: &Event) -> Result<()>;

    /// Flush any buffered telemetry data to its destination.
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// A telemetry sink that ignores all events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTelemetry;

impl<Event> TelemetrySink<Event> for NoopTelemetry {
    fn record(&self, _event: &Event) -> Result<()> {
        Ok(())
    }
}

/// Keeps every recorded event in memory. Handy for tests and for callers that
/// want to inspect the events of a single run after it finishes.
#[derive(Debug)]
pub struct MemoryTelemetry<Event> {
    events: Mutex<Vec<Event>>,
}

impl<Event> Default for MemoryTelemetry<Event> {
    fn default() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }
}

impl<Event: Clone> MemoryTelemetry<Event> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the recorded events in arrival order.
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }
}

impl<Event: Clone + Send> TelemetrySink<Event> for MemoryTelemetry<Event> {
    fn record(&self, event: &Event) -> Result<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}
