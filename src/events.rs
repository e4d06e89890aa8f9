//! Publish/subscribe event emission.
//!
//! An explicit `EventSink` capability is handed to components at
//! construction rather than reaching for an ambient emitter. The sink set
//! (stdout, in-memory, JSON Lines, channel) all implement one trait and
//! are composed by `EventBus`, which fans each event out to every
//! registered sink.

use std::fs::File;
use std::io::{self, Stdout, Write};
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex as ParkingMutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::ids::SessionId;

/// The event kinds emitted by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    Initialized,
    TaskStateSaved,
    TaskStateLoaded,
    CheckpointCreated,
    CheckpointRestored,
    CrashDetected,
    CrashRecoveryCompleted,
    EmergencyCheckpoint,
    Alert,
    Shutdown,
}

impl EventKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::TaskStateSaved => "task-state-saved",
            Self::TaskStateLoaded => "task-state-loaded",
            Self::CheckpointCreated => "checkpoint-created",
            Self::CheckpointRestored => "checkpoint-restored",
            Self::CrashDetected => "crash-detected",
            Self::CrashRecoveryCompleted => "crash-recovery-completed",
            Self::EmergencyCheckpoint => "emergency-checkpoint",
            Self::Alert => "alert",
            Self::Shutdown => "shutdown",
        }
    }
}

/// A single emitted event: id, session, timestamp, and a structured payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub session_id: SessionId,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

impl Event {
    #[must_use]
    pub fn new(session_id: SessionId, kind: EventKind, payload: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id,
            kind,
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Compact JSON Lines representation.
    ///
    /// # Errors
    /// Returns an error if `self` cannot be represented as JSON (never
    /// happens for this type in practice, but the signature stays
    /// fallible so callers don't need to special-case it).
    pub fn to_json_string(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] {} (session={})",
            self.timestamp.to_rfc3339(),
            self.kind.as_str(),
            self.session_id
        )
    }
}

/// Abstraction over an output target that consumes emitted [`Event`]s.
pub trait EventSink: Send + Sync {
    /// Handle one event. [`EventBus::emit`] calls this synchronously while
    /// holding its sink lock, so a slow or blocking implementation here
    /// stalls every other sink and the calling task until it returns. Sinks
    /// that need to offload expensive work (e.g. streaming to a remote
    /// consumer) should hand events to a [`ChannelSink`] and drain the
    /// receiver from a separate task instead of doing the work inline.
    fn handle(&mut self, event: &Event) -> io::Result<()>;

    fn name(&self) -> &str {
        "EventSink"
    }
}

/// Writes a one-line human-readable rendering of each event to stdout.
pub struct StdOutSink {
    handle: Stdout,
}

impl Default for StdOutSink {
    fn default() -> Self {
        Self { handle: io::stdout() }
    }
}

impl EventSink for StdOutSink {
    fn handle(&mut self, event: &Event) -> io::Result<()> {
        writeln!(self.handle, "{event}")?;
        self.handle.flush()
    }

    fn name(&self) -> &str {
        "StdOutSink"
    }
}

/// In-memory sink for tests.
#[derive(Clone, Default)]
pub struct MemorySink {
    entries: Arc<ParkingMutex<Vec<Event>>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<Event> {
        self.entries.lock().clone()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl EventSink for MemorySink {
    fn handle(&mut self, event: &Event) -> io::Result<()> {
        self.entries.lock().push(event.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "MemorySink"
    }
}

/// One JSON object per line, for the `task-events.jsonl` consumer stream.
pub struct JsonLinesSink {
    handle: Box<dyn Write + Send + Sync>,
}

impl JsonLinesSink {
    #[must_use]
    pub fn new(handle: Box<dyn Write + Send + Sync>) -> Self {
        Self { handle }
    }

    #[must_use]
    pub fn to_stdout() -> Self {
        Self::new(Box::new(io::stdout()))
    }

    /// # Errors
    /// Returns an error if the file cannot be created or opened for append.
    pub fn to_file(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = File::options().create(true).append(true).open(path)?;
        Ok(Self::new(Box::new(file)))
    }
}

impl EventSink for JsonLinesSink {
    fn handle(&mut self, event: &Event) -> io::Result<()> {
        let json = event
            .to_json_string()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        writeln!(self.handle, "{json}")?;
        self.handle.flush()
    }

    fn name(&self) -> &str {
        "JsonLinesSink"
    }
}

/// Forwards events to a flume channel for a streaming consumer (dashboards,
/// SSE endpoints) that doesn't want to couple against this crate directly.
pub struct ChannelSink {
    tx: flume::Sender<Event>,
}

impl ChannelSink {
    #[must_use]
    pub fn new(tx: flume::Sender<Event>) -> Self {
        Self { tx }
    }
}

impl EventSink for ChannelSink {
    fn handle(&mut self, event: &Event) -> io::Result<()> {
        self.tx
            .send(event.clone())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "channel receiver dropped"))
    }

    fn name(&self) -> &str {
        "ChannelSink"
    }
}

/// Fan-out broadcaster: every emitted event is handed to every registered
/// sink in registration order. A sink error is logged and does not stop
/// delivery to the remaining sinks.
#[derive(Default)]
pub struct EventBus {
    sinks: ParkingMutex<Vec<Box<dyn EventSink>>>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_sinks(sinks: Vec<Box<dyn EventSink>>) -> Self {
        Self {
            sinks: ParkingMutex::new(sinks),
        }
    }

    pub fn add_sink(&self, sink: Box<dyn EventSink>) {
        self.sinks.lock().push(sink);
    }

    /// Dispatch `event` to every registered sink in order, synchronously
    /// and on the caller's task. A sink error is logged and does not stop
    /// delivery to the remaining sinks, but a sink doing blocking I/O
    /// (file writes, network calls) holds up the caller for that long; see
    /// [`EventSink::handle`] for how to avoid that.
    pub fn emit(&self, event: Event) {
        let mut sinks = self.sinks.lock();
        for sink in sinks.iter_mut() {
            if let Err(e) = sink.handle(&event) {
                warn!(sink = sink.name(), error = %e, "event sink failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bus_fans_out_to_every_sink() {
        let bus = EventBus::new();
        let sink = MemorySink::new();
        bus.add_sink(Box::new(sink.clone()));
        bus.emit(Event::new(
            SessionId::from("s1"),
            EventKind::Initialized,
            json!({}),
        ));
        assert_eq!(sink.snapshot().len(), 1);
    }

    #[test]
    fn event_kind_strings_match_spec() {
        assert_eq!(EventKind::TaskStateSaved.as_str(), "task-state-saved");
        assert_eq!(EventKind::CrashRecoveryCompleted.as_str(), "crash-recovery-completed");
    }
}
