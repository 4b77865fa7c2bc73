//! Append-only experimental event log and its sinks.

use chrono::{DateTime, Local, TimeDelta};
use parking_lot::Mutex;
use rig_core::EventLogEntry;
use rig_timing::Clock;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

/// Destination for event log entries, in emission order.
pub trait EventSink: Send {
    fn append(&mut self, entry: &EventLogEntry) -> io::Result<()>;
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<S: EventSink + ?Sized> EventSink for Box<S> {
    fn append(&mut self, entry: &EventLogEntry) -> io::Result<()> {
        (**self).append(entry)
    }
    fn flush(&mut self) -> io::Result<()> {
        (**self).flush()
    }
}

/// Keeps entries in memory; clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    entries: Arc<Mutex<Vec<EventLogEntry>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<EventLogEntry> {
        self.entries.lock().clone()
    }

    pub fn events(&self) -> Vec<String> {
        self.entries.lock().iter().map(|e| e.event.clone()).collect()
    }

    /// Position of the first entry named `event`.
    pub fn position(&self, event: &str) -> Option<usize> {
        self.entries.lock().iter().position(|e| e.event == event)
    }
}

impl EventSink for MemorySink {
    fn append(&mut self, entry: &EventLogEntry) -> io::Result<()> {
        self.entries.lock().push(entry.clone());
        Ok(())
    }
}

/// Discards everything.
pub struct NullSink;

impl EventSink for NullSink {
    fn append(&mut self, _entry: &EventLogEntry) -> io::Result<()> {
        Ok(())
    }
}

const WALL_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

fn wall_time(anchor: DateTime<Local>, at_ns: u64) -> DateTime<Local> {
    anchor + TimeDelta::nanoseconds(at_ns.min(i64::MAX as u64) as i64)
}

/// `timestamp,event,metadata` rows with millisecond wall-clock timestamps.
pub struct CsvSink<W: Write + Send> {
    writer: csv::Writer<W>,
    anchor: DateTime<Local>,
}

impl CsvSink<BufWriter<File>> {
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        Self::from_writer(BufWriter::new(File::create(path)?), Local::now())
    }
}

impl<W: Write + Send> CsvSink<W> {
    /// `anchor` is the wall-clock time of session clock zero.
    pub fn from_writer(inner: W, anchor: DateTime<Local>) -> io::Result<Self> {
        let mut writer = csv::Writer::from_writer(inner);
        writer.write_record(["timestamp", "event", "metadata"])?;
        Ok(Self { writer, anchor })
    }

    pub fn into_inner(self) -> io::Result<W> {
        self.writer.into_inner().map_err(|e| e.into_error())
    }
}

impl<W: Write + Send> EventSink for CsvSink<W> {
    fn append(&mut self, entry: &EventLogEntry) -> io::Result<()> {
        let metadata = entry
            .metadata
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(";");
        let stamp = wall_time(self.anchor, entry.at_ns).format(WALL_FORMAT).to_string();
        self.writer.write_record([stamp.as_str(), entry.event.as_str(), metadata.as_str()])?;
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// One JSON object per line: the entry plus its rendered wall-clock time.
pub struct JsonLinesSink<W: Write + Send> {
    out: W,
    anchor: DateTime<Local>,
}

impl JsonLinesSink<BufWriter<File>> {
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self::from_writer(BufWriter::new(File::create(path)?), Local::now()))
    }
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn from_writer(out: W, anchor: DateTime<Local>) -> Self {
        Self { out, anchor }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

#[derive(serde::Serialize)]
struct JsonLine<'a> {
    wall: String,
    #[serde(flatten)]
    entry: &'a EventLogEntry,
}

impl<W: Write + Send> EventSink for JsonLinesSink<W> {
    fn append(&mut self, entry: &EventLogEntry) -> io::Result<()> {
        let line = JsonLine {
            wall: wall_time(self.anchor, entry.at_ns).to_rfc3339(),
            entry,
        };
        serde_json::to_writer(&mut self.out, &line)?;
        self.out.write_all(b"\n")
    }

    fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

/// Shared handle the engine emits through.
///
/// Timestamps are taken under the sink lock, so entries are appended in
/// timestamp order even when synchronized workers emit concurrently. Every
/// entry is mirrored to `tracing` under the `rig::events` target. A failing
/// sink is reported but never interrupts the session.
pub struct EventLog<C: Clock> {
    sink: Arc<Mutex<Box<dyn EventSink>>>,
    clock: C,
}

impl<C: Clock> Clone for EventLog<C> {
    fn clone(&self) -> Self {
        Self {
            sink: Arc::clone(&self.sink),
            clock: self.clock.clone(),
        }
    }
}

impl<C: Clock> EventLog<C> {
    pub fn new(sink: impl EventSink + 'static, clock: C) -> Self {
        Self::from_boxed(Box::new(sink), clock)
    }

    pub fn from_boxed(sink: Box<dyn EventSink>, clock: C) -> Self {
        Self {
            sink: Arc::new(Mutex::new(sink)),
            clock,
        }
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Appends `event` and returns its timestamp.
    pub fn emit(&self, event: impl Into<String>) -> u64 {
        self.emit_with(event, |e| e)
    }

    /// Appends `event` with metadata added by `fill`.
    pub fn emit_with(
        &self,
        event: impl Into<String>,
        fill: impl FnOnce(EventLogEntry) -> EventLogEntry,
    ) -> u64 {
        let mut sink = self.sink.lock();
        let entry = fill(EventLogEntry::new(self.clock.now(), event));
        if entry.metadata.is_empty() {
            tracing::info!(target: "rig::events", at_ns = entry.at_ns, "{}", entry.event);
        } else {
            tracing::info!(target: "rig::events", at_ns = entry.at_ns, metadata = ?entry.metadata, "{}", entry.event);
        }
        if let Err(e) = sink.append(&entry) {
            warn!("Event sink rejected '{}': {}", entry.event, e);
        }
        entry.at_ns
    }

    pub fn flush(&self) {
        if let Err(e) = self.sink.lock().flush() {
            warn!("Event sink flush failed: {}", e);
        }
    }
}
