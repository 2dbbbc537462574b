//! JSONL diagnostic logging for field devices.
//!
//! Each device writes machine-readable log lines to its own JSONL file, one
//! file per device per day, so logs pulled off several devices can be merged
//! and queried without parsing trouble:
//!
//! ```bash
//! # All sync failures across devices
//! jq 'select(.level == "warn" and (.msg | contains("failed")))' logs/*.jsonl
//!
//! # Timeline for one device
//! jq 'select(.device == "device-1")' logs/*.jsonl
//! ```
//!
//! The layer integrates with `tracing`; compose it with a console layer:
//!
//! ```ignore
//! use tracing_subscriber::prelude::*;
//!
//! let jsonl = patrolsync_core::logging::JsonlLayer::new("./logs", "device-1")?;
//! tracing_subscriber::registry()
//!     .with(jsonl)
//!     .with(tracing_subscriber::fmt::layer())
//!     .init();
//! ```

use std::fmt::Write as FmtWrite;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// A single device log entry in JSONL format.
///
/// Each entry is self-contained, so files survive interleaved appends and
/// truncated tails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceLogEntry {
    /// ISO 8601 timestamp (e.g., "2026-08-07T14:30:45.123Z")
    pub ts: String,

    /// Log level: trace, debug, info, warn, error
    pub level: String,

    /// Device identifier
    pub device: String,

    /// Module path / target (e.g., "patrolsync_core::sync")
    pub target: String,

    /// Human-readable message
    pub msg: String,

    /// Structured fields from the event, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<serde_json::Value>,
}

impl DeviceLogEntry {
    pub fn new(
        level: impl Into<String>,
        device: impl Into<String>,
        target: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self {
            ts: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            level: level.into(),
            device: device.into(),
            target: target.into(),
            msg: msg.into(),
            fields: None,
        }
    }

    pub fn with_fields(mut self, fields: serde_json::Value) -> Self {
        self.fields = Some(fields);
        self
    }

    /// Serialize to a single JSON line (no trailing newline)
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse from a JSON line
    pub fn from_json_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}

/// Appends entries to one device's daily JSONL file
struct DeviceLogWriter {
    path: PathBuf,
    device: String,
    file: Mutex<File>,
}

impl DeviceLogWriter {
    fn new(logs_dir: impl AsRef<Path>, device: impl Into<String>) -> std::io::Result<Self> {
        let device = device.into();
        let logs_dir = logs_dir.as_ref();
        std::fs::create_dir_all(logs_dir)?;

        let date = chrono::Utc::now().format("%Y-%m-%d");
        let path = logs_dir.join(format!("{date}_{device}.jsonl"));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            path,
            device,
            file: Mutex::new(file),
        })
    }

    fn write(&self, entry: &DeviceLogEntry) -> std::io::Result<()> {
        let line = entry
            .to_json_line()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let mut file = self.file.lock();
        writeln!(file, "{line}")?;
        file.flush()
    }
}

/// A tracing Layer that writes events to the device's JSONL file
pub struct JsonlLayer {
    writer: Arc<DeviceLogWriter>,
}

impl JsonlLayer {
    /// Create a JSONL layer writing under `logs_dir` for `device`
    pub fn new(logs_dir: impl AsRef<Path>, device: impl Into<String>) -> std::io::Result<Self> {
        Ok(Self {
            writer: Arc::new(DeviceLogWriter::new(logs_dir, device)?),
        })
    }

    /// Path of the file this layer appends to
    pub fn log_path(&self) -> &Path {
        &self.writer.path
    }
}

impl<S> Layer<S> for JsonlLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let level = metadata.level().as_str().to_lowercase();

        let mut visitor = JsonVisitor::default();
        event.record(&mut visitor);

        let mut entry = DeviceLogEntry::new(
            level,
            &self.writer.device,
            metadata.target(),
            visitor.message.unwrap_or_default(),
        );
        if !visitor.fields.is_empty() {
            entry = entry.with_fields(serde_json::Value::Object(visitor.fields));
        }

        // Logging must never panic the pipeline
        let _ = self.writer.write(&entry);
    }
}

/// Visitor that extracts the message and structured fields from an event
#[derive(Default)]
struct JsonVisitor {
    message: Option<String>,
    fields: serde_json::Map<String, serde_json::Value>,
}

impl Visit for JsonVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let mut buf = String::new();
        let _ = write!(&mut buf, "{:?}", value);
        if field.name() == "message" {
            self.message = Some(buf);
        } else {
            self.fields
                .insert(field.name().to_string(), serde_json::Value::String(buf));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.fields.insert(
                field.name().to_string(),
                serde_json::Value::String(value.to_string()),
            );
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::Number(value.into()));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::Number(value.into()));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::Bool(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.fields
                .insert(field.name().to_string(), serde_json::Value::Number(n));
        }
    }
}
