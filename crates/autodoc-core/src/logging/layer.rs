//! `tracing` layer that appends events to a per-instance JSONL file.

use std::fmt::Write as FmtWrite;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

use super::entry::JsonLogEntry;

/// Writes every event as one JSON line to `<logs_dir>/raw/<date>_<instance>.jsonl`.
///
/// Each peer instance gets its own file, so several peers in one test run
/// or on one machine never interleave partial lines.
pub struct JsonlLayer {
    instance: String,
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl JsonlLayer {
    /// Create the `raw/` directory if needed and open the day's file for appending.
    pub fn new(logs_dir: impl AsRef<Path>, instance: impl Into<String>) -> std::io::Result<Self> {
        let instance = instance.into();
        let raw_dir = logs_dir.as_ref().join("raw");
        fs::create_dir_all(&raw_dir)?;

        let date = chrono::Local::now().format("%Y-%m-%d");
        let path = raw_dir.join(format!("{}_{}.jsonl", date, instance));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            instance,
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    /// Path of the file being written
    pub fn log_path(&self) -> &Path {
        &self.path
    }

    /// Instance name stamped on entries
    pub fn instance(&self) -> &str {
        &self.instance
    }

    fn write(&self, entry: &JsonLogEntry) -> std::io::Result<()> {
        let json = entry
            .to_json_line()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let mut writer = self.writer.lock();
        writeln!(writer, "{}", json)?;
        writer.flush()
    }
}

impl<S> Layer<S> for JsonlLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let level = metadata.level().as_str().to_lowercase();

        let mut visitor = JsonVisitor::default();
        event.record(&mut visitor);

        let mut entry = JsonLogEntry::new(
            level,
            &self.instance,
            metadata.target(),
            visitor.message.unwrap_or_default(),
        );
        if !visitor.fields.is_empty() {
            entry = entry.with_fields(serde_json::Value::Object(visitor.fields));
        }
        if let Some(scope) = ctx.event_scope(event) {
            let spans: Vec<&str> = scope.from_root().map(|span| span.name()).collect();
            if !spans.is_empty() {
                entry = entry.with_span(spans.join(" > "));
            }
        }

        // A logging failure must never take the caller down.
        let _ = self.write(&entry);
    }
}

#[derive(Default)]
struct JsonVisitor {
    message: Option<String>,
    fields: serde_json::Map<String, serde_json::Value>,
}

impl JsonVisitor {
    fn insert(&mut self, field: &Field, value: serde_json::Value) {
        self.fields.insert(field.name().to_string(), value);
    }
}

impl Visit for JsonVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let mut buf = String::new();
        let _ = write!(&mut buf, "{:?}", value);
        if field.name() == "message" {
            self.message = Some(buf);
        } else {
            self.insert(field, serde_json::Value::String(buf));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.insert(field, serde_json::Value::String(value.to_string()));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, value.into());
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.insert(field, serde_json::Value::Number(n));
        }
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.insert(field, serde_json::Value::String(value.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::read_entries;
    use tempfile::TempDir;
    use tracing_subscriber::prelude::*;

    #[test]
    fn test_jsonl_layer_captures_events() {
        let temp = TempDir::new().unwrap();
        let layer = JsonlLayer::new(temp.path().join("logs"), "alice").unwrap();
        let log_path = layer.log_path().to_path_buf();
        assert!(log_path.file_name().unwrap().to_string_lossy().ends_with("_alice.jsonl"));

        let subscriber = tracing_subscriber::registry().with(layer);
        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("open", doc_id = "catalog/did:plc:alice");
            let _guard = span.enter();
            tracing::info!("Document opened");
            tracing::warn!(attempt = 3u64, tier = "slow", "Persist failed");
        });

        let entries = read_entries(&log_path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].level, "info");
        assert_eq!(entries[0].instance, "alice");
        assert_eq!(entries[0].msg, "Document opened");
        assert_eq!(entries[0].span.as_deref(), Some("open"));

        let fields = entries[1].fields.as_ref().unwrap();
        assert_eq!(fields["attempt"], 3);
        assert_eq!(fields["tier"], "slow");
    }
}
